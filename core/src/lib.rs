//! scout-core - Core model types for the scout service discovery engine
//!
//! This crate provides the foundational types shared between the scout
//! engine and anything that produces or consumes discovered targets:
//!
//! - [`Tags`] - a set of string tokens with signed merge semantics
//! - [`Selector`] - a boolean expression language over tag presence
//! - [`Target`] trait - a single discovered endpoint with stable identity
//! - [`Group`] - a snapshot of targets from one source at one instant
//! - [`Artifact`] - a rendered configuration string with tags
//! - [`hash`] - structural hashing helpers used for target and document identity
//!
//! # Why this crate exists
//!
//! Discoverers (Kubernetes watchers today, other platforms tomorrow) need to
//! construct targets and groups without depending on the engine's pipeline,
//! supervisor, or exporter machinery. Keeping the model here keeps that
//! dependency arrow pointing one way:
//!
//! ```text
//! scout-core ◄── scout-engine
//!     ▲
//!     └────────── future platform discoverers
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod error;
/// Structural hashing for target and document identity
pub mod hash;
mod selector;
mod tags;
/// The target / group / artifact model
pub mod target;

pub use error::ModelError;
pub use selector::Selector;
pub use tags::Tags;
pub use target::{Artifact, Group, Target};
