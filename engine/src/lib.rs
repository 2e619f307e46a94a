//! scout-engine - Pipeline engine and supervisor for scout service discovery
//!
//! The engine watches configuration sources, runs one independent discovery
//! pipeline per configuration document, and keeps the set of live pipelines
//! reconciled as documents appear, change, and disappear.
//!
//! # Architecture
//!
//! ```text
//! Config Sources ──► Supervisor ──► Pipeline_i
//!                                      │
//!                    Discover ──► Tag ──► Build ──► Export ──► sinks
//! ```
//!
//! Each pipeline is an independent tree of tasks scoped to its own
//! cancellation token. All four pipeline stages are pluggable via traits;
//! the stock implementations are the Kubernetes discovery aggregator, the
//! rule-based tag and build managers, and the file/stdout export manager.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod build;
pub mod config;
pub mod discovery;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod provider;
pub mod supervisor;
pub mod tag;

pub use build::BuildManager;
pub use config::{ConfigEvent, PipelineConfig};
pub use discovery::DiscoveryManager;
pub use error::EngineError;
pub use export::ExportManager;
pub use pipeline::{Builder, Discoverer, Exporter, Pipeline, Tagger};
pub use provider::ConfigProvider;
pub use supervisor::{PipelineFactory, Supervisor};
pub use tag::TagManager;
