//! Configuration sources
//!
//! A provider watches one kind of configuration origin and emits batches of
//! [`ConfigEvent`]s describing documents that appeared, changed, or went
//! away. The supervisor consumes the stream; providers never interpret the
//! documents beyond decoding them.

pub mod file;
pub mod kubernetes;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigEvent;

pub use file::FileProvider;
pub use kubernetes::CmapProvider;

/// A source of configuration events
#[async_trait]
pub trait ConfigProvider: Send + 'static {
    /// Run until cancelled, emitting event batches on `tx`
    async fn run(self: Box<Self>, cancel: CancellationToken, tx: mpsc::Sender<Vec<ConfigEvent>>);
}
