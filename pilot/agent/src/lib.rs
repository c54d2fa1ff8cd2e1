#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Runs the local proxy and keeps it in step with the desired configuration.

mod agent;
pub mod bootstrap;
mod envoy;
mod watcher;

pub use self::{
    agent::{channel, Agent, Handle, Retry, Updates},
    bootstrap::Bootstrap,
    envoy::Envoy,
    watcher::Watcher,
};
use tokio::sync::oneshot;

/// Fires when a running proxy epoch must stop.
pub type Abort = oneshot::Receiver<()>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("proxy failed to start after {attempts} retries: {error}")]
    Fatal { attempts: u32, error: anyhow::Error },
}

/// A proxy that can be restarted with a new configuration.
///
/// Each restart is an epoch. The agent may run several epochs at once while
/// an old one drains.
#[async_trait::async_trait]
pub trait Proxy: Send + Sync + 'static {
    type Config: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static;

    /// Runs one epoch until it exits or `abort` fires.
    async fn run(&self, config: Self::Config, epoch: u32, abort: Abort) -> anyhow::Result<()>;

    /// Releases whatever `run` left behind for `epoch`.
    fn cleanup(&self, epoch: u32);
}
