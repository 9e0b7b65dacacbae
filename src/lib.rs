//! NAT traversal for peer-to-peer nodes.
//!
//! A node classifies its NAT with [`stun`], keeps itself registered with
//! open rendezvous servers and opens direct UDP paths to other natted nodes
//! through [`hole_punch`]. [`traverser::NatTraverser`] ties it together on
//! top of the `natpunch-core` endpoint.

pub mod config;
pub mod error;
pub mod hole_punch;
pub mod protocol;
pub mod rendezvous;
pub mod self_model;
pub mod stun;
pub mod traverser;

pub use error::{Error, Result};
pub use traverser::{Builder, NatTraverser, TraverserEvent};

use async_shutdown::ShutdownManager;
use std::future::Future;

/// Runs an actor until it returns or the node shuts down.
pub(crate) fn spawn_actor<F>(name: &'static str, shutdown_manager: &ShutdownManager<()>, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let fut = shutdown_manager.wrap_cancel(fut);
    tokio::spawn(async move {
        if fut.await.is_err() {
            log::debug!("recv shutdown signal: {name} is shutdown");
        }
    });
}
