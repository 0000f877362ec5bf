//! Fire-and-forget background work

use std::future::Future;

use tokio::task::JoinHandle;

use simdemon_core::prelude::*;

/// Run `future` in the background, logging its failure instead of propagating it
pub fn spawn_detached<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match future.await {
            Ok(()) => trace!("{} finished", name),
            Err(Error::BuildCancelled) => debug!("{} cancelled", name),
            Err(e) => error!("{} failed: {}", name, e),
        }
    })
}
