//! Single-slot minibatch prefetch.
//!
//! The packer moves into the prefetch task and comes back with the
//! minibatch it produced, so there is never more than one fetch in flight
//! and nothing else can touch the packer while it runs.

use crate::data_loader::error::Result;
use crate::data_loader::packer::{Minibatch, Packer};

use tokio::task::JoinHandle;

/// Where the next minibatch is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPolicy {
    /// On a blocking worker thread, overlapping with the caller.
    Async,
    /// Lazily, on the caller's thread, when the result is awaited.
    Deferred,
}

pub enum PrefetchTask {
    Async(JoinHandle<(Box<dyn Packer>, Result<Minibatch>)>),
    Deferred(Box<dyn Packer>),
}

impl PrefetchTask {
    /// Start producing the next minibatch from `packer`.
    ///
    /// `Async` must be called from inside a tokio runtime.
    pub fn launch(policy: LaunchPolicy, packer: Box<dyn Packer>) -> Self {
        match policy {
            LaunchPolicy::Async => PrefetchTask::Async(tokio::task::spawn_blocking(move || {
                let mut packer = packer;
                let result = packer.read_minibatch();
                (packer, result)
            })),
            LaunchPolicy::Deferred => PrefetchTask::Deferred(packer),
        }
    }

    /// Wait for the minibatch and get the packer back.  A panic inside the
    /// fetch is re-raised here.
    pub async fn wait(self) -> (Box<dyn Packer>, Result<Minibatch>) {
        match self {
            PrefetchTask::Async(handle) => match handle.await {
                Ok(out) => out,
                Err(e) => match e.try_into_panic() {
                    Ok(payload) => std::panic::resume_unwind(payload),
                    // Only runtime shutdown cancels a blocking task.
                    Err(e) => panic!("prefetch task cancelled: {e}"),
                },
            },
            PrefetchTask::Deferred(mut packer) => {
                let result = packer.read_minibatch();
                (packer, result)
            }
        }
    }
}
