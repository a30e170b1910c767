use std::future::Future;

use tokio::task::JoinHandle;

/// Spawn a task in the background to run a future.
///
/// Returns `None` without running the future if called outside of a tokio runtime, which happens
/// when a cursor or session is dropped after its runtime has shut down.
pub(crate) fn spawn<F, O>(fut: F) -> Option<JoinHandle<O>>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    tokio::runtime::Handle::try_current()
        .ok()
        .map(|handle| handle.spawn(fut))
}
