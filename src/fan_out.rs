use std::future::Future;

use futures::future::try_join_all;
use tokio::task::JoinHandle;

use crate::error::{Result, SignError};

/// Spawn every job immediately, in order, without awaiting any of them.
///
/// Each job is started as soon as it is produced, so by the time this
/// returns all of them are in flight.
pub fn spawn_all<I, F, T>(jobs: I) -> Vec<JoinHandle<Result<T>>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    jobs.into_iter().map(tokio::spawn).collect()
}

/// Wait for all spawned jobs, or for the first failure.
///
/// On success the outputs are returned in spawn order regardless of
/// completion order. On the first failure that error is returned at once;
/// the remaining jobs are detached and keep running, nobody awaits them.
pub async fn join_all_or_first_error<T>(handles: Vec<JoinHandle<Result<T>>>) -> Result<Vec<T>>
where
    T: Send + 'static,
{
    if handles.is_empty() {
        return Ok(Vec::new());
    }
    try_join_all(handles.into_iter().map(|handle| async move {
        handle
            .await
            .map_err(|err| SignError::remote(format!("dispatch task failed: {err}")))?
    }))
    .await
}
