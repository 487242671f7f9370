//! Bounded parallel map with aggregated failures.

use crate::error::ErrorList;
use futures::future::join_all;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::error;

/// Result of a fan-out: every successful output plus every failure.
#[derive(Debug)]
pub struct FanOutReport<T> {
    pub succeeded: Vec<T>,
    pub errors: ErrorList,
}

impl<T> FanOutReport<T> {
    /// Successful outputs if nothing failed, the aggregated failures otherwise.
    pub fn into_result(self) -> Result<Vec<T>, ErrorList> {
        if self.errors.is_empty() {
            Ok(self.succeeded)
        } else {
            Err(self.errors)
        }
    }
}

/// Run `task` for every item on its own tokio task, at most `limit` at a time,
/// and join them all.
///
/// A failing or panicking task never aborts its siblings; each failure is
/// recorded in the report under the item's key.
pub async fn fan_out<I, K, F, Fut, T, E>(
    description: &str,
    items: I,
    limit: usize,
    key_of: K,
    task: F,
) -> FanOutReport<T>
where
    I: IntoIterator,
    K: Fn(&I::Item) -> String,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut handles = Vec::new();

    for item in items {
        let key = key_of(&item);
        let semaphore = Arc::clone(&semaphore);
        let fut = task(item);
        let handle = tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => return Err(format!("failed to acquire fan-out permit: {err}")),
            };
            fut.await.map_err(|e| e.to_string())
        });
        handles.push((key, handle));
    }

    let mut report = FanOutReport {
        succeeded: Vec::with_capacity(handles.len()),
        errors: ErrorList::new(description),
    };
    let joined = join_all(
        handles
            .into_iter()
            .map(|(key, handle)| async move { (key, handle.await) }),
    )
    .await;
    for (key, result) in joined {
        match result {
            Ok(Ok(value)) => report.succeeded.push(value),
            Ok(Err(e)) => report.errors.push_keyed(&key, e),
            Err(join_err) => {
                error!(key = %key, error = %join_err, "fan-out task join failed");
                report
                    .errors
                    .push_keyed(&key, format!("task join failed: {join_err}"));
            }
        }
    }
    report
}
