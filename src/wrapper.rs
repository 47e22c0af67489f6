use crate::error::LimitError;
use crate::priority::Priority;
use crate::registry::LimiterRegistry;
use std::future::Future;
use std::time::Instant;
use tracing::debug;

/// Acquire a token for `endpoint`, run `operation`, and report how it went.
///
/// The operation is never started when admission is refused. Its duration and
/// outcome are fed back to the endpoint's limiter whether it succeeds or
/// fails, and its error is returned unchanged inside [`LimitError::Operation`].
pub async fn run_with_limit<F, Fut, T, E>(
    registry: &LimiterRegistry,
    endpoint: &str,
    priority: Priority,
    deadline: Option<Instant>,
    operation: F,
) -> Result<T, LimitError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let limiter = registry.limiter(endpoint).map_err(LimitError::Limiter)?;

    if !limiter.acquire(priority, deadline, None).await {
        debug!(endpoint, priority = %priority, "admission refused");
        return Err(LimitError::Rejected {
            endpoint: endpoint.to_string(),
            priority,
        });
    }

    let started = Instant::now();
    let result = operation().await;
    limiter.record_response(started.elapsed(), result.is_ok(), priority);

    result.map_err(LimitError::Operation)
}
