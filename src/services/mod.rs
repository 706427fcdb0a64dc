pub mod captcha;
pub mod email;

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

/// One poll of a remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Done(T),
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError<E> {
    Failed(E),
    Exhausted,
    Cancelled,
}

/// Call `attempt` up to `retries + 1` times, sleeping `interval` between
/// calls. Cancellation is checked before every call and during every sleep.
pub async fn poll_until<T, E, F, Fut>(
    retries: u32,
    interval: Duration,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
{
    for n in 0..=retries {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        if let Attempt::Done(value) = attempt().await.map_err(PollError::Failed)? {
            return Ok(value);
        }
        if n < retries {
            tokio::select! {
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
    Err(PollError::Exhausted)
}

/// Resolve `path` against the service base URL.
pub(crate) fn endpoint(base_url: &Url, path: &str) -> Result<Url, url::ParseError> {
    base_url.join(path)
}

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent("data-breaker-agent")
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}
