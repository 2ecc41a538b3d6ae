//! HTTP retry helpers for transient upstream errors.
//!
//! Every upstream call goes through [`send_json`], which retries with
//! exponential backoff on connection failures, timeouts, HTTP 429 and
//! HTTP 5xx. Other 4xx responses are permanent and fail immediately.

use std::time::Duration;

use crate::UpstreamError;

/// Maximum length of the response body preview included in errors.
const BODY_PREVIEW_LEN: usize = 300;

/// Retry budget and backoff base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX))
    }
}

/// Sends the request built by `build_request` and parses the body as
/// JSON.
///
/// The closure is called on each attempt since builders are consumed by
/// `.send()`. A body that fails to decode is re-fetched within the same
/// retry budget.
///
/// # Errors
///
/// Returns [`UpstreamError`] if the request still fails after all
/// retries, the server answers with a permanent status, or the body is
/// not JSON.
#[allow(clippy::future_not_send)]
pub async fn send_json<F>(
    build_request: F,
    policy: &RetryPolicy,
) -> Result<serde_json::Value, UpstreamError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 0;
    loop {
        let response = send_inner(&build_request, policy).await?;
        let url = response.url().to_string();
        let status = response.status();

        let decoded = match response.text().await {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                let preview: String = text.chars().take(BODY_PREVIEW_LEN).collect();
                UpstreamError::Response {
                    message: format!("{url} ({status}): invalid JSON: {e}; body: {preview}"),
                }
            }),
            Err(e) => Err(UpstreamError::Http(e)),
        };

        match decoded {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                log::warn!(
                    "Body decode failed (retry {attempt}/{}), re-fetching in {delay:?}: {e}",
                    policy.max_retries
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                log::error!("Giving up on {url}: {e}");
                return Err(e);
            }
        }
    }
}

/// Core retry loop. Returns the first response with a 2xx or 3xx status.
#[allow(clippy::future_not_send)]
async fn send_inner<F>(
    build_request: &F,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, UpstreamError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let max_retries = policy.max_retries;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = policy.delay(attempt);
            log::warn!("  retry {attempt}/{max_retries} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }

        match build_request().send().await {
            Err(e) => {
                if is_transient(&e) && attempt < max_retries {
                    log::warn!("  transient error: {e}");
                    continue;
                }
                return Err(UpstreamError::Http(e));
            }
            Ok(response) => {
                let status = response.status();
                let url = response.url().to_string();

                if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    if attempt < max_retries {
                        log::warn!("  HTTP {status} from {url}");
                        continue;
                    }
                    return Err(UpstreamError::Status {
                        url,
                        status: status.as_u16(),
                        retries: max_retries,
                    });
                }

                if status.is_client_error() {
                    return Err(UpstreamError::Status {
                        url,
                        status: status.as_u16(),
                        retries: attempt,
                    });
                }

                return Ok(response);
            }
        }
    }

    Err(UpstreamError::Response {
        message: "request failed after all retries".to_string(),
    })
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}
