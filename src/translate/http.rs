//! Shared reqwest plumbing for the REST backends.

use std::time::Duration;

use super::TranslateError;

/// Pooled client with the configured request timeout.
pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client, TranslateError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(timeout)
        .build()
        .map_err(|e| TranslateError::Transport(e.to_string()))
}

/// Read the body as text; non-2xx statuses become `TranslateError::Status`.
pub(crate) async fn read_body(response: reqwest::Response) -> Result<String, TranslateError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(TranslateError::Status {
            status: status.as_u16(),
            body: truncate(&body, 200),
        });
    }
    Ok(body)
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
