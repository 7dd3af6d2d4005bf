//! Translation backends behind one async contract.
//! Each backend performs single round trips; `with_retry` layers the shared
//! fixed-interval retry loop and the 1:1 length check on top.

pub mod azure;
pub mod backend;
pub mod baidu;
pub mod cache;
pub mod chat;
pub mod fragment;
pub mod glossary;
mod http;
pub mod normalize;
pub mod tencent;

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetryPolicy;

pub use backend::Backend;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("API error {code}: {message}")]
    Api { code: String, message: String },
    /// Payload could not be used. Carries the exchange for diagnostics.
    #[error("malformed response: {reason}")]
    Malformed {
        reason: String,
        request: String,
        response: String,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<TranslateError>,
    },
}

impl TranslateError {
    pub fn malformed(
        reason: impl Into<String>,
        request: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        TranslateError::Malformed {
            reason: reason.into(),
            request: request.into(),
            response: response.into(),
        }
    }
}

impl From<reqwest::Error> for TranslateError {
    fn from(e: reqwest::Error) -> Self {
        TranslateError::Transport(e.to_string())
    }
}

/// A remote translation service.
///
/// `request` performs exactly one exchange and returns one string per input
/// fragment. `translate` wraps it in the retry loop and is what the pipeline calls.
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn request(&self, fragments: &[String]) -> Result<Vec<String>, TranslateError>;

    async fn translate(
        &self,
        fragments: &[String],
        policy: &RetryPolicy,
    ) -> Result<Vec<String>, TranslateError> {
        with_retry(self.name(), policy, fragments.len(), || self.request(fragments)).await
    }
}

/// Runs `attempt` until it yields exactly `expected` strings or the policy is exhausted.
/// Never returns a partial list.
pub async fn with_retry<F, Fut>(
    backend: &str,
    policy: &RetryPolicy,
    expected: usize,
    mut attempt: F,
) -> Result<Vec<String>, TranslateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<String>, TranslateError>>,
{
    if expected == 0 {
        return Ok(Vec::new());
    }

    let max_attempts = policy.max_attempts();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let err = match attempt().await {
            Ok(out) if out.len() == expected => {
                debug!(backend, attempts, count = expected, "translation attempt succeeded");
                return Ok(out);
            }
            Ok(out) => TranslateError::malformed(
                format!("expected {expected} translations, got {}", out.len()),
                "",
                format!("{out:?}"),
            ),
            Err(e) => e,
        };

        match &err {
            TranslateError::Malformed {
                reason,
                request,
                response,
            } => warn!(
                backend,
                attempt = attempts,
                %reason,
                %request,
                %response,
                "malformed translation response"
            ),
            other => warn!(backend, attempt = attempts, error = %other, "translation attempt failed"),
        }

        if attempts >= max_attempts {
            return Err(TranslateError::Exhausted {
                attempts,
                last: Box::new(err),
            });
        }
        tokio::time::sleep(policy.interval()).await;
    }
}
