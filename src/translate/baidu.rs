//! Baidu general text translation.
//! Fragments are joined by newlines into a single `q` query parameter and signed
//! with `md5(appid + q + salt + key)`. The service answers one `trans_result`
//! entry per input line.
//!
//! A fragment that itself contains a newline shifts the line alignment; the
//! count check below catches that as a malformed response.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::http::{build_client, read_body};
use super::{TranslateError, TranslationBackend};

/// Baidu reports success as either no code or this code.
const SUCCESS_CODE: &str = "52000";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaiduConfig {
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub app_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub source_lang: String,
    pub target_lang: String,
}

impl Default for BaiduConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://fanyi-api.baidu.com/api/trans/vip/translate".into(),
            app_id: None,
            secret_key: None,
            source_lang: "auto".into(),
            target_lang: "en".into(),
        }
    }
}

pub struct BaiduClient {
    http: reqwest::Client,
    endpoint: String,
    app_id: String,
    secret_key: String,
    source_lang: String,
    target_lang: String,
}

impl BaiduClient {
    pub fn new(config: &BaiduConfig, timeout: Duration) -> Result<Self, TranslateError> {
        let app_id = config
            .app_id
            .clone()
            .ok_or_else(|| TranslateError::Config("baidu app_id missing".into()))?;
        let secret_key = config
            .secret_key
            .clone()
            .ok_or_else(|| TranslateError::Config("baidu secret_key missing".into()))?;

        Ok(Self {
            http: build_client(timeout)?,
            endpoint: config.endpoint.clone(),
            app_id,
            secret_key,
            source_lang: config.source_lang.clone(),
            target_lang: config.target_lang.clone(),
        })
    }
}

#[async_trait]
impl TranslationBackend for BaiduClient {
    fn name(&self) -> &'static str {
        "baidu"
    }

    async fn request(&self, fragments: &[String]) -> Result<Vec<String>, TranslateError> {
        let query = fragments.join("\n");
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let signature = sign(&self.app_id, &query, &salt, &self.secret_key);

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("q", query.as_str()),
                ("from", self.source_lang.as_str()),
                ("to", self.target_lang.as_str()),
                ("appid", self.app_id.as_str()),
                ("salt", salt.as_str()),
                ("sign", signature.as_str()),
            ])
            .send()
            .await?;

        let body = read_body(response).await?;
        debug!(count = fragments.len(), "baidu response received");
        parse_response(&query, &body, fragments.len())
    }
}

/// Lower-case hex MD5 over the concatenated request parts.
pub(crate) fn sign(app_id: &str, query: &str, salt: &str, secret_key: &str) -> String {
    format!("{:x}", md5::compute(format!("{app_id}{query}{salt}{secret_key}")))
}

#[derive(Deserialize)]
struct BaiduResponse {
    #[serde(default)]
    error_code: Option<serde_json::Value>,
    #[serde(default)]
    error_msg: Option<String>,
    #[serde(default)]
    trans_result: Option<Vec<TransLine>>,
}

#[derive(Deserialize)]
struct TransLine {
    dst: String,
}

pub(crate) fn parse_response(
    query: &str,
    body: &str,
    expected: usize,
) -> Result<Vec<String>, TranslateError> {
    let parsed: BaiduResponse = serde_json::from_str(body)
        .map_err(|e| TranslateError::malformed(format!("invalid JSON: {e}"), query, body))?;

    if let Some(code) = parsed.error_code {
        let code = match code {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        if code != SUCCESS_CODE {
            return Err(TranslateError::Api {
                code,
                message: parsed.error_msg.unwrap_or_default(),
            });
        }
    }

    let lines: Vec<String> = parsed
        .trans_result
        .ok_or_else(|| TranslateError::malformed("trans_result missing", query, body))?
        .into_iter()
        .map(|line| line.dst)
        .collect();

    if lines.len() != expected {
        return Err(TranslateError::malformed(
            format!("expected {expected} lines, got {}", lines.len()),
            query,
            body,
        ));
    }
    Ok(lines)
}
