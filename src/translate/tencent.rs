//! Tencent Cloud machine translation (`TextTranslateBatch`).
//! Requests are signed with TC3-HMAC-SHA256: canonical request -> string to sign ->
//! key chain (date -> service -> `tc3_request`) -> hex signature.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::http::{build_client, read_body};
use super::{TranslateError, TranslationBackend};

const SERVICE: &str = "tmt";
const ACTION: &str = "TextTranslateBatch";
const API_VERSION: &str = "2018-03-21";
const ALGORITHM: &str = "TC3-HMAC-SHA256";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const SIGNED_HEADERS: &str = "content-type;host";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TencentConfig {
    pub endpoint: String,
    pub region: String,
    #[serde(skip_serializing)]
    pub secret_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub source_lang: String,
    pub target_lang: String,
    pub project_id: i64,
}

impl Default for TencentConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://tmt.tencentcloudapi.com".into(),
            region: "ap-guangzhou".into(),
            secret_id: None,
            secret_key: None,
            source_lang: "auto".into(),
            target_lang: "en".into(),
            project_id: 0,
        }
    }
}

pub struct TencentClient {
    http: reqwest::Client,
    endpoint: String,
    host: String,
    region: String,
    secret_id: String,
    secret_key: String,
    source_lang: String,
    target_lang: String,
    project_id: i64,
}

impl TencentClient {
    pub fn new(config: &TencentConfig, timeout: Duration) -> Result<Self, TranslateError> {
        let secret_id = config
            .secret_id
            .clone()
            .ok_or_else(|| TranslateError::Config("tencent secret_id missing".into()))?;
        let secret_key = config
            .secret_key
            .clone()
            .ok_or_else(|| TranslateError::Config("tencent secret_key missing".into()))?;
        let host = reqwest::Url::parse(&config.endpoint)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| {
                TranslateError::Config(format!("invalid tencent endpoint: {}", config.endpoint))
            })?;

        Ok(Self {
            http: build_client(timeout)?,
            endpoint: config.endpoint.clone(),
            host,
            region: config.region.clone(),
            secret_id,
            secret_key,
            source_lang: config.source_lang.clone(),
            target_lang: config.target_lang.clone(),
            project_id: config.project_id,
        })
    }
}

#[async_trait]
impl TranslationBackend for TencentClient {
    fn name(&self) -> &'static str {
        "tencent"
    }

    async fn request(&self, fragments: &[String]) -> Result<Vec<String>, TranslateError> {
        let payload = build_payload(fragments, &self.source_lang, &self.target_lang, self.project_id)?;
        let timestamp = chrono::Utc::now().timestamp();
        let authorization = sign(
            &self.secret_id,
            &self.secret_key,
            &self.host,
            &payload,
            timestamp,
        )?;

        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", authorization)
            .header("Content-Type", CONTENT_TYPE)
            .header("Host", &self.host)
            .header("X-TC-Action", ACTION)
            .header("X-TC-Version", API_VERSION)
            .header("X-TC-Region", &self.region)
            .header("X-TC-Timestamp", timestamp.to_string())
            .body(payload.clone())
            .send()
            .await?;

        let body = read_body(response).await?;
        debug!(count = fragments.len(), "tencent response received");
        parse_response(&payload, &body, fragments.len())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct BatchRequest<'a> {
    source_text_list: &'a [String],
    source: &'a str,
    target: &'a str,
    project_id: i64,
}

pub(crate) fn build_payload(
    fragments: &[String],
    source: &str,
    target: &str,
    project_id: i64,
) -> Result<String, TranslateError> {
    serde_json::to_string(&BatchRequest {
        source_text_list: fragments,
        source,
        target,
        project_id,
    })
    .map_err(|e| TranslateError::Config(format!("tencent payload: {e}")))
}

/// Build the canonical request for a JSON POST to `/`.
pub(crate) fn canonical_request(host: &str, payload: &str) -> String {
    format!(
        "POST\n/\n\ncontent-type:{CONTENT_TYPE}\nhost:{host}\n\n{SIGNED_HEADERS}\n{}",
        sha256_hex(payload)
    )
}

/// Compute the `Authorization` header value.
pub(crate) fn sign(
    secret_id: &str,
    secret_key: &str,
    host: &str,
    payload: &str,
    timestamp: i64,
) -> Result<String, TranslateError> {
    let date = chrono::DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| TranslateError::Config(format!("invalid timestamp {timestamp}")))?
        .format("%Y-%m-%d")
        .to_string();
    let scope = format!("{date}/{SERVICE}/tc3_request");
    let string_to_sign = format!(
        "{ALGORITHM}\n{timestamp}\n{scope}\n{}",
        sha256_hex(&canonical_request(host, payload))
    );

    let secret_date = hmac_sha256(format!("TC3{secret_key}").as_bytes(), &date)?;
    let secret_service = hmac_sha256(&secret_date, SERVICE)?;
    let secret_signing = hmac_sha256(&secret_service, "tc3_request")?;
    let signature = hex::encode(hmac_sha256(&secret_signing, &string_to_sign)?);

    Ok(format!(
        "{ALGORITHM} Credential={secret_id}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}"
    ))
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

fn hmac_sha256(key: &[u8], message: &str) -> Result<Vec<u8>, TranslateError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| TranslateError::Config(format!("hmac key: {e}")))?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Response")]
    response: BatchResponse,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BatchResponse {
    #[serde(default)]
    target_text_list: Option<Vec<String>>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiError {
    code: String,
    message: String,
}

pub(crate) fn parse_response(
    request: &str,
    body: &str,
    expected: usize,
) -> Result<Vec<String>, TranslateError> {
    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|e| TranslateError::malformed(format!("invalid JSON: {e}"), request, body))?;

    if let Some(err) = envelope.response.error {
        return Err(TranslateError::Api {
            code: err.code,
            message: err.message,
        });
    }

    match envelope.response.target_text_list {
        Some(list) if list.len() == expected => Ok(list),
        Some(list) => Err(TranslateError::malformed(
            format!("expected {expected} translations, got {}", list.len()),
            request,
            body,
        )),
        None => Err(TranslateError::malformed("TargetTextList missing", request, body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str =
        r#"{"SourceTextList":["你好","世界"],"Source":"zh","Target":"en","ProjectId":0}"#;

    #[test]
    fn payload_uses_pascal_case_fields() {
        let fragments = vec!["你好".to_string(), "世界".to_string()];
        assert_eq!(build_payload(&fragments, "zh", "en", 0).unwrap(), PAYLOAD);
    }

    #[test]
    fn signature_matches_reference_vector() {
        let auth = sign(
            "AKIDz8krbsJ5yKBZQpn74WFkmLPx3EXAMPLE",
            "Gu5t9xGARNpq86cd98joQYCN3EXAMPLE",
            "tmt.tencentcloudapi.com",
            PAYLOAD,
            1551113065,
        )
        .unwrap();
        assert_eq!(
            auth,
            "TC3-HMAC-SHA256 Credential=AKIDz8krbsJ5yKBZQpn74WFkmLPx3EXAMPLE/2019-02-25/tmt/tc3_request, \
             SignedHeaders=content-type;host, \
             Signature=95e9acf6f2bbb568100c5af3336c8238f75fb2e154ce9c98ad0e881b1546dd94"
        );
    }

    #[test]
    fn canonical_request_hashes_payload() {
        let canonical = canonical_request("tmt.tencentcloudapi.com", PAYLOAD);
        assert!(canonical.starts_with("POST\n/\n\ncontent-type:application/json; charset=utf-8\n"));
        assert!(canonical
            .ends_with("f573af8ec1dddf7941dc7b81f716d0b2eb8c87ec5e341d55a9d70abf1fe6a3d0"));
    }

    #[test]
    fn parses_target_list() {
        let body = r#"{"Response":{"TargetTextList":["Hello","World"],"RequestId":"r1"}}"#;
        assert_eq!(parse_response(PAYLOAD, body, 2).unwrap(), vec!["Hello", "World"]);
    }

    #[test]
    fn short_list_is_malformed() {
        let body = r#"{"Response":{"TargetTextList":["Hello"],"RequestId":"r1"}}"#;
        let err = parse_response(PAYLOAD, body, 2).unwrap_err();
        match err {
            TranslateError::Malformed { request, response, .. } => {
                assert_eq!(request, PAYLOAD);
                assert_eq!(response, body);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn api_error_is_surfaced() {
        let body = r#"{"Response":{"Error":{"Code":"AuthFailure.SignatureFailure","Message":"bad sig"},"RequestId":"r1"}}"#;
        assert!(matches!(
            parse_response(PAYLOAD, body, 2),
            Err(TranslateError::Api { code, .. }) if code == "AuthFailure.SignatureFailure"
        ));
    }
}
