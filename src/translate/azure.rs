//! Azure Translator v3: one POST carrying an array of `{"Text": ...}` objects.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::http::{build_client, read_body};
use super::{TranslateError, TranslationBackend};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub endpoint: String,
    pub region: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// `None` lets the service detect the source language.
    pub source_lang: Option<String>,
    pub target_lang: String,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.cognitive.microsofttranslator.com".into(),
            region: None,
            api_key: None,
            source_lang: None,
            target_lang: "en".into(),
        }
    }
}

pub struct AzureClient {
    http: reqwest::Client,
    url: String,
    region: Option<String>,
    api_key: String,
    source_lang: Option<String>,
    target_lang: String,
}

impl AzureClient {
    pub fn new(config: &AzureConfig, timeout: Duration) -> Result<Self, TranslateError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| TranslateError::Config("azure api_key missing".into()))?;

        Ok(Self {
            http: build_client(timeout)?,
            url: format!("{}/translate", config.endpoint.trim_end_matches('/')),
            region: config.region.clone(),
            api_key,
            source_lang: config.source_lang.clone(),
            target_lang: config.target_lang.clone(),
        })
    }
}

#[async_trait]
impl TranslationBackend for AzureClient {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn request(&self, fragments: &[String]) -> Result<Vec<String>, TranslateError> {
        let payload = build_payload(fragments)?;

        let mut query = vec![("api-version", "3.0"), ("to", self.target_lang.as_str())];
        if let Some(from) = self.source_lang.as_deref() {
            query.push(("from", from));
        }

        let mut request = self
            .http
            .post(&self.url)
            .query(&query)
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .header("Content-Type", "application/json");
        if let Some(region) = self.region.as_deref() {
            request = request.header("Ocp-Apim-Subscription-Region", region);
        }

        let response = request.body(payload.clone()).send().await?;
        let body = read_body(response).await?;
        debug!(count = fragments.len(), "azure response received");
        parse_response(&payload, &body, fragments.len())
    }
}

#[derive(Serialize)]
struct TextItem<'a> {
    #[serde(rename = "Text")]
    text: &'a str,
}

pub(crate) fn build_payload(fragments: &[String]) -> Result<String, TranslateError> {
    let items: Vec<TextItem<'_>> = fragments.iter().map(|f| TextItem { text: f }).collect();
    serde_json::to_string(&items).map_err(|e| TranslateError::Config(format!("azure payload: {e}")))
}

#[derive(Deserialize)]
struct ResultItem {
    #[serde(default)]
    translations: Vec<Translation>,
}

#[derive(Deserialize)]
struct Translation {
    text: String,
}

/// Flatten to the first translation of every item, keeping input order.
pub(crate) fn parse_response(
    request: &str,
    body: &str,
    expected: usize,
) -> Result<Vec<String>, TranslateError> {
    let items: Vec<ResultItem> = serde_json::from_str(body)
        .map_err(|e| TranslateError::malformed(format!("invalid JSON: {e}"), request, body))?;

    if items.len() != expected {
        return Err(TranslateError::malformed(
            format!("expected {expected} items, got {}", items.len()),
            request,
            body,
        ));
    }

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            item.translations
                .into_iter()
                .next()
                .map(|t| t.text)
                .ok_or_else(|| {
                    TranslateError::malformed(format!("item {i} has no translations"), request, body)
                })
        })
        .collect()
}
