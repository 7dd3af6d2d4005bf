//! OpenAI-compatible chat completion backend.
//! Fragments are packed into the user message with one of four encodings and
//! unpacked from the completion with the same encoding. `parallel` sends one
//! request per fragment with bounded fan-out instead.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{stream, StreamExt, TryStreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::glossary::Glossary;
use super::http::{build_client, read_body};
use super::{with_retry, TranslateError, TranslationBackend};
use crate::config::RetryPolicy;

/// Stand-in for ASCII double quotes when `transliterate_quotes` is on.
const QUOTE_STAND_IN: char = '\u{FF02}';

/// How fragments travel inside one chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatEncoding {
    /// JSON array of `{"id": n, "text": "..."}`.
    #[default]
    Json,
    /// Fragments joined by the configured delimiter.
    Delimited,
    /// Every fragment preceded by `<tag>N<endtag>`.
    Tagged,
    /// One request per fragment, run concurrently.
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Base URL; `/chat/completions` is appended.
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub source_lang: String,
    pub target_lang: String,
    pub encoding: ChatEncoding,
    pub delimiter: String,
    pub tag_open: String,
    pub tag_close: String,
    /// Concurrent requests in `parallel` mode.
    pub max_parallel: usize,
    pub transliterate_quotes: bool,
    pub temperature: f32,
    /// Replaces the built-in system prompt preamble.
    pub system_prompt: Option<String>,
    pub glossary_path: Option<PathBuf>,
    /// Minimum spacing between requests (0 disables the limiter).
    pub min_request_interval_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".into(),
            api_key: None,
            model: "gpt-4o-mini".into(),
            source_lang: "auto".into(),
            target_lang: "en".into(),
            encoding: ChatEncoding::Json,
            delimiter: "|||".into(),
            tag_open: "<t>".into(),
            tag_close: "</t>".into(),
            max_parallel: 4,
            transliterate_quotes: false,
            temperature: 0.1,
            system_prompt: None,
            glossary_path: None,
            min_request_interval_ms: 0,
        }
    }
}

/// Serializes fragments into message content and parses them back.
pub struct ChatCodec {
    encoding: ChatEncoding,
    delimiter: String,
    tag_open: String,
    tag_close: String,
    tag_pattern: Regex,
    transliterate_quotes: bool,
}

#[derive(Serialize, Deserialize)]
struct JsonItem {
    #[serde(default)]
    id: Option<usize>,
    text: String,
}

impl ChatCodec {
    pub fn new(config: &ChatConfig) -> Result<Self, TranslateError> {
        let tag_pattern = Regex::new(&format!(
            r"{}\s*(\d+)\s*{}",
            regex::escape(&config.tag_open),
            regex::escape(&config.tag_close)
        ))
        .map_err(|e| TranslateError::Config(format!("chat tag pattern: {e}")))?;

        Ok(Self {
            encoding: config.encoding,
            delimiter: config.delimiter.clone(),
            tag_open: config.tag_open.clone(),
            tag_close: config.tag_close.clone(),
            tag_pattern,
            transliterate_quotes: config.transliterate_quotes,
        })
    }

    pub fn encoding(&self) -> ChatEncoding {
        self.encoding
    }

    /// Apply quote transliteration before encoding.
    pub fn prepare(&self, fragment: &str) -> String {
        if self.transliterate_quotes {
            fragment.replace('"', &QUOTE_STAND_IN.to_string())
        } else {
            fragment.to_string()
        }
    }

    /// Undo quote transliteration on a parsed translation.
    pub fn restore(&self, translated: String) -> String {
        if self.transliterate_quotes {
            translated.replace(QUOTE_STAND_IN, "\"")
        } else {
            translated
        }
    }

    pub fn encode(&self, fragments: &[String]) -> Result<String, TranslateError> {
        let encoded = match self.encoding {
            ChatEncoding::Json => {
                let items: Vec<JsonItem> = fragments
                    .iter()
                    .enumerate()
                    .map(|(i, text)| JsonItem {
                        id: Some(i),
                        text: text.clone(),
                    })
                    .collect();
                serde_json::to_string(&items)
                    .map_err(|e| TranslateError::Config(format!("chat payload: {e}")))?
            }
            ChatEncoding::Delimited => fragments.join(&format!("\n{}\n", self.delimiter)),
            ChatEncoding::Tagged => fragments
                .iter()
                .enumerate()
                .map(|(i, text)| format!("{}{}{}{}", self.tag_open, i, self.tag_close, text))
                .collect::<Vec<_>>()
                .join("\n"),
            ChatEncoding::Parallel => fragments.concat(),
        };
        Ok(encoded)
    }

    /// Parse completion content. The caller checks the count.
    pub fn decode(&self, content: &str) -> Result<Vec<String>, String> {
        match self.encoding {
            ChatEncoding::Json => decode_json(content),
            ChatEncoding::Delimited => {
                let mut parts: Vec<String> = content
                    .split(self.delimiter.as_str())
                    .map(|p| p.trim().to_string())
                    .collect();
                while parts.last().is_some_and(|p| p.is_empty()) {
                    parts.pop();
                }
                Ok(parts)
            }
            ChatEncoding::Tagged => self.decode_tagged(content),
            ChatEncoding::Parallel => Ok(vec![content.trim().to_string()]),
        }
    }

    fn decode_tagged(&self, content: &str) -> Result<Vec<String>, String> {
        let markers: Vec<(usize, usize, usize)> = self
            .tag_pattern
            .captures_iter(content)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let index = caps.get(1)?.as_str().parse().ok()?;
                Some((index, whole.start(), whole.end()))
            })
            .collect();
        if markers.is_empty() {
            return Err("no position tags in response".into());
        }

        let mut by_index = BTreeMap::new();
        for (n, &(index, _, end)) in markers.iter().enumerate() {
            let stop = markers.get(n + 1).map_or(content.len(), |next| next.1);
            let text = content[end..stop].trim().to_string();
            if by_index.insert(index, text).is_some() {
                return Err(format!("position tag {index} repeated"));
            }
        }
        if by_index.keys().enumerate().any(|(expected, &got)| expected != got) {
            return Err("position tags are not contiguous from 0".into());
        }
        Ok(by_index.into_values().collect())
    }

    /// Format-specific instructions appended to the system prompt.
    fn instructions(&self) -> String {
        match self.encoding {
            ChatEncoding::Json => "The input is a JSON array of objects with `id` and `text`. \
                Translate every `text`, keep every `id`, and reply with a JSON array of the same \
                length and shape. Output only the JSON array."
                .to_string(),
            ChatEncoding::Delimited => format!(
                "The input consists of segments separated by `{}`. Translate each segment and \
                 keep the separators, producing exactly the same number of segments.",
                self.delimiter
            ),
            ChatEncoding::Tagged => format!(
                "Each segment starts with a marker like {open}0{close}. Keep every marker \
                 unchanged and in place, and translate only the text after it.",
                open = self.tag_open,
                close = self.tag_close
            ),
            ChatEncoding::Parallel => String::new(),
        }
    }
}

fn decode_json(content: &str) -> Result<Vec<String>, String> {
    // Tolerate code fences or chatter around the array.
    let start = content.find('[').ok_or("no JSON array in response")?;
    let end = content.rfind(']').ok_or("no JSON array in response")?;
    if end < start {
        return Err("no JSON array in response".into());
    }
    let mut items: Vec<JsonItem> =
        serde_json::from_str(&content[start..=end]).map_err(|e| format!("invalid JSON: {e}"))?;
    if items.iter().all(|item| item.id.is_some()) {
        items.sort_by_key(|item| item.id);
    }
    Ok(items.into_iter().map(|item| item.text).collect())
}

/// Chat completion client with a simple spacing limiter.
pub struct ChatClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
    source_lang: String,
    target_lang: String,
    preamble: Option<String>,
    codec: ChatCodec,
    glossary: Glossary,
    max_parallel: usize,
    /// Next instant a request may start.
    next_allowed: tokio::sync::Mutex<Instant>,
    min_interval: Duration,
}

impl ChatClient {
    pub fn new(config: &ChatConfig, timeout: Duration) -> Result<Self, TranslateError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| TranslateError::Config("chat api_key missing".into()))?;

        let glossary = match &config.glossary_path {
            Some(path) => Glossary::load_from_file(path).unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "glossary load failed, using empty");
                Glossary::empty()
            }),
            None => Glossary::empty(),
        };

        Ok(Self {
            http: build_client(timeout)?,
            url: format!("{}/chat/completions", config.endpoint.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            source_lang: config.source_lang.clone(),
            target_lang: config.target_lang.clone(),
            preamble: config.system_prompt.clone(),
            codec: ChatCodec::new(config)?,
            glossary,
            max_parallel: config.max_parallel.max(1),
            next_allowed: tokio::sync::Mutex::new(Instant::now()),
            min_interval: Duration::from_millis(config.min_request_interval_ms),
        })
    }

    /// Wait until the limiter allows a request.
    async fn rate_limit_wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    fn system_prompt(&self, fragments: &[String]) -> String {
        build_system_prompt(
            self.preamble.as_deref(),
            &self.source_lang,
            &self.target_lang,
            &self.codec,
            &self.glossary,
            fragments,
        )
    }

    /// One chat completion carrying `fragments`.
    async fn complete(&self, fragments: &[String]) -> Result<Vec<String>, TranslateError> {
        self.rate_limit_wait().await;

        let prepared: Vec<String> = fragments.iter().map(|f| self.codec.prepare(f)).collect();
        let content = self.codec.encode(&prepared)?;
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": self.system_prompt(fragments)},
                {"role": "user", "content": content}
            ],
            "temperature": self.temperature,
            "stream": false
        });
        let request_text = body.to_string();

        let response = self
            .http
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;
        let response_text = read_body(response).await?;

        let completion: ChatCompletion = serde_json::from_str(&response_text).map_err(|e| {
            TranslateError::malformed(format!("invalid JSON: {e}"), &request_text, &response_text)
        })?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                TranslateError::malformed("completion has no content", &request_text, &response_text)
            })?;

        let parsed = self
            .codec
            .decode(&content)
            .map_err(|reason| TranslateError::malformed(reason, &request_text, &response_text))?;
        if parsed.len() != fragments.len() {
            return Err(TranslateError::malformed(
                format!("expected {} translations, got {}", fragments.len(), parsed.len()),
                request_text,
                response_text,
            ));
        }

        debug!(count = fragments.len(), encoding = ?self.codec.encoding(), "chat completion parsed");
        Ok(parsed.into_iter().map(|t| self.codec.restore(t)).collect())
    }

    /// One request per fragment, at most `max_parallel` in flight, results in input
    /// order. Any failure fails the whole group.
    async fn complete_parallel(
        &self,
        fragments: &[String],
        policy: Option<&RetryPolicy>,
    ) -> Result<Vec<String>, TranslateError> {
        let results: Vec<Vec<String>> = stream::iter(fragments.to_vec())
            .map(move |fragment| async move {
                let single = std::slice::from_ref(&fragment);
                match policy {
                    Some(policy) => {
                        with_retry(self.name(), policy, 1, || self.complete(single)).await
                    }
                    None => self.complete(single).await,
                }
            })
            .buffered(self.max_parallel)
            .try_collect()
            .await?;
        Ok(results.into_iter().flatten().collect())
    }
}

#[async_trait]
impl TranslationBackend for ChatClient {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn request(&self, fragments: &[String]) -> Result<Vec<String>, TranslateError> {
        match self.codec.encoding() {
            ChatEncoding::Parallel => self.complete_parallel(fragments, None).await,
            _ => self.complete(fragments).await,
        }
    }

    async fn translate(
        &self,
        fragments: &[String],
        policy: &RetryPolicy,
    ) -> Result<Vec<String>, TranslateError> {
        match self.codec.encoding() {
            // Each sub-request retries on its own.
            ChatEncoding::Parallel if !fragments.is_empty() => {
                self.complete_parallel(fragments, Some(policy)).await
            }
            _ => with_retry(self.name(), policy, fragments.len(), || self.complete(fragments)).await,
        }
    }
}

fn build_system_prompt(
    preamble: Option<&str>,
    source_lang: &str,
    target_lang: &str,
    codec: &ChatCodec,
    glossary: &Glossary,
    fragments: &[String],
) -> String {
    let mut prompt = match preamble {
        Some(p) => p.to_string(),
        None if source_lang.eq_ignore_ascii_case("auto") => format!(
            "You are a translator. Translate the user's text into {target_lang}. \
             Output only the translation, nothing else."
        ),
        None => format!(
            "You are a translator. Translate the user's text from {source_lang} into \
             {target_lang}. Output only the translation, nothing else."
        ),
    };

    let instructions = codec.instructions();
    if !instructions.is_empty() {
        prompt.push('\n');
        prompt.push_str(&instructions);
    }

    let terms = glossary.match_entries(fragments);
    if !terms.is_empty() {
        prompt.push_str("\nUse these term translations:");
        for term in terms {
            prompt.push_str(&format!("\n- {} => {}", term.source, term.target));
        }
    }
    prompt
}

// --- Response types ---

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}
