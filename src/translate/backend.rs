//! Closed set of built-in backends, selected once from configuration.

use std::time::Duration;

use async_trait::async_trait;

use super::azure::AzureClient;
use super::baidu::BaiduClient;
use super::chat::ChatClient;
use super::tencent::TencentClient;
use super::{with_retry, TranslateError, TranslationBackend};
use crate::config::{BackendConfig, RetryPolicy};

pub enum Backend {
    Tencent(TencentClient),
    Baidu(BaiduClient),
    Azure(AzureClient),
    Chat(ChatClient),
}

impl Backend {
    pub fn from_config(config: &BackendConfig, timeout: Duration) -> Result<Self, TranslateError> {
        Ok(match config {
            BackendConfig::Tencent(c) => Backend::Tencent(TencentClient::new(c, timeout)?),
            BackendConfig::Baidu(c) => Backend::Baidu(BaiduClient::new(c, timeout)?),
            BackendConfig::Azure(c) => Backend::Azure(AzureClient::new(c, timeout)?),
            BackendConfig::Chat(c) => Backend::Chat(ChatClient::new(c, timeout)?),
        })
    }

    fn inner(&self) -> &dyn TranslationBackend {
        match self {
            Backend::Tencent(b) => b,
            Backend::Baidu(b) => b,
            Backend::Azure(b) => b,
            Backend::Chat(b) => b,
        }
    }
}

#[async_trait]
impl TranslationBackend for Backend {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    async fn request(&self, fragments: &[String]) -> Result<Vec<String>, TranslateError> {
        self.inner().request(fragments).await
    }

    async fn translate(
        &self,
        fragments: &[String],
        policy: &RetryPolicy,
    ) -> Result<Vec<String>, TranslateError> {
        match self {
            // Parallel chat mode retries per sub-request.
            Backend::Chat(chat) => chat.translate(fragments, policy).await,
            _ => with_retry(self.name(), policy, fragments.len(), || self.request(fragments)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::azure::AzureConfig;
    use crate::translate::chat::ChatConfig;

    #[test]
    fn selects_configured_variant() {
        let config = BackendConfig::Azure(AzureConfig {
            api_key: Some("key".into()),
            ..AzureConfig::default()
        });
        let backend = Backend::from_config(&config, Duration::from_secs(5)).unwrap();
        assert_eq!(backend.name(), "azure");
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let config = BackendConfig::Chat(ChatConfig::default());
        assert!(matches!(
            Backend::from_config(&config, Duration::from_secs(5)),
            Err(TranslateError::Config(_))
        ));
    }
}
