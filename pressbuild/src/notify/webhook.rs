//! Webhook notifier

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, error};
use url::Url;

use crate::errors::ProvisionError;
use crate::notify::{FailureNotice, Notifier};

/// POSTs each notice as JSON to a fixed URL
pub struct WebhookNotifier {
    client: Client,
    url: Url,
}

impl WebhookNotifier {
    /// Create a notifier; only `http` and `https` URLs are accepted
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ProvisionError> {
        let url = Url::parse(url)
            .map_err(|e| ProvisionError::ConfigError(format!("invalid webhook URL: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProvisionError::ConfigError(format!(
                "unsupported webhook scheme: {}",
                url.scheme()
            )));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn phase_failed(&self, notice: &FailureNotice) -> Result<(), ProvisionError> {
        debug!(website_id = %notice.website_id, "POST failure notice");

        let response = self.client.post(self.url.clone()).json(notice).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Webhook rejected notice: {} - {}", status, body);
            return Err(ProvisionError::ServerError(format!("webhook returned {}", status)));
        }
        Ok(())
    }
}
