//! Client webhook delivery.
//!
//! At most a few bounded retries on 5xx/transport errors, never on 4xx.
//! Bodies are signed with HMAC-SHA256 when a signing key is configured.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, warn};

use hd_common::TerminalStatus;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Herald-Signature";

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub max_retries: u32,
    pub timeout: Duration,
    pub signing_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookPayload {
    pub request_id: String,
    pub notification_id: String,
    pub status: TerminalStatus,
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Delivered,
    /// 4xx from the client endpoint; never retried.
    Rejected(u16),
    /// Retries exhausted on 5xx/transport errors.
    GaveUp(String),
}

pub struct WebhookDispatcher {
    client: reqwest::Client,
    settings: WebhookSettings,
}

impl WebhookDispatcher {
    pub fn new(settings: WebhookSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(settings.timeout)
            .build()?;

        Ok(Self { client, settings })
    }

    /// Deliver the payload. Never returns an error: the outcome is reported
    /// for logging/metrics, but webhooks must not block the pipeline.
    pub async fn deliver(&self, url: &str, payload: &WebhookPayload) -> WebhookOutcome {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => return WebhookOutcome::GaveUp(format!("serialize: {e}")),
        };

        let signature = self.sign(&body);

        let mut last_error = String::new();
        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }

            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .body(body.clone());
            if let Some(signature) = &signature {
                request = request.header(SIGNATURE_HEADER, signature);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!(url = %url, attempt = attempt, "Webhook delivered");
                        return WebhookOutcome::Delivered;
                    }
                    if status.is_client_error() {
                        warn!(url = %url, status = %status, "Webhook rejected; not retrying");
                        return WebhookOutcome::Rejected(status.as_u16());
                    }
                    last_error = format!("status {}", status);
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            warn!(url = %url, attempt = attempt, error = %last_error, "Webhook attempt failed");
        }

        WebhookOutcome::GaveUp(last_error)
    }

    fn sign(&self, body: &[u8]) -> Option<String> {
        let key = self.settings.signing_key.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(body);
        Some(hex::encode(mac.finalize().into_bytes()))
    }
}
