//! Provider capability.
//!
//! The core never knows how a channel actually delivers; it only consumes
//! `Provider::send`. Concrete SMTP/messaging adapters live outside this
//! repository — the HTTP provider here covers gateways that expose a
//! delivery endpoint, and doubles as the reference implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Categorized send failure. The pipeline currently schedules a retry for
/// both variants; the split exists so providers can report accurately.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("permanent send failure: {0}")]
    Permanent(String),

    #[error("retryable send failure: {0}")]
    Retryable(String),
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        recipient: &HashMap<String, serde_json::Value>,
        content: &HashMap<String, serde_json::Value>,
        variables: &HashMap<String, String>,
    ) -> Result<(), SendError>;
}

/// Provider that posts the delivery to an HTTP gateway.
///
/// 4xx responses are configuration errors and permanent; 5xx and transport
/// errors are retryable.
pub struct HttpProvider {
    name: String,
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpProvider {
    pub fn new(
        name: &str,
        endpoint: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            name: name.to_string(),
            client,
            endpoint: endpoint.to_string(),
            token,
        })
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        recipient: &HashMap<String, serde_json::Value>,
        content: &HashMap<String, serde_json::Value>,
        variables: &HashMap<String, String>,
    ) -> Result<(), SendError> {
        let body = serde_json::json!({
            "recipient": recipient,
            "content": content,
            "variables": variables,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SendError::Retryable(format!("provider unreachable: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(provider = %self.name, "Provider accepted delivery");
            return Ok(());
        }

        let message = format!("provider returned {}", status);
        if status.is_client_error() {
            Err(SendError::Permanent(message))
        } else {
            Err(SendError::Retryable(message))
        }
    }
}
