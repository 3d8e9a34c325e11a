//! Status consumer.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use hd_bus::{BusConsumer, IncomingMessage};
use hd_common::StatusMessage;

use crate::store::StatusStore;
use crate::webhook::{WebhookDispatcher, WebhookOutcome, WebhookPayload};
use crate::StatusError;

pub struct StatusWorker {
    consumer: Arc<dyn BusConsumer>,
    store: Arc<dyn StatusStore>,
    webhook: Arc<WebhookDispatcher>,
}

impl StatusWorker {
    pub fn new(
        consumer: Arc<dyn BusConsumer>,
        store: Arc<dyn StatusStore>,
        webhook: Arc<WebhookDispatcher>,
    ) -> Self {
        Self {
            consumer,
            store,
            webhook,
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting status consumer");

        loop {
            tokio::select! {
                received = self.consumer.next() => {
                    match received {
                        Ok(message) => {
                            if let Err(e) = self.handle_message(&message).await {
                                error!(
                                    error = %e,
                                    "Status handler failed; message left uncommitted for redelivery"
                                );
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Consumer receive failed");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Status consumer shutting down");
                    break;
                }
            }
        }
    }

    pub async fn handle_message(&self, incoming: &IncomingMessage) -> Result<(), StatusError> {
        let status: StatusMessage = match serde_json::from_slice(&incoming.payload) {
            Ok(status) => status,
            Err(e) => {
                warn!(offset = incoming.offset, error = %e, "Dropping malformed status event");
                metrics::counter!("status.poison_pills_total").increment(1);
                self.consumer.commit(incoming).await?;
                return Ok(());
            }
        };

        // Store first. A failure here leaves the offset uncommitted so the
        // event is redelivered; applying a terminal status twice is harmless.
        self.store
            .apply_status(
                &status.notification_id,
                status.status,
                status.message.as_deref(),
            )
            .await?;

        metrics::counter!("status.applied_total", "status" => format!("{:?}", status.status))
            .increment(1);

        if let Some(url) = &status.webhook_url {
            let payload = WebhookPayload {
                request_id: status.request_id.clone(),
                notification_id: status.notification_id.clone(),
                status: status.status,
                channel: status.channel.clone(),
                message: status.message.clone(),
                occurred_at: status.occurred_at,
            };

            match self.webhook.deliver(url, &payload).await {
                WebhookOutcome::Delivered => {
                    metrics::counter!("status.webhooks_delivered_total").increment(1);
                }
                WebhookOutcome::Rejected(code) => {
                    metrics::counter!("status.webhooks_rejected_total").increment(1);
                    warn!(
                        notification_id = %status.notification_id,
                        code = code,
                        "Client webhook rejected the callback"
                    );
                }
                WebhookOutcome::GaveUp(reason) => {
                    metrics::counter!("status.webhooks_failed_total").increment(1);
                    warn!(
                        notification_id = %status.notification_id,
                        reason = %reason,
                        "Gave up delivering webhook"
                    );
                }
            }
        }

        self.consumer.commit(incoming).await?;

        debug!(
            notification_id = %status.notification_id,
            status = ?status.status,
            "Status applied"
        );
        Ok(())
    }
}
