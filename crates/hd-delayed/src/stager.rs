//! Delayed-topic consumer.
//!
//! Stages each delayed event into the ordered set with its due instant as
//! the score. The member is the raw payload, so a redelivered event lands on
//! the identical member and staging stays idempotent. The offset commits
//! only after the cache write.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use hd_bus::{BusConsumer, IncomingMessage};
use hd_cache::DelayedStore;
use hd_common::DelayedMessage;

use crate::DelayedError;

pub struct DelayedStager {
    consumer: Arc<dyn BusConsumer>,
    store: Arc<dyn DelayedStore>,
}

impl DelayedStager {
    pub fn new(consumer: Arc<dyn BusConsumer>, store: Arc<dyn DelayedStore>) -> Self {
        Self { consumer, store }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting delayed stager");

        loop {
            tokio::select! {
                received = self.consumer.next() => {
                    match received {
                        Ok(message) => {
                            if let Err(e) = self.handle_message(&message).await {
                                error!(
                                    error = %e,
                                    "Staging failed; message left uncommitted for redelivery"
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
                    info!("Delayed stager shutting down");
                    break;
                }
            }
        }
    }

    pub async fn handle_message(&self, incoming: &IncomingMessage) -> Result<(), DelayedError> {
        let member = match std::str::from_utf8(&incoming.payload) {
            Ok(member) => member,
            Err(e) => {
                warn!(offset = incoming.offset, error = %e, "Dropping non-UTF-8 delayed event");
                self.consumer.commit(incoming).await?;
                return Ok(());
            }
        };

        let event: DelayedMessage = match serde_json::from_str(member) {
            Ok(event) => event,
            Err(e) => {
                warn!(offset = incoming.offset, error = %e, "Dropping malformed delayed event");
                metrics::counter!("delayed.poison_pills_total").increment(1);
                self.consumer.commit(incoming).await?;
                return Ok(());
            }
        };

        self.store.stage(member, event.scheduled_at).await?;
        self.consumer.commit(incoming).await?;

        metrics::counter!("delayed.staged_total").increment(1);
        debug!(
            notification_id = %event.message.notification_id,
            scheduled_at = event.scheduled_at,
            "Staged delayed event"
        );
        Ok(())
    }
}
