//! Store index bootstrap.
//!
//! Run once at startup by the ingest server. The load-bearing index is the
//! partial unique index on (request_id, channel): it excludes failed rows so
//! a client may retry a failed request with the same id, while any live row
//! for the pair makes a second submit a conflict.

use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Database, IndexModel};
use tracing::info;

use hd_common::NotificationStatus;

pub async fn ensure_indexes(db: &Database) -> mongodb::error::Result<()> {
    let notifications = db.collection::<mongodb::bson::Document>("notifications");

    let live_statuses = vec![
        NotificationStatus::Pending.as_str(),
        NotificationStatus::Processing.as_str(),
        NotificationStatus::Delivered.as_str(),
    ];

    let unique_request_channel = IndexModel::builder()
        .keys(doc! { "request_id": 1, "channel": 1 })
        .options(
            IndexOptions::builder()
                .name("uniq_request_channel_live".to_string())
                .unique(true)
                .partial_filter_expression(doc! { "status": { "$in": live_statuses } })
                .build(),
        )
        .build();

    let status_updated = IndexModel::builder()
        .keys(doc! { "status": 1, "updated_at": 1 })
        .options(IndexOptions::builder().name("idx_status_updated".to_string()).build())
        .build();

    notifications
        .create_indexes([unique_request_channel, status_updated])
        .await?;

    let outbox = db.collection::<mongodb::bson::Document>("outbox");
    let outbox_status_created = IndexModel::builder()
        .keys(doc! { "status": 1, "created_at": 1 })
        .options(IndexOptions::builder().name("idx_status_created".to_string()).build())
        .build();
    let outbox_claimed_at = IndexModel::builder()
        .keys(doc! { "claimed_at": 1 })
        .options(IndexOptions::builder().name("idx_claimed_at".to_string()).build())
        .build();
    outbox
        .create_indexes([outbox_status_created, outbox_claimed_at])
        .await?;

    let status_outbox = db.collection::<mongodb::bson::Document>("status_outbox");
    let status_outbox_processed = IndexModel::builder()
        .keys(doc! { "processed": 1, "created_at": 1 })
        .options(IndexOptions::builder().name("idx_processed_created".to_string()).build())
        .build();
    status_outbox.create_indexes([status_outbox_processed]).await?;

    let alerts = db.collection::<mongodb::bson::Document>("alerts");
    let unique_alert = IndexModel::builder()
        .keys(doc! { "notification_id": 1, "kind": 1 })
        .options(
            IndexOptions::builder()
                .name("uniq_notification_kind".to_string())
                .unique(true)
                .build(),
        )
        .build();
    alerts.create_indexes([unique_alert]).await?;

    info!("Store indexes ensured");
    Ok(())
}
