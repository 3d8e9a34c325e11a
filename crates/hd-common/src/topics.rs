//! Bus topic and consumer-group naming.
//!
//! Channel topics follow `{channel}_notification` so new channels need no
//! code changes anywhere in the pipeline.

/// Topic carrying delayed/retry events before they are staged.
pub const DELAYED_TOPIC: &str = "delayed_notification";

/// Topic carrying terminal status events.
pub const STATUS_TOPIC: &str = "notification_status";

/// Consumer group of the delayed stager.
pub const DELAYED_GROUP: &str = "delayed";

/// Consumer group of the status consumer.
pub const STATUS_GROUP: &str = "status";

/// Bus topic for a channel's notifications.
pub fn channel_topic(channel: &str) -> String {
    format!("{}_notification", channel)
}

/// Consumer group for a channel consumer (named after the channel).
pub fn channel_group(channel: &str) -> String {
    channel.to_string()
}
