//! Channel registry.
//!
//! Channels are an open set: an entry maps a channel tag to its bus topic,
//! provider, and rate-limit parameters. Nothing in the pipeline hardcodes
//! channel names.

use std::collections::HashMap;
use std::sync::Arc;

use hd_common::topics;

use crate::provider::Provider;

#[derive(Clone)]
pub struct ChannelEntry {
    pub topic: String,
    pub provider: Arc<dyn Provider>,
    pub rate_limit_tokens: u32,
    pub rate_limit_refill_rate: f64,
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, ChannelEntry>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        channel: &str,
        provider: Arc<dyn Provider>,
        rate_limit_tokens: u32,
        rate_limit_refill_rate: f64,
    ) {
        self.channels.insert(
            channel.to_string(),
            ChannelEntry {
                topic: topics::channel_topic(channel),
                provider,
                rate_limit_tokens,
                rate_limit_refill_rate,
            },
        );
    }

    pub fn get(&self, channel: &str) -> Option<&ChannelEntry> {
        self.channels.get(channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = (&String, &ChannelEntry)> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
