//! Static channel catalog
//!
//! Channels are fixed at startup and never change while the server runs.
//! Each one carries the policy checked on every subscribe attempt and the
//! broadcast rate limit enforced by the registry.

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelConfig {
    pub name: String,
    pub description: String,
    pub requires_auth: bool,
    /// Broadcasts allowed per second; `0` means unlimited.
    pub rate_limit: u32,
    pub max_subscribers: Option<usize>,
}

impl ChannelConfig {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            requires_auth: false,
            rate_limit: 0,
            max_subscribers: None,
        }
    }

    pub fn requires_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit = per_second;
        self
    }

    pub fn max_subscribers(mut self, max: usize) -> Self {
        self.max_subscribers = Some(max);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ChannelCatalog {
    channels: BTreeMap<String, ChannelConfig>,
}

impl ChannelCatalog {
    pub fn new(channels: impl IntoIterator<Item = ChannelConfig>) -> Self {
        Self {
            channels: channels
                .into_iter()
                .map(|config| (config.name.clone(), config))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Channels in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for ChannelCatalog {
    fn default() -> Self {
        Self::new([
            ChannelConfig::new("market_status", "Market open, close and halt notices")
                .rate_limit(10),
            ChannelConfig::new("news", "Headline stream, optionally per symbol")
                .rate_limit(50)
                .max_subscribers(500),
            ChannelConfig::new("executions", "Fills from the brokerage ledger")
                .requires_auth()
                .rate_limit(100)
                .max_subscribers(100),
            ChannelConfig::new("alerts", "Account risk and margin alerts")
                .requires_auth()
                .rate_limit(20),
        ])
    }
}
