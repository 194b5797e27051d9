use crate::{
    connector::{ConnectOptions, SocketOptions},
    relay::RelayOptions,
};
use anyhow::Context;
use serde_derive::Deserialize;
use std::{fs::File, path::Path, time::Duration};

/// Validated settings for one run of the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub connect: ConnectOptions,
    pub relay: RelayOptions,
    pub retry: Option<Duration>,
}

/// Settings as given by the user, either in the config file or on the command line.
/// Durations are whole seconds.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct DirtyRelayConfig {
    pub timeout: Option<u64>,
    pub keepalive: Option<bool>,
    pub nodelay: Option<bool>,
    pub retry: Option<u64>,
}

fn seconds(name: &str, value: Option<u64>) -> anyhow::Result<Option<Duration>> {
    match value {
        Some(0) => Err(anyhow::anyhow!("'{}' must be at least one second", name)),
        Some(secs) => Ok(Some(Duration::from_secs(secs))),
        None => Ok(None),
    }
}

impl DirtyRelayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open config file: {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("failed to deserialize config file: {}", path.display()))
    }

    /// Fills missing values from `defaults`, then from the built-in defaults.
    pub fn clean(self, defaults: Option<&DirtyRelayConfig>) -> anyhow::Result<RelayConfig> {
        let timeout = seconds(
            "timeout",
            self.timeout.or_else(|| defaults.and_then(|d| d.timeout)),
        )?;
        let retry = seconds(
            "retry",
            self.retry.or_else(|| defaults.and_then(|d| d.retry)),
        )?;

        let builtin = SocketOptions::default();
        let socket = SocketOptions {
            keepalive: self
                .keepalive
                .or_else(|| defaults.and_then(|d| d.keepalive))
                .unwrap_or(builtin.keepalive),
            nodelay: self
                .nodelay
                .or_else(|| defaults.and_then(|d| d.nodelay))
                .unwrap_or(builtin.nodelay),
        };

        Ok(RelayConfig {
            connect: ConnectOptions { timeout, socket },
            relay: RelayOptions {
                idle_timeout: timeout,
                ..RelayOptions::default()
            },
            retry,
        })
    }
}
