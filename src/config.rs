//! Controller configuration

use anyhow::{Context, Result};
use bluer::Address;
use std::time::Duration;

/// Size of the outbound test payload, in bytes.
pub const DEFAULT_PAYLOAD_SIZE: usize = 512;

/// Tag attached to echo writes so their confirmations are distinguishable
/// from paced rotation writes, which carry the handle value as tag.
pub const ECHO_WRITE_TAG: i32 = 666;

/// Configuration for the connection controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Ordered target peer list the bond/connect cursors index into.
    pub targets: Vec<Address>,
    /// Size of the shared outbound payload buffer.
    pub payload_size: usize,
    /// Tag attached to echoed inbound data.
    pub echo_tag: i32,
    /// Pacing delay between a write confirmation and the next rotation write.
    pub write_delay: Duration,
    /// Delay between bond attempts within one batch.
    pub bond_retry_delay: Duration,
    /// Delay between chained disconnect requests during bulk teardown.
    pub disconnect_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            targets: default_targets(),
            payload_size: DEFAULT_PAYLOAD_SIZE,
            echo_tag: ECHO_WRITE_TAG,
            write_delay: Duration::from_millis(10),
            bond_retry_delay: Duration::from_millis(1000),
            disconnect_delay: Duration::from_millis(1500),
        }
    }
}

impl ControllerConfig {
    /// Build a config, taking the target list from `SPP_TARGETS`
    /// (comma-separated Bluetooth addresses) when set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("SPP_TARGETS") {
            config.targets = raw
                .split(',')
                .map(|s| {
                    s.trim()
                        .parse::<Address>()
                        .with_context(|| format!("invalid peer address {:?}", s.trim()))
                })
                .collect::<Result<Vec<_>>>()?;
        }
        Ok(config)
    }
}

/// Well-known test device addresses, used when no target list is configured.
fn default_targets() -> Vec<Address> {
    vec![
        Address::new([0x78, 0xA5, 0x04, 0x2F, 0x4A, 0xDE]),
        Address::new([0x78, 0xA5, 0x04, 0x2F, 0x4A, 0xED]),
        Address::new([0x78, 0xA5, 0x04, 0x2F, 0x02, 0x60]),
        Address::new([0x78, 0xA5, 0x04, 0x2F, 0x03, 0x06]),
        Address::new([0x00, 0x12, 0xF3, 0x27, 0x46, 0xF6]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MAX_PEERS;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert!(!config.targets.is_empty());
        assert!(config.targets.len() <= MAX_PEERS);
        assert_eq!(config.payload_size, DEFAULT_PAYLOAD_SIZE);
        assert_eq!(config.echo_tag, ECHO_WRITE_TAG);
    }

    #[test]
    fn test_address_parsing() {
        let parsed: Address = "78:A5:04:2F:4A:DE".parse().unwrap();
        assert_eq!(parsed, Address::new([0x78, 0xA5, 0x04, 0x2F, 0x4A, 0xDE]));
    }
}
