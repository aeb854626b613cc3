//! Engine configuration.
//!
//! Every tunable has the protocol's standard value as its default, so an
//! empty TOML document yields a working configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Tunables for one [`Udx`](crate::Udx) instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdxConfig {
    /// Default time-to-live of outgoing datagrams
    pub ttl: u32,

    /// Kernel send and receive buffer size applied at bind
    pub buffer_size: usize,

    /// Transmissions of one packet before the stream times out
    pub max_transmits: u8,

    /// Queued bytes beyond one window before writes report back-pressure
    pub high_watermark: usize,

    /// Initial congestion window in packets
    pub initial_cwnd: u32,

    /// Initial slow start threshold in packets
    pub initial_ssthresh: u32,

    /// Congestion window cap in packets
    pub max_cwnd: u32,

    /// Lower bound of the retransmission timeout (ms)
    pub min_rto_ms: u32,

    /// Retransmission timeout before the first RTT sample (ms)
    pub initial_rto_ms: u32,

    /// Clock granularity used in the RTO formula (ms)
    pub clock_granularity_ms: u32,

    /// Period of the shared timeout timer (ms)
    pub timer_interval_ms: u64,

    /// MTU assumed before any probe succeeds
    pub mtu_base: u16,

    /// Largest MTU probed for
    pub mtu_max: u16,

    /// Probe size increment
    pub mtu_step: u16,

    /// Lost probes of one size before the search stops
    pub mtu_max_probes: u8,

    /// Datagrams per batched send
    pub send_batch_size: usize,

    /// Receive buffer for one datagram
    pub recv_buffer_size: usize,

    /// Write fragments combined into one packet
    pub max_combined_writes: usize,
}

impl Default for UdxConfig {
    fn default() -> Self {
        Self {
            ttl: 64,
            buffer_size: 212_992,
            max_transmits: 6,
            high_watermark: 262_144,
            initial_cwnd: 3,
            initial_ssthresh: 255,
            max_cwnd: 65_536,
            min_rto_ms: 1000,
            initial_rto_ms: 1000,
            clock_granularity_ms: 20,
            timer_interval_ms: 20,
            mtu_base: 1200,
            mtu_max: 1500,
            mtu_step: 32,
            mtu_max_probes: 3,
            send_batch_size: 20,
            recv_buffer_size: 2048,
            max_combined_writes: 1000,
        }
    }
}

impl UdxConfig {
    /// Parse a TOML document, filling unset keys with defaults
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` on malformed TOML or invalid values.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as a TOML document
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Reject values the engine cannot run with
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.ttl == 0 || self.ttl > 255 {
            return Err(Error::InvalidConfig("ttl must be within 1..=255".into()));
        }
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig("buffer_size must be non-zero".into()));
        }
        if self.max_transmits == 0 {
            return Err(Error::InvalidConfig("max_transmits must be non-zero".into()));
        }
        if self.initial_cwnd < 2 || self.initial_cwnd > self.max_cwnd {
            return Err(Error::InvalidConfig(
                "initial_cwnd must be within 2..=max_cwnd".into(),
            ));
        }
        if self.initial_ssthresh < self.initial_cwnd {
            return Err(Error::InvalidConfig(
                "initial_ssthresh must not be below initial_cwnd".into(),
            ));
        }
        // The smallest MTU still leaves payload room after IPv6, UDP and UDX headers
        if self.mtu_base < 576 || self.mtu_max < self.mtu_base {
            return Err(Error::InvalidConfig(
                "mtu_base must be at least 576 and not above mtu_max".into(),
            ));
        }
        if self.mtu_step == 0 {
            return Err(Error::InvalidConfig("mtu_step must be non-zero".into()));
        }
        if self.timer_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "timer_interval_ms must be non-zero".into(),
            ));
        }
        if self.send_batch_size == 0 || self.max_combined_writes == 0 {
            return Err(Error::InvalidConfig(
                "send_batch_size and max_combined_writes must be non-zero".into(),
            ));
        }
        if self.recv_buffer_size < usize::from(self.mtu_max) {
            return Err(Error::InvalidConfig(
                "recv_buffer_size must hold a datagram of mtu_max bytes".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = UdxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.high_watermark, 262_144);
        assert_eq!(config.mtu_base, 1200);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = UdxConfig::from_toml("max_transmits = 8\nmtu_max = 1400\n").unwrap();
        assert_eq!(config.max_transmits, 8);
        assert_eq!(config.mtu_max, 1400);
        assert_eq!(config.ttl, 64);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = UdxConfig {
            initial_cwnd: 10,
            ..UdxConfig::default()
        };
        let text = config.to_toml().unwrap();
        assert_eq!(UdxConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            UdxConfig {
                ttl: 0,
                ..UdxConfig::default()
            },
            UdxConfig {
                initial_cwnd: 1,
                ..UdxConfig::default()
            },
            UdxConfig {
                mtu_base: 1600,
                ..UdxConfig::default()
            },
            UdxConfig {
                mtu_step: 0,
                ..UdxConfig::default()
            },
            UdxConfig {
                recv_buffer_size: 512,
                ..UdxConfig::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            UdxConfig::from_toml("ttl = \"high\""),
            Err(Error::InvalidConfig(_))
        ));
    }
}
