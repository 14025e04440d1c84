use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Largest datagram an IPv4 total-length field can describe.
pub const IPV4_MAX_PACKET_LEN: usize = u16::MAX as usize;

/// Smallest useful limit: an IPv4 header plus a TCP header.
const MIN_PACKET_LEN: usize = 40;

/// Tuning for the payload rewriting engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for a rewritten packet, in bytes.
    /// Default: 65535
    pub max_packet_len: usize,
    /// Extra capacity reserved whenever a packet has to grow, at most 65535.
    /// Default: 128
    pub tailroom: usize,
    /// Rewrite TCP sequence/acknowledgment numbers after length changes.
    /// Default: true
    pub adjust_sequence: bool,
    /// Also rewrite SACK blocks in TCP options.
    /// Default: true
    pub adjust_sack: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_packet_len: IPV4_MAX_PACKET_LEN,
            tailroom: 128,
            adjust_sequence: true,
            adjust_sack: true,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_packet_len < MIN_PACKET_LEN {
            return Err(Error::InvalidConfig(format!(
                "max_packet_len {} is below the minimum of {}",
                self.max_packet_len, MIN_PACKET_LEN
            )));
        }
        if self.max_packet_len > IPV4_MAX_PACKET_LEN {
            return Err(Error::InvalidConfig(format!(
                "max_packet_len {} exceeds the IPv4 limit of {}",
                self.max_packet_len, IPV4_MAX_PACKET_LEN
            )));
        }
        if self.tailroom > IPV4_MAX_PACKET_LEN {
            return Err(Error::InvalidConfig(format!(
                "tailroom {} exceeds the IPv4 limit of {}",
                self.tailroom, IPV4_MAX_PACKET_LEN
            )));
        }
        if self.adjust_sack && !self.adjust_sequence {
            return Err(Error::InvalidConfig(
                "adjust_sack requires adjust_sequence".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for EngineConfig.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn max_packet_len(mut self, len: usize) -> Self {
        self.config.max_packet_len = len;
        self
    }

    pub fn tailroom(mut self, bytes: usize) -> Self {
        self.config.tailroom = bytes;
        self
    }

    /// Disable sequence adjustment entirely (also disables SACK rewriting).
    pub fn without_sequence_adjustment(mut self) -> Self {
        self.config.adjust_sequence = false;
        self.config.adjust_sack = false;
        self
    }

    pub fn without_sack_adjustment(mut self) -> Self {
        self.config.adjust_sack = false;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
