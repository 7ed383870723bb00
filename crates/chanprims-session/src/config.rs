use std::collections::HashSet;

use chanprims_alloc::{channel::is_control, DEFAULT_CHANNEL_MAX};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

const MAX_NAME_LEN: usize = 128;

/// Configuration for a connection's session manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Local channel limit. 0 means no limit.
    pub channel_max: u16,
    /// Channels taken at startup for protocol-level use. They stay allocated
    /// for the connection's lifetime and are never handed to sessions.
    #[serde(alias = "reserve_builtin")]
    pub reserved_channels: Vec<u16>,
    /// Connection label used in log output.
    pub name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_max: DEFAULT_CHANNEL_MAX,
            reserved_channels: Vec::new(),
            name: "chanprims".to_string(),
        }
    }
}

impl SessionConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config for values no connection could use.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(SessionError::Config(format!(
                "invalid name length: {}",
                self.name.len()
            )));
        }

        let mut seen = HashSet::with_capacity(self.reserved_channels.len());
        for &channel in &self.reserved_channels {
            if is_control(channel) {
                return Err(SessionError::Config(
                    "control channel 0 cannot be reserved".to_string(),
                ));
            }
            if !seen.insert(channel) {
                return Err(SessionError::Config(format!(
                    "channel {channel} reserved more than once"
                )));
            }
        }
        Ok(())
    }
}
