use serde::{Deserialize, Serialize};

use super::ConfigError;

pub const DEFAULT_REGION: &str = "us-west-1";
pub const DEFAULT_PROTOCOL: &str = "TCP";

/// Cloud scope used for every provider call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderScope {
    pub region: String,
    /// Network whose instances are registered as backend targets
    pub vpc_id: String,
    /// Listener and backend group protocol
    pub protocol: String,
}

impl ProviderScope {
    pub fn new(vpc_id: impl Into<String>) -> Result<Self, ConfigError> {
        let vpc_id = vpc_id.into();
        if vpc_id.trim().is_empty() {
            return Err(ConfigError::MissingSetting("vpc-id"));
        }
        Ok(Self {
            region: DEFAULT_REGION.to_string(),
            vpc_id,
            protocol: DEFAULT_PROTOCOL.to_string(),
        })
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }
}
