//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a partial
//! JSON file only needs to name the values it changes.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "registry": { "messageBuffer": 32, "duplicatePolicy": "overwrite" },
///   "logging": { "level": "info" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BeaconSettings {
    /// Client registry sizing and policy.
    pub registry: RegistrySettings,
    /// Log output configuration.
    pub logging: LoggingSettings,
}

impl BeaconSettings {
    /// Check values that deserialize fine but cannot be used.
    pub fn validate(&self) -> Result<()> {
        self.registry.validate()
    }
}

/// What the registry does when an insert collides with a live client id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Cancel the displaced client's lifetime token, then replace it.
    #[default]
    Evict,
    /// Replace the entry and leave the displaced client untouched.
    Overwrite,
}

impl DuplicatePolicy {
    /// Parse a policy name (case-insensitive).
    pub fn parse(val: &str) -> Option<Self> {
        match val.to_lowercase().as_str() {
            "evict" => Some(Self::Evict),
            "overwrite" => Some(Self::Overwrite),
            _ => None,
        }
    }
}

/// Client registry settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrySettings {
    /// Capacity of each client's outbound message queue.
    pub message_buffer: usize,
    /// Capacity of the registry's request queue.
    pub request_buffer: usize,
    /// Behavior on duplicate client ids.
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            message_buffer: 10,
            request_buffer: 10,
            duplicate_policy: DuplicatePolicy::Evict,
        }
    }
}

impl RegistrySettings {
    /// Reject zero-sized queues.
    pub fn validate(&self) -> Result<()> {
        if self.message_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "registry.messageBuffer must be at least 1".into(),
            ));
        }
        if self.request_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "registry.requestBuffer must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}
