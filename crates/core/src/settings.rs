use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;
use crate::logger;
use crate::types::{WorkArea, DEFAULT_SPEED};

fn default_baud() -> u32 {
    crate::transport::serial::DEFAULT_BAUD
}

fn default_wifi_port() -> u16 {
    crate::transport::wifi::DEFAULT_PORT
}

fn default_login() -> String {
    "admin".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportSettings {
    Serial {
        #[serde(default)]
        port: Option<String>,
        #[serde(default = "default_baud")]
        baud: u32,
        #[serde(default)]
        capture_url: Option<String>,
    },
    Wifi {
        ip: String,
        #[serde(default = "default_wifi_port")]
        port: u16,
        #[serde(default = "default_login")]
        username: String,
        #[serde(default = "default_login")]
        password: String,
    },
    Stub,
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings::Serial { port: None, baud: default_baud(), capture_url: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionSettings {
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for PerceptionSettings {
    fn default() -> Self {
        Self { base_url: None, timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSettings {
    pub max_attempts: u32,
    pub settle_ms: u64,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self { max_attempts: 2, settle_ms: 2000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub ack_timeout_ms: u64,
    /// Speed field of every click and drag sent to the device
    pub speed: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { ack_timeout_ms: 10_000, speed: DEFAULT_SPEED }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    pub z_min: f64,
    pub z_max: f64,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self { z_min: 0.0, z_max: 100.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSettings {
    pub max_steps: usize,
    pub max_instructions: usize,
    pub max_string_len: usize,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self { max_steps: 50, max_instructions: 100_000, max_string_len: 65_536 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub calibration: WorkArea,
    pub transport: TransportSettings,
    pub perception: PerceptionSettings,
    pub step: StepSettings,
    pub queue: QueueSettings,
    pub safety: SafetySettings,
    pub script: ScriptSettings,
}

impl Settings {
    /// Read settings, falling back to defaults when the file is missing or invalid.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(s) => s,
            Err(e) => {
                logger::warn(&format!("settings {}: {}, using defaults", path.display(), e));
                Self::default()
            }
        }
    }

    pub fn try_load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
