//! TOML config file loading and validation for the hub.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::mqtt;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: mqtt::Config,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: default_storage_path() }
    }
}

#[derive(Debug, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: default_web_port() }
    }
}

fn default_storage_path() -> String {
    "garden-hub.yaml".to_string()
}

fn default_web_port() -> u16 {
    8080
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the config. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);

        if self.storage.path.trim().is_empty() {
            errors.push("storage.path is empty".to_string());
        }
        if self.web.port == 0 {
            errors.push("web.port must be nonzero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be nonzero".to_string());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }

        // Every topic template must route per garden.
        let templates = [
            ("water", &m.topics.water),
            ("light", &m.topics.light),
            ("stop", &m.topics.stop),
            ("stop_all", &m.topics.stop_all),
        ];
        for (name, template) in templates {
            if template.trim().is_empty() {
                errors.push(format!("mqtt.topics.{name} is empty"));
            } else if !template.contains(mqtt::TOPIC_PLACEHOLDER) {
                errors.push(format!(
                    "mqtt.topics.{name} '{template}' does not contain the '{}' placeholder",
                    mqtt::TOPIC_PLACEHOLDER
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
