//! # Configuration
//!
//! `NodeConfig` is loaded the way the teacher's `Config::from_env` loads
//! `event-streaming.toml`: a base file, an optional `.local` override, then
//! environment variables prefixed `EVENTMESH__` (double underscore as the
//! nested-key separator), via the `config` crate.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

fn default_name() -> String {
    "eventmesh-node".to_string()
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_persist_path() -> String {
    "eventmesh-state.json".to_string()
}

fn default_analyze_tick_hz() -> f64 {
    50.0
}

fn default_send_tick_hz() -> f64 {
    50.0
}

fn default_persist_tick_hz() -> f64 {
    1.0
}

fn default_incoming_max_size() -> usize {
    10_000
}

fn default_incoming_max_age_s() -> f64 {
    300.0
}

fn default_processing_max_timeout_s() -> f64 {
    60.0
}

fn default_sending_max_size() -> usize {
    50_000
}

fn default_sending_max_retries() -> u32 {
    3
}

fn default_send_http_timeout_ms() -> u64 {
    500
}

fn default_stopping_deadline_s() -> f64 {
    10.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// A known peer in the mesh, used only to populate `GET /discovery` — this
/// is a static table sourced from config, not a dynamic registry (spec.md
/// §1 excludes service discovery as a feature of the engine itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
}

/// Full configuration surface for one node (spec §6.4, field-exact, plus
/// the ambient `log_level`/`log_format` fields every teacher-style crate
/// carries regardless of the domain's own non-goals).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub load_state: bool,
    #[serde(default = "default_persist_path")]
    pub persist_path: String,

    #[serde(default = "default_analyze_tick_hz")]
    pub analyze_tick_hz: f64,
    #[serde(default = "default_send_tick_hz")]
    pub send_tick_hz: f64,
    #[serde(default = "default_persist_tick_hz")]
    pub persist_tick_hz: f64,

    #[serde(default = "default_incoming_max_size")]
    pub incoming_max_size: usize,
    #[serde(default = "default_incoming_max_age_s")]
    pub incoming_max_age_s: f64,

    #[serde(default = "default_processing_max_timeout_s")]
    pub processing_max_timeout_s: f64,

    #[serde(default = "default_sending_max_size")]
    pub sending_max_size: usize,
    #[serde(default = "default_sending_max_retries")]
    pub sending_max_retries: u32,

    #[serde(default = "default_send_http_timeout_ms")]
    pub send_http_timeout_ms: u64,
    #[serde(default = "default_stopping_deadline_s")]
    pub stopping_deadline_s: f64,

    #[serde(default)]
    pub discovery_neighbors: Vec<NeighborConfig>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            address: default_address(),
            port: default_port(),
            load_state: true,
            persist_path: default_persist_path(),
            analyze_tick_hz: default_analyze_tick_hz(),
            send_tick_hz: default_send_tick_hz(),
            persist_tick_hz: default_persist_tick_hz(),
            incoming_max_size: default_incoming_max_size(),
            incoming_max_age_s: default_incoming_max_age_s(),
            processing_max_timeout_s: default_processing_max_timeout_s(),
            sending_max_size: default_sending_max_size(),
            sending_max_retries: default_sending_max_retries(),
            send_http_timeout_ms: default_send_http_timeout_ms(),
            stopping_deadline_s: default_stopping_deadline_s(),
            discovery_neighbors: Vec::new(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl NodeConfig {
    /// Load configuration the way the teacher's `Config::from_env` does:
    /// an optional base file, an optional `.local` override over it, then
    /// `EVENTMESH__`-prefixed environment variables with `__` as the
    /// nested-key separator (e.g. `EVENTMESH__PORT=9090`).
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::from(path.clone()).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("eventmesh-node").required(false));
        }
        builder = builder.add_source(config::File::with_name("eventmesh-node.local").required(false));
        builder = builder.add_source(
            config::Environment::with_prefix("EVENTMESH")
                .separator("__")
                .try_parsing(true),
        );

        let raw = builder.build()?;
        let cfg: NodeConfig = raw.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural validation beyond what serde's defaulting covers.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::configuration("name must not be empty"));
        }
        if self.port == 0 {
            return Err(EngineError::configuration("port must be nonzero"));
        }
        if self.analyze_tick_hz <= 0.0 || self.send_tick_hz <= 0.0 || self.persist_tick_hz <= 0.0 {
            return Err(EngineError::configuration("tick rates must be positive"));
        }
        if self.sending_max_retries == 0 {
            return Err(EngineError::configuration("sending_max_retries must be at least 1"));
        }
        for neighbor in &self.discovery_neighbors {
            if neighbor.name.trim().is_empty() {
                return Err(EngineError::configuration("discovery neighbor name must not be empty"));
            }
        }
        Ok(())
    }

    pub fn analyze_tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.analyze_tick_hz)
    }

    pub fn send_tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.send_tick_hz)
    }

    pub fn persist_tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.persist_tick_hz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_documented_values() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.incoming_max_size, 10_000);
        assert_eq!(cfg.sending_max_size, 50_000);
        assert_eq!(cfg.sending_max_retries, 3);
        assert_eq!(cfg.send_http_timeout_ms, 500);
        assert_eq!(cfg.analyze_tick_hz, 50.0);
        assert_eq!(cfg.persist_tick_hz, 1.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut cfg = NodeConfig::default();
        cfg.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_nonpositive_tick_rate() {
        let mut cfg = NodeConfig::default();
        cfg.analyze_tick_hz = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_retries() {
        let mut cfg = NodeConfig::default();
        cfg.sending_max_retries = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tick_interval_matches_hz() {
        let cfg = NodeConfig::default();
        let interval = cfg.persist_tick_interval();
        assert_eq!(interval, std::time::Duration::from_secs(1));
    }
}
