//! Configuration module for tielink
//!
//! The persisted document is JSON with camelCase keys; the settings
//! collaborator owns the file on disk, this module owns its shape and
//! validation.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::ProtocolKind;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// First physical router
    #[serde(default)]
    pub router_a: Option<RouterConfig>,

    /// Second physical router
    #[serde(default)]
    pub router_b: Option<RouterConfig>,

    /// Tie-line cabling between the two routers
    #[serde(default)]
    pub tie_lines: TieLineConfig,

    /// Named route presets
    #[serde(default)]
    pub salvos: Vec<Salvo>,

    /// Connect both routers at startup
    #[serde(default)]
    pub auto_connect: bool,

    /// Reconnect with backoff after unexpected socket loss
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Northbound bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::ConfigInvalid(format!("failed to parse config: {}", e)))?;
        config.tie_lines.validate()?;
        Ok(config)
    }

    /// Example configuration for `--gen-config`
    pub fn example() -> Self {
        Config {
            router_a: Some(RouterConfig {
                host: "10.0.0.10".to_string(),
                port: None,
                protocol: ProtocolKind::VideoHub,
                levels: 1,
                name: "Studio".to_string(),
                matrix: None,
            }),
            router_b: Some(RouterConfig {
                host: "10.0.0.11".to_string(),
                port: Some(8910),
                protocol: ProtocolKind::SwP08,
                levels: 1,
                name: "Master control".to_string(),
                matrix: Some(MatrixHint {
                    inputs: 16,
                    outputs: 16,
                }),
            }),
            tie_lines: TieLineConfig {
                a_to_b: vec![TieLinePort {
                    output: 15,
                    input: 15,
                }],
                b_to_a: vec![],
            },
            salvos: vec![Salvo {
                name: "Bars everywhere".to_string(),
                routes: vec![SalvoEntry {
                    output: 0,
                    input: 0,
                    level: 0,
                }],
            }],
            auto_connect: true,
            auto_reconnect: true,
            bridge: BridgeConfig::default(),
        }
    }
}

/// One physical router endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    /// Host name or IP
    pub host: String,

    /// TCP port; absent means the protocol default
    #[serde(default)]
    pub port: Option<u16>,

    /// Wire protocol this router speaks
    pub protocol: ProtocolKind,

    /// Breakaway level count (opaque to the core)
    #[serde(default = "default_levels")]
    pub levels: u8,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Matrix dimensions for protocols that cannot discover them
    #[serde(default)]
    pub matrix: Option<MatrixHint>,
}

fn default_levels() -> u8 {
    1
}

impl RouterConfig {
    /// Effective TCP port, falling back to the protocol default.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }
}

/// Dimension hint for SW-P-08, which has no wire-level discovery
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatrixHint {
    pub inputs: u16,
    pub outputs: u16,
}

/// The full tie-line cabling plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TieLineConfig {
    /// Cables from router A outputs into router B inputs
    #[serde(default)]
    pub a_to_b: Vec<TieLinePort>,

    /// Cables from router B outputs into router A inputs
    #[serde(default)]
    pub b_to_a: Vec<TieLinePort>,
}

impl TieLineConfig {
    /// Reject duplicate ports within one direction.
    ///
    /// Across directions the same index may legally appear (they are
    /// different physical ports).
    pub fn validate(&self) -> Result<()> {
        Self::validate_pool("aToB", &self.a_to_b)?;
        Self::validate_pool("bToA", &self.b_to_a)
    }

    fn validate_pool(direction: &str, pool: &[TieLinePort]) -> Result<()> {
        let mut outputs = HashSet::new();
        let mut inputs = HashSet::new();
        for tl in pool {
            if !outputs.insert(tl.output) {
                return Err(Error::ConfigInvalid(format!(
                    "{}: duplicate source output {}",
                    direction, tl.output
                )));
            }
            if !inputs.insert(tl.input) {
                return Err(Error::ConfigInvalid(format!(
                    "{}: duplicate sink input {}",
                    direction, tl.input
                )));
            }
        }
        Ok(())
    }
}

/// Which pool a tie-line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TieLineDirection {
    AToB,
    BToA,
}

/// One tie-line cable: `output` on the source router wired to `input` on
/// the destination router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieLinePort {
    pub output: u16,
    pub input: u16,
}

/// Named preset: an ordered list of virtual routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Salvo {
    pub name: String,
    pub routes: Vec<SalvoEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalvoEntry {
    pub output: u16,
    pub input: u16,
    #[serde(default)]
    pub level: u8,
}

/// Northbound bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Listen address for the VideoHub re-export
    #[serde(default = "default_bridge_listen")]
    pub listen: String,
}

fn default_bridge_listen() -> String {
    "0.0.0.0:9990".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: default_bridge_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_round_trip() {
        let config = Config::example();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.tie_lines, config.tie_lines);
        assert!(parsed.auto_connect);
    }

    #[test]
    fn test_spec_keys_accepted() {
        let json = r#"{
            "routerA": {"host": "1.2.3.4", "protocol": "videohub", "levels": 1, "name": "A"},
            "routerB": {"host": "1.2.3.5", "protocol": "swp08", "name": "B"},
            "tieLines": {"aToB": [{"output": 7, "input": 0}], "bToA": []},
            "salvos": [],
            "autoConnect": false,
            "autoReconnect": true
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.router_a.unwrap().effective_port(), 9990);
        assert_eq!(config.router_b.unwrap().effective_port(), 8910);
        assert_eq!(config.tie_lines.a_to_b.len(), 1);
    }

    #[test]
    fn test_duplicate_tie_line_output_rejected() {
        let cfg = TieLineConfig {
            a_to_b: vec![
                TieLinePort { output: 7, input: 0 },
                TieLinePort { output: 7, input: 1 },
            ],
            b_to_a: vec![],
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_same_index_across_directions_allowed() {
        let cfg = TieLineConfig {
            a_to_b: vec![TieLinePort { output: 7, input: 0 }],
            b_to_a: vec![TieLinePort { output: 7, input: 0 }],
        };
        assert!(cfg.validate().is_ok());
    }
}
