//! Configuration of a table lineage.
//!
//! These values are supplied once, when the lineage (and its [`crate::dlt::DltManager`]) is
//! created, and never change afterwards.
use serde::{Deserialize, Serialize};

use crate::{
    dlt::token::MAX_TOKEN_BITS,
    error::{Error, Result},
};

/// Deepest replication supported by the placement algorithms
pub const MAX_PLACEMENT_DEPTH: usize = 4;

fn default_max_tables() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Number of bits of a token. Tables hold `2^token_bits` rows
    pub token_bits: u32,
    /// Number of replicas per token
    pub depth: usize,
    /// 0 disables bounded-primary mode (failed nodes are ignored).
    /// Otherwise the first `num_primaries` ranks of every row are primaries.
    #[serde(default)]
    pub num_primaries: usize,
    /// How many table versions the manager keeps around
    #[serde(default = "default_max_tables")]
    pub max_tables: usize,
    #[serde(default)]
    pub algorithm: Algorithm,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Algorithm {
    RoundRobin,
    #[default]
    ConsistentHashing,
}

impl Config {
    /// Parses a JSON config and validates it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token_bits == 0 || self.token_bits > MAX_TOKEN_BITS {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "token_bits must be within [1, {}], got {}",
                    MAX_TOKEN_BITS, self.token_bits
                ),
            });
        }

        if self.depth == 0 || self.depth > MAX_PLACEMENT_DEPTH {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "depth must be within [1, {}], got {}",
                    MAX_PLACEMENT_DEPTH, self.depth
                ),
            });
        }

        if self.num_primaries > self.depth {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "num_primaries ({}) can't be greater than depth ({})",
                    self.num_primaries, self.depth
                ),
            });
        }

        if self.max_tables < 2 {
            return Err(Error::InvalidConfig {
                reason: format!("max_tables must be at least 2, got {}", self.max_tables),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, str::FromStr};

    use super::{Algorithm, Config};
    use crate::error::Error;

    #[test]
    fn deserialize_placement() {
        let mut config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        config_path.push("conf/placement.json");

        let stringified_json = std::fs::read_to_string(config_path).unwrap();
        let config = Config::from_json(&stringified_json).unwrap();

        assert!(matches!(
            config,
            Config {
                token_bits: 8,
                depth: 3,
                num_primaries: 2,
                max_tables: 3,
                algorithm: Algorithm::ConsistentHashing,
            }
        ));
    }

    #[test]
    fn deserialize_defaults() {
        let config = Config::from_json(r#"{"token_bits": 4, "depth": 2}"#).unwrap();
        assert_eq!(config.num_primaries, 0);
        assert_eq!(config.max_tables, 3);
        assert_eq!(config.algorithm, Algorithm::ConsistentHashing);
    }

    #[test]
    fn invalid_configs() {
        for json in [
            r#"{"token_bits": 0, "depth": 2}"#,
            r#"{"token_bits": 25, "depth": 2}"#,
            r#"{"token_bits": 4, "depth": 0}"#,
            r#"{"token_bits": 4, "depth": 5}"#,
            r#"{"token_bits": 4, "depth": 2, "num_primaries": 3}"#,
            r#"{"token_bits": 4, "depth": 2, "max_tables": 1}"#,
            r#"{"token_bits": 4}"#,
            r#"{"token_bits": 4, "depth": 2, "algorithm": "random"}"#,
        ] {
            let err = Config::from_json(json).err().unwrap();
            assert!(matches!(err, Error::InvalidConfig { .. }), "{}", json);
        }
    }

    #[test]
    fn algorithm_names() {
        assert_eq!(Algorithm::RoundRobin.to_string(), "round_robin");
        assert_eq!(
            Algorithm::from_str("consistent_hashing").unwrap(),
            Algorithm::ConsistentHashing
        );
        assert!(Algorithm::from_str("nope").is_err());
    }
}
