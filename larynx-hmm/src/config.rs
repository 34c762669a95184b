//! Training configuration.
//!
//! Options come either from a flat key-value map (as handed over by a
//! command line or job description) or from a TOML document with the same
//! keys.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use larynx_core::{LarynxError, Result};
use serde::{Deserialize, Serialize};

use crate::forward_backward::DEFAULT_CONSISTENCY_TOL;

/// Where each utterance's HMM graph comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphMode {
    /// One recognition network shared by every utterance.
    #[default]
    Shared,
    /// Each utterance carries its own alignment graph.
    PerUtterance,
}

impl FromStr for GraphMode {
    type Err = LarynxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shared" => Ok(Self::Shared),
            "per_utterance" => Ok(Self::PerUtterance),
            other => Err(LarynxError::Parse(format!(
                "graph_mode: expected `shared` or `per_utterance`, got `{other}`"
            ))),
        }
    }
}

/// Options for a Forward-Backward training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainerConfig {
    /// Number of training iterations over the corpus.
    pub iters: usize,
    /// Where to write the re-estimated model at the end of training.
    pub out_gmm: Option<PathBuf>,
    pub graph_mode: GraphMode,
    /// Where to write the final iteration's transition counts.
    pub out_trans: Option<PathBuf>,
    /// State posteriors at or below this weight are not accumulated.
    pub posterior_floor: f64,
    /// Allowed `|forward - backward|` before a mismatch is reported.
    pub consistency_tol: f64,
    /// Re-estimate shared-graph arc probabilities after each iteration.
    pub update_trans: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            iters: 1,
            out_gmm: None,
            graph_mode: GraphMode::Shared,
            out_trans: None,
            posterior_floor: 0.0,
            consistency_tol: DEFAULT_CONSISTENCY_TOL,
            update_trans: false,
        }
    }
}

impl TrainerConfig {
    /// Build from flat `key = value` options. Missing keys keep their
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`LarynxError::Parse`] for unknown keys or unparsable values,
    /// and any [`validate`](Self::validate) error.
    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in params {
            match key.as_str() {
                "iters" => config.iters = parse_value(key, value)?,
                "out_gmm" => config.out_gmm = non_empty_path(value),
                "graph_mode" => config.graph_mode = value.parse()?,
                "out_trans" => config.out_trans = non_empty_path(value),
                "posterior_floor" => config.posterior_floor = parse_value(key, value)?,
                "consistency_tol" => config.consistency_tol = parse_value(key, value)?,
                "update_trans" => config.update_trans = parse_value(key, value)?,
                other => {
                    return Err(LarynxError::Parse(format!("unknown option `{other}`")));
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`LarynxError::Parse`] for malformed TOML or unknown keys, and
    /// any [`validate`](Self::validate) error.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| LarynxError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check option ranges.
    pub fn validate(&self) -> Result<()> {
        if self.iters == 0 {
            return Err(LarynxError::InvalidInput("iters must be >= 1".into()));
        }
        if !(self.posterior_floor >= 0.0 && self.posterior_floor < 1.0) {
            return Err(LarynxError::InvalidInput(format!(
                "posterior_floor must be in [0, 1), got {}",
                self.posterior_floor
            )));
        }
        if !(self.consistency_tol > 0.0) {
            return Err(LarynxError::InvalidInput(format!(
                "consistency_tol must be > 0, got {}",
                self.consistency_tol
            )));
        }
        if self.update_trans && self.graph_mode == GraphMode::PerUtterance {
            return Err(LarynxError::InvalidInput(
                "update_trans requires graph_mode = shared".into(),
            ));
        }
        Ok(())
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| LarynxError::Parse(format!("option `{key}` = `{value}`: {e}")))
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let config = TrainerConfig::from_params(&BTreeMap::new()).unwrap();
        assert_eq!(config, TrainerConfig::default());
        assert_eq!(config.iters, 1);
        assert_eq!(config.graph_mode, GraphMode::Shared);
    }

    #[test]
    fn flat_params_are_parsed() {
        let config = TrainerConfig::from_params(&params(&[
            ("iters", "5"),
            ("out_gmm", "model.json"),
            ("graph_mode", "per_utterance"),
            ("out_trans", ""),
            ("posterior_floor", "0.001"),
        ]))
        .unwrap();
        assert_eq!(config.iters, 5);
        assert_eq!(config.out_gmm, Some(PathBuf::from("model.json")));
        assert_eq!(config.graph_mode, GraphMode::PerUtterance);
        assert_eq!(config.out_trans, None);
        assert_eq!(config.posterior_floor, 0.001);
    }

    #[test]
    fn flat_params_errors() {
        assert!(TrainerConfig::from_params(&params(&[("iters", "many")])).is_err());
        assert!(TrainerConfig::from_params(&params(&[("iters", "0")])).is_err());
        assert!(TrainerConfig::from_params(&params(&[("graph_mode", "mesh")])).is_err());
        assert!(TrainerConfig::from_params(&params(&[("colour", "blue")])).is_err());
        assert!(TrainerConfig::from_params(&params(&[
            ("graph_mode", "per_utterance"),
            ("update_trans", "true"),
        ]))
        .is_err());
    }

    #[test]
    fn toml_document() {
        let config = TrainerConfig::from_toml_str(
            r#"
            iters = 3
            out_trans = "trans.txt"
            update_trans = true
            consistency_tol = 1e-8
            "#,
        )
        .unwrap();
        assert_eq!(config.iters, 3);
        assert_eq!(config.out_trans, Some(PathBuf::from("trans.txt")));
        assert!(config.update_trans);
        assert_eq!(config.consistency_tol, 1e-8);
        assert_eq!(config.graph_mode, GraphMode::Shared);

        assert!(TrainerConfig::from_toml_str("iters = 0").is_err());
        assert!(TrainerConfig::from_toml_str("bogus = 1").is_err());
        assert!(TrainerConfig::from_toml_str("graph_mode = \"per_utterance\"").is_ok());
    }
}
