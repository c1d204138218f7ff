//! Tiling and search configuration

use serde::{Deserialize, Serialize};

use crate::error::TensorizeResult;

/// How many parts each axis family is tiled into, and the candidate lists
/// for the discrete knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    pub reduce_tiling: usize,
    pub spatial_tiling: usize,
    pub last_tiling: usize,
    /// Repeated entries weight the prior
    pub split_k_candidates: Vec<usize>,
    pub unroll_candidates: Vec<usize>,
}

impl TilingConfig {
    pub fn new(reduce_tiling: usize, spatial_tiling: usize, last_tiling: usize) -> Self {
        Self {
            reduce_tiling,
            spatial_tiling,
            last_tiling,
            ..Self::default()
        }
    }

    pub fn from_json(s: &str) -> TensorizeResult<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            reduce_tiling: 3,
            spatial_tiling: 4,
            last_tiling: 3,
            split_k_candidates: vec![1, 4, 4, 8, 8, 16, 16],
            unroll_candidates: vec![16, 64, 512, 1500],
        }
    }
}

/// Search driver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub trials: usize,
    /// Probability of exploiting a top-k entry instead of sampling fresh
    pub eps: f64,
    pub mutate_steps: usize,
    pub topk: usize,
    /// Trials that always sample fresh before exploitation starts
    pub warm_up_trials: usize,
    pub seed: u64,
    pub softmax_temperature: f64,
    /// Draws per trial before a repeated candidate is given up on
    pub max_attempts_per_trial: usize,
}

impl SearchConfig {
    pub fn new(trials: usize, seed: u64) -> Self {
        Self {
            trials,
            seed,
            ..Self::default()
        }
    }

    pub fn from_json(s: &str) -> TensorizeResult<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            trials: 100,
            eps: 0.9,
            mutate_steps: 1,
            topk: 20,
            warm_up_trials: 10,
            seed: 0,
            softmax_temperature: 0.2,
            max_attempts_per_trial: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = TilingConfig::from_json(r#"{"spatial_tiling": 5}"#).unwrap();
        assert_eq!(cfg.spatial_tiling, 5);
        assert_eq!(cfg.reduce_tiling, 3);
        assert_eq!(cfg.unroll_candidates, vec![16, 64, 512, 1500]);

        let search = SearchConfig::from_json(r#"{"trials": 7, "seed": 3}"#).unwrap();
        assert_eq!(search, SearchConfig::new(7, 3));
    }

    #[test]
    fn test_bad_json_is_record_error() {
        assert!(SearchConfig::from_json("{").is_err());
    }
}
