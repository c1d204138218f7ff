//! Parameter records and their canonical text form

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TensorizeError, TensorizeResult};

/// One point of the schedule search space.
///
/// Factor lists hold one entry per tiled axis, outermost part first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleParams {
    #[serde(rename = "split_K")]
    pub split_k: usize,
    pub inline: bool,
    pub vectorize: usize,
    pub spatial_factors: Vec<Vec<usize>>,
    pub reduce_factors: Vec<Vec<usize>>,
    pub last_factors: Vec<Vec<usize>>,
    pub output_unroll_step: usize,
    pub last_unroll_step: usize,
}

impl ScheduleParams {
    /// Compact JSON, stable across runs
    pub fn to_canonical(&self) -> TensorizeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_canonical(s: &str) -> TensorizeResult<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn uses_split_k(&self) -> bool {
        self.split_k > 1
    }

    /// Blocks launched for the output operator
    pub fn block_count(&self) -> TensorizeResult<usize> {
        self.spatial_factors.iter().try_fold(1usize, |acc, f| {
            let outer = f
                .first()
                .ok_or_else(|| TensorizeError::structural("spatial_factors", "empty factor list"))?;
            Ok(acc.saturating_mul(*outer))
        })
    }

    /// Warps per block of the main operator
    pub fn warp_count(&self) -> TensorizeResult<usize> {
        if self.uses_split_k() {
            return Ok(self.split_k);
        }
        self.spatial_factors.iter().try_fold(1usize, |acc, f| {
            if f.len() < 2 {
                return Err(TensorizeError::structural(
                    "spatial_factors",
                    "need at least two parts to find the warp level",
                ));
            }
            Ok(acc.saturating_mul(f[f.len() - 2]))
        })
    }

    /// Tiling of the terminal operator's fused axis
    pub fn last_split(&self) -> TensorizeResult<&[usize]> {
        match self.last_factors.first() {
            Some(f) if !f.is_empty() => Ok(f),
            _ => Err(TensorizeError::structural("last_factors", "no terminal operator tiling")),
        }
    }

    /// Warps per block of the terminal operator
    pub fn last_warp_count(&self) -> TensorizeResult<usize> {
        let f = self.last_split()?;
        Ok(f[f.len() - 1])
    }

    pub fn last_block_count(&self) -> TensorizeResult<usize> {
        Ok(self.last_split()?[0])
    }
}

impl fmt::Display for ScheduleParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{}", s)
    }
}

/// A measured record, one JSON object per line in tuning logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningEntry {
    pub record: ScheduleParams,
    pub score: f64,
}

impl TuningEntry {
    pub fn new(record: ScheduleParams, score: f64) -> Self {
        Self { record, score }
    }

    pub fn to_json(&self) -> TensorizeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> TensorizeResult<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ScheduleParams {
        ScheduleParams {
            split_k: 1,
            inline: true,
            vectorize: 4,
            spatial_factors: vec![vec![2, 1, 2, 1], vec![1, 2, 2, 1]],
            reduce_factors: vec![vec![4, 2, 8]],
            last_factors: vec![vec![16, 2, 4]],
            output_unroll_step: 512,
            last_unroll_step: 64,
        }
    }

    #[test]
    fn test_canonical_keys() {
        let s = record().to_canonical().unwrap();
        assert!(s.starts_with(r#"{"split_K":1,"inline":true,"vectorize":4,"#));
        assert!(!s.contains(' '));
        assert_eq!(ScheduleParams::from_canonical(&s).unwrap(), record());
        assert_eq!(record().to_string(), s);
    }

    #[test]
    fn test_rejects_unknown_and_missing_keys() {
        let s = record().to_canonical().unwrap();
        let extra = s.replacen('{', r#"{"bogus":1,"#, 1);
        assert!(matches!(ScheduleParams::from_canonical(&extra), Err(TensorizeError::Record(_))));
        assert!(ScheduleParams::from_canonical(r#"{"split_K":1}"#).is_err());
    }

    #[test]
    fn test_counts() {
        let r = record();
        assert_eq!(r.block_count().unwrap(), 2);
        assert_eq!(r.warp_count().unwrap(), 4);
        assert_eq!(r.last_warp_count().unwrap(), 4);
        assert_eq!(r.last_block_count().unwrap(), 16);
        let split = ScheduleParams { split_k: 8, ..r };
        assert_eq!(split.warp_count().unwrap(), 8);
    }

    #[test]
    fn test_tuning_entry_line() {
        let e = TuningEntry::new(record(), 1.5);
        let line = e.to_json().unwrap();
        assert_eq!(TuningEntry::from_json(&line).unwrap(), e);
    }
}
