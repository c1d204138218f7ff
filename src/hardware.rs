//! Hardware interface definitions
//!
//! Device limits used by the legality check, plus the small closed
//! vocabularies the schedule speaks: instruction scope, memory scope and
//! thread tags.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::expr::DType;

/// Resource limits of the target device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Target name matched against the capability registry (e.g. "cuda")
    pub target: String,
    /// Compute capability, e.g. 70 for sm_70
    pub arch: u32,
    /// Lanes issuing a warp-level instruction together
    pub warp_size: usize,
    pub max_threads_per_block: usize,
    /// Maximum addressable blocks along one grid dimension
    pub max_blocks: usize,
    /// Streaming multiprocessors, i.e. blocks resident in one wave
    pub num_sms: usize,
    /// Widest vector load in bits
    pub vector_bits: usize,
}

impl DeviceConfig {
    pub fn new(
        target: impl Into<String>,
        arch: u32,
        warp_size: usize,
        max_threads_per_block: usize,
        max_blocks: usize,
        num_sms: usize,
        vector_bits: usize,
    ) -> Self {
        Self {
            target: target.into(),
            arch,
            warp_size,
            max_threads_per_block,
            max_blocks,
            num_sms,
            vector_bits,
        }
    }

    /// CUDA device of the given compute capability
    pub fn cuda(arch: u32) -> Self {
        let num_sms = match arch {
            0..=69 => 56,
            70..=74 => 80,
            75..=79 => 40,
            80..=85 => 108,
            86..=88 => 84,
            89 => 128,
            _ => 132,
        };
        Self::new("cuda", arch, 32, 1024, 65535, num_sms, 128)
    }

    /// Warps one block can hold
    pub fn max_warps(&self) -> usize {
        self.max_threads_per_block / self.warp_size.max(1)
    }

    /// Vector lengths whose total width fits a single vector load
    pub fn vector_lengths(&self, dtype: DType) -> Vec<usize> {
        let mut out = Vec::new();
        let mut len = 1;
        while len * dtype.bits() <= self.vector_bits {
            out.push(len);
            len *= 2;
        }
        if out.is_empty() {
            out.push(1);
        }
        out
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::cuda(70)
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sm_{} (warp {}, {} threads/block, {} blocks, {} SMs, {}-bit vectors)",
            self.target,
            self.arch,
            self.warp_size,
            self.max_threads_per_block,
            self.max_blocks,
            self.num_sms,
            self.vector_bits
        )
    }
}

/// Who issues the hardware instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstructionScope {
    /// A whole warp issues it collectively
    Warp,
    /// Each lane issues it on its own
    Thread,
}

/// Storage scope of a stage's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemoryScope {
    Global,
    Shared,
    Local,
}

impl fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryScope::Global => "global",
            MemoryScope::Shared => "shared",
            MemoryScope::Local => "local",
        };
        write!(f, "{}", s)
    }
}

/// Hardware index an axis can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThreadTag {
    BlockX,
    ThreadY,
    ThreadX,
}

impl fmt::Display for ThreadTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadTag::BlockX => "blockIdx.x",
            ThreadTag::ThreadY => "threadIdx.y",
            ThreadTag::ThreadX => "threadIdx.x",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuda_defaults() {
        let dev = DeviceConfig::default();
        assert_eq!(dev.arch, 70);
        assert_eq!(dev.max_warps(), 32);
        assert_eq!(dev.max_blocks, 65535);
        assert_eq!(dev.num_sms, 80);
    }

    #[test]
    fn test_sm_count_follows_arch() {
        assert_eq!(DeviceConfig::cuda(80).num_sms, 108);
        assert_eq!(DeviceConfig::cuda(75).num_sms, 40);
        assert_eq!(DeviceConfig::cuda(90).num_sms, 132);
    }

    #[test]
    fn test_vector_lengths() {
        let dev = DeviceConfig::cuda(70);
        assert_eq!(dev.vector_lengths(DType::F16), vec![1, 2, 4, 8]);
        assert_eq!(dev.vector_lengths(DType::F32), vec![1, 2, 4]);
    }

    #[test]
    fn test_display_tags() {
        assert_eq!(ThreadTag::BlockX.to_string(), "blockIdx.x");
        assert_eq!(MemoryScope::Shared.to_string(), "shared");
    }
}
