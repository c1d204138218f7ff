//! Error types for capability matching, splicing and schedule search

use thiserror::Error;

/// Result type for tensorization operations
pub type TensorizeResult<T> = Result<T, TensorizeError>;

/// Tensorization errors
#[derive(Debug, Error)]
pub enum TensorizeError {
    #[error("Invalid capability definition '{name}': {message}")]
    CapabilityDefinition { name: String, message: String },

    #[error("No capability registered for target '{target}' with mnemonic '{mnemonic}'")]
    Lookup { target: String, mnemonic: String },

    #[error("Capability '{mnemonic}' already registered for target '{target}'")]
    Duplicate { target: String, mnemonic: String },

    #[error("Capability '{dag}' has no entry for key '{key}'")]
    UnknownKey { dag: String, key: String },

    #[error("Match error: {message}")]
    Match { message: String },

    #[error("Legality violation: {limit} is {value}, limit is {max}")]
    Legality {
        limit: &'static str,
        value: usize,
        max: usize,
    },

    #[error("Structural error on '{op}': {message}")]
    Structural { op: String, message: String },

    #[error("Graph error: {message}")]
    Graph { message: String },

    #[error("Malformed parameter record: {0}")]
    Record(#[from] serde_json::Error),
}

impl TensorizeError {
    pub fn definition(name: impl Into<String>, msg: impl Into<String>) -> Self {
        TensorizeError::CapabilityDefinition {
            name: name.into(),
            message: msg.into(),
        }
    }

    pub fn lookup(target: impl Into<String>, mnemonic: impl Into<String>) -> Self {
        TensorizeError::Lookup {
            target: target.into(),
            mnemonic: mnemonic.into(),
        }
    }

    pub fn unknown_key(dag: impl Into<String>, key: impl Into<String>) -> Self {
        TensorizeError::UnknownKey {
            dag: dag.into(),
            key: key.into(),
        }
    }

    pub fn matching(msg: impl Into<String>) -> Self {
        TensorizeError::Match { message: msg.into() }
    }

    pub fn legality(limit: &'static str, value: usize, max: usize) -> Self {
        TensorizeError::Legality { limit, value, max }
    }

    pub fn structural(op: impl Into<String>, msg: impl Into<String>) -> Self {
        TensorizeError::Structural {
            op: op.into(),
            message: msg.into(),
        }
    }

    pub fn graph(msg: impl Into<String>) -> Self {
        TensorizeError::Graph { message: msg.into() }
    }

    /// Legality rejections are recoverable inside the search loop
    pub fn is_legality(&self) -> bool {
        matches!(self, TensorizeError::Legality { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offender() {
        let err = TensorizeError::lookup("cuda", "wmma_fp16_fp32");
        assert_eq!(
            err.to_string(),
            "No capability registered for target 'cuda' with mnemonic 'wmma_fp16_fp32'"
        );

        let err = TensorizeError::structural("gemm", "missing reduce axis");
        assert!(err.to_string().contains("gemm"));
    }

    #[test]
    fn test_is_legality() {
        assert!(TensorizeError::legality("blocks", 70000, 65535).is_legality());
        assert!(!TensorizeError::matching("x").is_legality());
    }
}
