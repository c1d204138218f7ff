//! Capability registry: target -> mnemonic -> hardware-unit factory
//!
//! The registry is an ordinary value so callers and tests can build isolated
//! instances. A lazily created process-wide instance with the built-in units
//! is available through [`HwAbsDagRegistry::global`]; register into it at
//! start-up, before any search runs. A built-in unit that fails validation
//! makes every access to the global instance fail with that error.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::capability::HwAbsDag;
use crate::error::{TensorizeError, TensorizeResult};

/// Factory producing a fresh hardware-unit definition
pub type HwAbsDagFactory = Arc<dyn Fn() -> Box<dyn HwAbsDag> + Send + Sync>;

/// Registers one or more units into a registry
pub type UnitRegistration = fn(&HwAbsDagRegistry) -> TensorizeResult<()>;

const BUILTIN_UNITS: &[UnitRegistration] = &[crate::wmma::register];

#[derive(Default)]
pub struct HwAbsDagRegistry {
    entries: RwLock<BTreeMap<String, BTreeMap<String, HwAbsDagFactory>>>,
}

impl HwAbsDagRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in unit
    pub fn with_builtins() -> TensorizeResult<Self> {
        Self::with_units(BUILTIN_UNITS)
    }

    /// A registry holding the given units; the first failing registration
    /// aborts construction
    pub fn with_units(units: &[UnitRegistration]) -> TensorizeResult<Self> {
        let registry = Self::new();
        for register in units {
            register(&registry)?;
        }
        Ok(registry)
    }

    /// The process-wide registry
    pub fn global() -> TensorizeResult<&'static HwAbsDagRegistry> {
        match &*HW_ABS_DAG_REGISTRY {
            Ok(registry) => Ok(registry),
            Err(e) => Err(stored_error(e)),
        }
    }

    /// Register a unit. The factory is instantiated once and the resulting
    /// capability graph validated before it is stored.
    pub fn add(
        &self,
        target: &str,
        mnemonic: &str,
        factory: HwAbsDagFactory,
        override_existing: bool,
    ) -> TensorizeResult<()> {
        factory().graph().validate()?;

        let mut entries = self.entries.write();
        let bucket = entries.entry(target.to_string()).or_default();
        if bucket.contains_key(mnemonic) && !override_existing {
            return Err(TensorizeError::Duplicate {
                target: target.to_string(),
                mnemonic: mnemonic.to_string(),
            });
        }
        bucket.insert(mnemonic.to_string(), factory);
        debug!(target_name = target, mnemonic, override_existing, "registered capability");
        Ok(())
    }

    /// Remove a unit; an emptied target bucket is dropped
    pub fn remove(&self, target: &str, mnemonic: &str, allow_missing: bool) -> TensorizeResult<()> {
        let mut entries = self.entries.write();
        let removed = match entries.get_mut(target) {
            Some(bucket) => {
                let removed = bucket.remove(mnemonic).is_some();
                if bucket.is_empty() {
                    entries.remove(target);
                }
                removed
            }
            None => false,
        };
        if !removed && !allow_missing {
            return Err(TensorizeError::lookup(target, mnemonic));
        }
        debug!(target_name = target, mnemonic, removed, "removed capability");
        Ok(())
    }

    pub fn find(&self, target: &str, mnemonic: &str) -> TensorizeResult<HwAbsDagFactory> {
        self.entries
            .read()
            .get(target)
            .and_then(|bucket| bucket.get(mnemonic))
            .cloned()
            .ok_or_else(|| TensorizeError::lookup(target, mnemonic))
    }

    /// Find and instantiate in one step
    pub fn instantiate(&self, target: &str, mnemonic: &str) -> TensorizeResult<Box<dyn HwAbsDag>> {
        let factory = self.find(target, mnemonic)?;
        Ok(factory())
    }

    /// Mnemonics registered for `target`; empty for an unknown target
    pub fn enumerate(&self, target: &str) -> Vec<String> {
        self.entries
            .read()
            .get(target)
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, target: &str, mnemonic: &str) -> bool {
        self.entries
            .read()
            .get(target)
            .map_or(false, |bucket| bucket.contains_key(mnemonic))
    }

    pub fn targets(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

/// Process-wide registry, created with the built-in units on first access.
/// Holds the registration error if a built-in unit is invalid.
pub static HW_ABS_DAG_REGISTRY: Lazy<TensorizeResult<HwAbsDagRegistry>> = Lazy::new(|| {
    HwAbsDagRegistry::with_builtins().map_err(|e| {
        error!(error = %e, "built-in capability failed to register");
        e
    })
});

/// Registration only fails with definition or duplicate errors; anything
/// else is reported as a definition error of the built-in set
fn stored_error(e: &TensorizeError) -> TensorizeError {
    match e {
        TensorizeError::CapabilityDefinition { name, message } => TensorizeError::definition(name, message),
        TensorizeError::Duplicate { target, mnemonic } => TensorizeError::Duplicate {
            target: target.clone(),
            mnemonic: mnemonic.clone(),
        },
        other => TensorizeError::definition("builtin", other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityClass, CapabilityGraph};
    use crate::wmma::WmmaFp16Fp32;

    fn wmma_factory() -> HwAbsDagFactory {
        Arc::new(|| Box::new(WmmaFp16Fp32::new()) as Box<dyn HwAbsDag>)
    }

    #[test]
    fn test_add_find_remove() {
        let reg = HwAbsDagRegistry::new();
        reg.add("cuda", "wmma", wmma_factory(), false).unwrap();
        assert!(reg.contains("cuda", "wmma"));
        let dag = reg.instantiate("cuda", "wmma").unwrap();
        assert_eq!(dag.graph().main_node, "mma");

        reg.remove("cuda", "wmma", false).unwrap();
        assert!(matches!(reg.find("cuda", "wmma"), Err(TensorizeError::Lookup { .. })));
        // bucket dropped once empty
        assert!(reg.targets().is_empty());
    }

    #[test]
    fn test_duplicate_requires_override() {
        let reg = HwAbsDagRegistry::new();
        reg.add("cuda", "wmma", wmma_factory(), false).unwrap();
        let err = reg.add("cuda", "wmma", wmma_factory(), false).unwrap_err();
        assert!(matches!(err, TensorizeError::Duplicate { .. }));
        reg.add("cuda", "wmma", wmma_factory(), true).unwrap();
        assert_eq!(reg.enumerate("cuda"), vec!["wmma".to_string()]);
    }

    #[test]
    fn test_remove_missing() {
        let reg = HwAbsDagRegistry::new();
        assert!(reg.remove("cuda", "nothing", false).is_err());
        assert!(reg.remove("cuda", "nothing", true).is_ok());
    }

    #[test]
    fn test_enumerate_unknown_target_is_empty() {
        let reg = HwAbsDagRegistry::new();
        assert!(reg.enumerate("opencl").is_empty());
    }

    struct Broken(CapabilityGraph, WmmaFp16Fp32);
    impl HwAbsDag for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn target(&self) -> &str {
            "cuda"
        }
        fn scope(&self) -> crate::hardware::InstructionScope {
            self.1.scope()
        }
        fn graph(&self) -> &CapabilityGraph {
            &self.0
        }
        fn compute_keys(&self) -> Vec<String> {
            self.1.compute_keys()
        }
        fn shape_keys(&self) -> Vec<String> {
            self.1.shape_keys()
        }
        fn main_expression(
            &self,
            ck: &str,
            sk: &str,
        ) -> TensorizeResult<crate::capability::NodeExpression> {
            self.1.main_expression(ck, sk)
        }
        fn node_expression(
            &self,
            ck: &str,
            sk: &str,
            node: &str,
        ) -> TensorizeResult<crate::capability::NodeExpression> {
            self.1.node_expression(ck, sk, node)
        }
        fn node_expression_with_shape(
            &self,
            ck: &str,
            sk: &str,
            node: &str,
            shapes: &[Vec<usize>],
        ) -> TensorizeResult<crate::capability::NodeExpression> {
            self.1.node_expression_with_shape(ck, sk, node, shapes)
        }
        fn problem_size(&self, sk: &str) -> TensorizeResult<crate::capability::ProblemSize> {
            self.1.problem_size(sk)
        }
        fn intrinsic(
            &self,
            ck: &str,
            sk: &str,
            node: &str,
            scope: Option<crate::hardware::MemoryScope>,
        ) -> TensorizeResult<crate::capability::Intrinsic> {
            self.1.intrinsic(ck, sk, node, scope)
        }
        fn memory_realization(
            &self,
            dtype: crate::expr::DType,
            scope: &str,
            size: usize,
            attrs: &BTreeMap<String, String>,
        ) -> TensorizeResult<String> {
            self.1.memory_realization(dtype, scope, size, attrs)
        }
    }

    /// WMMA unit whose graph gains a second compute node
    fn broken_factory() -> HwAbsDagFactory {
        Arc::new(|| {
            let graph = WmmaFp16Fp32::new()
                .graph()
                .clone()
                .node("load_a", CapabilityClass::Compute);
            Box::new(Broken(graph, WmmaFp16Fp32::new())) as Box<dyn HwAbsDag>
        })
    }

    #[test]
    fn test_rejects_invalid_definition() {
        let reg = HwAbsDagRegistry::new();
        let err = reg.add("cuda", "broken", broken_factory(), false).unwrap_err();
        assert!(matches!(err, TensorizeError::CapabilityDefinition { .. }));
        assert!(!reg.contains("cuda", "broken"));
    }

    #[test]
    fn test_invalid_unit_fails_construction() {
        fn register_broken(reg: &HwAbsDagRegistry) -> TensorizeResult<()> {
            reg.add("cuda", "broken", broken_factory(), false)
        }
        let result = HwAbsDagRegistry::with_units(&[crate::wmma::register, register_broken]);
        assert!(matches!(result, Err(TensorizeError::CapabilityDefinition { .. })));

        let reg = HwAbsDagRegistry::with_units(&[crate::wmma::register]).unwrap();
        assert_eq!(reg.enumerate("cuda"), vec!["wmma_fp16_fp32".to_string()]);
    }

    #[test]
    fn test_stored_error_keeps_its_kind() {
        let err = stored_error(&TensorizeError::definition("broken", "two compute nodes"));
        assert_eq!(
            err.to_string(),
            "Invalid capability definition 'broken': two compute nodes"
        );
        let dup = stored_error(&TensorizeError::Duplicate {
            target: "cuda".into(),
            mnemonic: "wmma".into(),
        });
        assert!(matches!(dup, TensorizeError::Duplicate { .. }));
    }

    #[test]
    fn test_global_registry_has_builtins() {
        assert!(HwAbsDagRegistry::global()
            .unwrap()
            .enumerate("cuda")
            .contains(&"wmma_fp16_fp32".to_string()));
    }
}
