//! Warp-level matrix multiply-accumulate, fp16 inputs and fp32 accumulator
//!
//! ```text
//!   a --> load_a --\
//!                   mma --> store
//!   b --> load_b --/
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::capability::{
    CapabilityClass, CapabilityGraph, HwAbsDag, InputSpec, Intrinsic, NodeExpression, ProblemSize,
};
use crate::error::{TensorizeError, TensorizeResult};
use crate::expr::{DType, Expr, TensorId};
use crate::graph::IterVar;
use crate::hardware::{DeviceConfig, InstructionScope, MemoryScope};
use crate::registry::{HwAbsDagFactory, HwAbsDagRegistry};

pub const TARGET: &str = "cuda";
pub const MNEMONIC: &str = "wmma_fp16_fp32";

const COMPUTE_KEYS: [&str; 2] = ["nnn", "ntn"];
const SHAPE_KEYS: [&str; 3] = ["16x16x16", "32x8x16", "8x32x16"];

/// Register the unit under `cuda` / `wmma_fp16_fp32`
pub fn register(registry: &HwAbsDagRegistry) -> TensorizeResult<()> {
    let factory: HwAbsDagFactory = Arc::new(|| Box::new(WmmaFp16Fp32::new()) as Box<dyn HwAbsDag>);
    registry.add(TARGET, MNEMONIC, factory, false)
}

#[derive(Debug, Clone)]
pub struct WmmaFp16Fp32 {
    graph: CapabilityGraph,
}

impl WmmaFp16Fp32 {
    pub fn new() -> Self {
        let graph = CapabilityGraph::new(MNEMONIC, "mma", "mma")
            .node("load_a", CapabilityClass::Memory)
            .node("load_b", CapabilityClass::Memory)
            .node("mma", CapabilityClass::Compute)
            .node("store", CapabilityClass::Memory)
            .edge("load_a", &["a"])
            .edge("load_b", &["b"])
            .edge("mma", &["load_a", "load_b"])
            .edge("store", &["mma"]);
        Self { graph }
    }

    fn check_compute_key(&self, compute_key: &str) -> TensorizeResult<()> {
        if COMPUTE_KEYS.contains(&compute_key) {
            Ok(())
        } else {
            Err(TensorizeError::unknown_key(MNEMONIC, compute_key))
        }
    }

    fn node_dtype(&self, node: &str) -> TensorizeResult<DType> {
        match node {
            "load_a" | "load_b" => Ok(DType::F16),
            "mma" | "store" => Ok(DType::F32),
            other => Err(TensorizeError::unknown_key(MNEMONIC, other)),
        }
    }

    /// Shapes of operand A and B for the given layout
    fn operand_shapes(&self, compute_key: &str, size: ProblemSize) -> (Vec<usize>, Vec<usize>) {
        let a = vec![size.m, size.k];
        let b = if compute_key == "ntn" {
            vec![size.n, size.k]
        } else {
            vec![size.k, size.n]
        };
        (a, b)
    }
}

impl Default for WmmaFp16Fp32 {
    fn default() -> Self {
        Self::new()
    }
}

/// `out[i...] = in[i...]` over `shape`
fn copy_expression(name: &str, shape: &[usize], in_dtype: DType, out_dtype: DType) -> NodeExpression {
    let axis = shape
        .iter()
        .enumerate()
        .map(|(d, &e)| IterVar::spatial(format!("{}.i{}", name, d), e))
        .collect();
    let indices = (0..shape.len()).map(Expr::spatial).collect();
    NodeExpression {
        name: name.to_string(),
        inputs: vec![InputSpec {
            name: "src".to_string(),
            shape: shape.to_vec(),
            dtype: in_dtype,
        }],
        axis,
        reduce_axis: Vec::new(),
        dtype: out_dtype,
        body: Expr::load(TensorId(0), indices),
    }
}

impl HwAbsDag for WmmaFp16Fp32 {
    fn name(&self) -> &str {
        MNEMONIC
    }

    fn target(&self) -> &str {
        TARGET
    }

    fn scope(&self) -> InstructionScope {
        InstructionScope::Warp
    }

    fn graph(&self) -> &CapabilityGraph {
        &self.graph
    }

    fn compute_keys(&self) -> Vec<String> {
        COMPUTE_KEYS.iter().map(|s| s.to_string()).collect()
    }

    fn shape_keys(&self) -> Vec<String> {
        SHAPE_KEYS.iter().map(|s| s.to_string()).collect()
    }

    fn main_expression(&self, compute_key: &str, shape_key: &str) -> TensorizeResult<NodeExpression> {
        self.check_compute_key(compute_key)?;
        let size = self.problem_size(shape_key)?;
        let (a_shape, b_shape) = self.operand_shapes(compute_key, size);
        let a = Expr::load(TensorId(0), vec![Expr::spatial(0), Expr::reduce(0)]);
        let b = if compute_key == "ntn" {
            Expr::load(TensorId(1), vec![Expr::spatial(1), Expr::reduce(0)])
        } else {
            Expr::load(TensorId(1), vec![Expr::reduce(0), Expr::spatial(1)])
        };
        Ok(NodeExpression {
            name: "mma".to_string(),
            inputs: vec![
                InputSpec {
                    name: "a".to_string(),
                    shape: a_shape,
                    dtype: DType::F16,
                },
                InputSpec {
                    name: "b".to_string(),
                    shape: b_shape,
                    dtype: DType::F16,
                },
            ],
            axis: vec![IterVar::spatial("i", size.m), IterVar::spatial("j", size.n)],
            reduce_axis: vec![IterVar::reduce("k", size.k)],
            dtype: DType::F32,
            body: Expr::sum(Expr::cast(DType::F32, a) * Expr::cast(DType::F32, b)),
        })
    }

    fn node_expression(&self, compute_key: &str, shape_key: &str, node: &str) -> TensorizeResult<NodeExpression> {
        self.check_compute_key(compute_key)?;
        let size = self.problem_size(shape_key)?;
        let (a_shape, b_shape) = self.operand_shapes(compute_key, size);
        match node {
            "load_a" => Ok(copy_expression(node, &a_shape, DType::F16, DType::F16)),
            "load_b" => Ok(copy_expression(node, &b_shape, DType::F16, DType::F16)),
            "mma" => self.main_expression(compute_key, shape_key),
            "store" => Ok(copy_expression(node, &[size.m, size.n], DType::F32, DType::F32)),
            other => Err(TensorizeError::unknown_key(MNEMONIC, other)),
        }
    }

    fn node_expression_with_shape(
        &self,
        compute_key: &str,
        shape_key: &str,
        node: &str,
        input_shapes: &[Vec<usize>],
    ) -> TensorizeResult<NodeExpression> {
        if node == self.graph.main_node {
            return self.main_expression(compute_key, shape_key);
        }
        self.check_compute_key(compute_key)?;
        self.problem_size(shape_key)?;
        let dtype = self.node_dtype(node)?;
        let shape = input_shapes.first().ok_or_else(|| {
            TensorizeError::matching(format!("'{}' needs exactly one input shape", node))
        })?;
        Ok(copy_expression(node, shape, dtype, dtype))
    }

    fn problem_size(&self, shape_key: &str) -> TensorizeResult<ProblemSize> {
        if !SHAPE_KEYS.contains(&shape_key) {
            return Err(TensorizeError::unknown_key(MNEMONIC, shape_key));
        }
        ProblemSize::parse(shape_key).ok_or_else(|| TensorizeError::unknown_key(MNEMONIC, shape_key))
    }

    fn intrinsic(
        &self,
        compute_key: &str,
        shape_key: &str,
        node: &str,
        output_scope: Option<MemoryScope>,
    ) -> TensorizeResult<Intrinsic> {
        self.check_compute_key(compute_key)?;
        self.problem_size(shape_key)?;
        let name = match node {
            "load_a" | "load_b" => "nvcuda::wmma::load_matrix_sync",
            "mma" => "nvcuda::wmma::mma_sync",
            "store" => "nvcuda::wmma::store_matrix_sync",
            other => return Err(TensorizeError::unknown_key(MNEMONIC, other)),
        };
        Ok(Intrinsic {
            name: name.to_string(),
            node: node.to_string(),
            compute_key: compute_key.to_string(),
            shape_key: shape_key.to_string(),
            output_scope,
        })
    }

    fn memory_realization(
        &self,
        dtype: DType,
        scope: &str,
        _constant_size: usize,
        attributes: &BTreeMap<String, String>,
    ) -> TensorizeResult<String> {
        let dim = |key: &str| attributes.get(key).map(String::as_str).unwrap_or("16");
        let ty = match dtype {
            DType::F16 => "half",
            DType::F32 => "float",
            other => return Err(TensorizeError::matching(format!("no fragment type for {}", other))),
        };
        let fragment = match scope {
            "wmma::matrix_a" => "matrix_a",
            "wmma::matrix_b" => "matrix_b",
            "wmma::accumulator" => {
                return Ok(format!(
                    "nvcuda::wmma::fragment<nvcuda::wmma::accumulator, {}, {}, {}, {}>",
                    dim("m"),
                    dim("n"),
                    dim("k"),
                    ty
                ))
            }
            other => return Err(TensorizeError::matching(format!("unknown fragment scope '{}'", other))),
        };
        let layout = attributes.get("layout").map(String::as_str).unwrap_or("row_major");
        Ok(format!(
            "nvcuda::wmma::fragment<nvcuda::wmma::{}, {}, {}, {}, {}, nvcuda::wmma::{}>",
            fragment,
            dim("m"),
            dim("n"),
            dim("k"),
            ty,
            layout
        ))
    }

    fn header(&self) -> &str {
        "#include <mma.h>\n"
    }

    fn check_target_eligibility(&self, device: &DeviceConfig) -> bool {
        device.target == TARGET && device.arch >= 70
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_is_valid() {
        let dag = WmmaFp16Fp32::new();
        dag.graph().validate().unwrap();
        assert_eq!(dag.scope(), InstructionScope::Warp);
    }

    #[test]
    fn test_main_expression_layouts() {
        let dag = WmmaFp16Fp32::new();
        let nnn = dag.main_expression("nnn", "32x8x16").unwrap();
        assert_eq!(nnn.output_shape(), vec![32, 8]);
        assert_eq!(nnn.inputs[1].shape, vec![16, 8]);
        let ntn = dag.main_expression("ntn", "32x8x16").unwrap();
        assert_eq!(ntn.inputs[1].shape, vec![8, 16]);
        assert!(matches!(
            dag.main_expression("ttt", "16x16x16"),
            Err(TensorizeError::UnknownKey { .. })
        ));
    }

    #[test]
    fn test_reserve_axes() {
        let dag = WmmaFp16Fp32::new();
        assert_eq!(dag.reserve_axes("nnn", "16x16x16", "mma").unwrap(), (2, vec![16]));
        assert_eq!(dag.reserve_axes("nnn", "16x16x16", "load_a").unwrap(), (2, vec![]));
    }

    #[test]
    fn test_effective_compute_dag() {
        let dag = WmmaFp16Fp32::new();
        let g = dag.effective_compute_dag("nnn", "16x16x16").unwrap();
        // two operand placeholders plus the mma itself
        assert_eq!(g.len(), 3);
        assert!(g.find_op("mma").is_some());
    }

    #[test]
    fn test_intrinsic_and_realization() {
        let dag = WmmaFp16Fp32::new();
        let intrin = dag.intrinsic("nnn", "16x16x16", "mma", None).unwrap();
        assert_eq!(intrin.name, "nvcuda::wmma::mma_sync");

        let attrs = BTreeMap::from([("layout".to_string(), "col_major".to_string())]);
        let s = dag
            .memory_realization(DType::F16, "wmma::matrix_b", 256, &attrs)
            .unwrap();
        assert_eq!(
            s,
            "nvcuda::wmma::fragment<nvcuda::wmma::matrix_b, 16, 16, 16, half, nvcuda::wmma::col_major>"
        );
        assert!(dag.check_target_eligibility(&DeviceConfig::cuda(75)));
        assert!(!dag.check_target_eligibility(&DeviceConfig::cuda(61)));
    }
}
