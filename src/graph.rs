//! Host computation graph
//!
//! Operators live in an arena in insertion order. An operator can only read
//! tensors created before it, so the arena order is always a valid
//! topological order and `OpId` comparisons are "produced before" checks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TensorizeError, TensorizeResult};
use crate::expr::{AxisRef, DType, Expr, IterKind, TensorId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub usize);

/// An iteration axis of a compute operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterVar {
    pub name: String,
    pub extent: usize,
    pub kind: IterKind,
}

impl IterVar {
    pub fn spatial(name: impl Into<String>, extent: usize) -> Self {
        Self {
            name: name.into(),
            extent,
            kind: IterKind::Spatial,
        }
    }

    pub fn reduce(name: impl Into<String>, extent: usize) -> Self {
        Self {
            name: name.into(),
            extent,
            kind: IterKind::Reduce,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub op: OpId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeOp {
    pub axis: Vec<IterVar>,
    pub reduce_axis: Vec<IterVar>,
    pub body: Expr,
}

impl ComputeOp {
    pub fn iter_var(&self, axis: AxisRef) -> Option<&IterVar> {
        match axis {
            AxisRef::Spatial(i) => self.axis.get(i),
            AxisRef::Reduce(i) => self.reduce_axis.get(i),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Placeholder,
    Compute(ComputeOp),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub kind: OpKind,
    pub output: TensorId,
}

impl Operation {
    pub fn as_compute(&self) -> Option<&ComputeOp> {
        match &self.kind {
            OpKind::Compute(c) => Some(c),
            OpKind::Placeholder => None,
        }
    }

    pub fn is_compute(&self) -> bool {
        self.as_compute().is_some()
    }
}

/// A dataflow graph of placeholders and compute operators
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeGraph {
    ops: Vec<Operation>,
    tensors: Vec<Tensor>,
}

impl ComputeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn placeholder(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        dtype: DType,
    ) -> TensorizeResult<TensorId> {
        let name = name.into();
        self.check_name(&name)?;
        Ok(self.push(name, OpKind::Placeholder, shape.to_vec(), dtype))
    }

    /// Add a compute operator built from explicit axes and body
    pub fn compute_with(
        &mut self,
        name: impl Into<String>,
        axis: Vec<IterVar>,
        reduce_axis: Vec<IterVar>,
        dtype: DType,
        body: Expr,
    ) -> TensorizeResult<TensorId> {
        self.compute_op(
            name,
            ComputeOp {
                axis,
                reduce_axis,
                body,
            },
            dtype,
        )
    }

    /// Add an elementwise operator over `shape`; axis `d` is named `i{d}`
    pub fn compute<F>(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        dtype: DType,
        body: F,
    ) -> TensorizeResult<TensorId>
    where
        F: FnOnce(&[Expr]) -> Expr,
    {
        let axis: Vec<IterVar> = shape
            .iter()
            .enumerate()
            .map(|(d, &e)| IterVar::spatial(format!("i{}", d), e))
            .collect();
        let indices: Vec<Expr> = (0..shape.len()).map(Expr::spatial).collect();
        self.compute_with(name, axis, Vec::new(), dtype, body(&indices))
    }

    pub fn compute_op(
        &mut self,
        name: impl Into<String>,
        op: ComputeOp,
        dtype: DType,
    ) -> TensorizeResult<TensorId> {
        let name = name.into();
        self.check_name(&name)?;
        self.check_compute(&name, &op)?;
        let shape = op.axis.iter().map(|iv| iv.extent).collect();
        Ok(self.push(name, OpKind::Compute(op), shape, dtype))
    }

    fn push(&mut self, name: String, kind: OpKind, shape: Vec<usize>, dtype: DType) -> TensorId {
        let op = OpId(self.ops.len());
        let tensor = TensorId(self.tensors.len());
        self.tensors.push(Tensor {
            name: name.clone(),
            shape,
            dtype,
            op,
        });
        self.ops.push(Operation {
            name,
            kind,
            output: tensor,
        });
        tensor
    }

    fn check_name(&self, name: &str) -> TensorizeResult<()> {
        if self.ops.iter().any(|op| op.name == name) {
            return Err(TensorizeError::graph(format!(
                "operator '{}' already exists",
                name
            )));
        }
        Ok(())
    }

    fn check_compute(&self, name: &str, op: &ComputeOp) -> TensorizeResult<()> {
        for iv in op.axis.iter().chain(op.reduce_axis.iter()) {
            if iv.extent == 0 {
                return Err(TensorizeError::graph(format!(
                    "axis '{}' of '{}' has zero extent",
                    iv.name, name
                )));
            }
        }
        if op.body.is_reduction() == op.reduce_axis.is_empty() {
            return Err(TensorizeError::graph(format!(
                "'{}' must sum exactly when it declares reduction axes",
                name
            )));
        }
        for axis in op.body.axes() {
            if op.iter_var(axis).is_none() {
                return Err(TensorizeError::graph(format!(
                    "'{}' references missing axis {:?}",
                    name, axis
                )));
            }
        }
        for (tensor, indices) in op.body.loads() {
            let t = self.tensors.get(tensor.0).ok_or_else(|| {
                TensorizeError::graph(format!("'{}' reads unknown tensor {:?}", name, tensor))
            })?;
            if t.shape.len() != indices.len() {
                return Err(TensorizeError::graph(format!(
                    "'{}' reads '{}' with {} indices, rank is {}",
                    name,
                    t.name,
                    indices.len(),
                    t.shape.len()
                )));
            }
        }
        Ok(())
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn op_ids(&self) -> impl DoubleEndedIterator<Item = OpId> + '_ {
        (0..self.ops.len()).map(OpId)
    }

    pub fn op(&self, id: OpId) -> TensorizeResult<&Operation> {
        self.ops
            .get(id.0)
            .ok_or_else(|| TensorizeError::graph(format!("unknown operator {:?}", id)))
    }

    pub fn compute_of(&self, id: OpId) -> TensorizeResult<&ComputeOp> {
        let op = self.op(id)?;
        op.as_compute().ok_or_else(|| {
            TensorizeError::graph(format!("'{}' is not a compute operator", op.name))
        })
    }

    pub fn tensor(&self, id: TensorId) -> TensorizeResult<&Tensor> {
        self.tensors
            .get(id.0)
            .ok_or_else(|| TensorizeError::graph(format!("unknown tensor {:?}", id)))
    }

    pub fn find_op(&self, name: &str) -> Option<OpId> {
        self.ops.iter().position(|op| op.name == name).map(OpId)
    }

    pub fn output_of(&self, id: OpId) -> TensorizeResult<TensorId> {
        Ok(self.op(id)?.output)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Tensors an operator reads, in encounter order
    pub fn input_tensors(&self, id: OpId) -> TensorizeResult<Vec<TensorId>> {
        Ok(match &self.op(id)?.kind {
            OpKind::Compute(c) => c.body.tensors(),
            OpKind::Placeholder => Vec::new(),
        })
    }

    /// Producer operators of `id`
    pub fn read_graph(&self, id: OpId) -> TensorizeResult<Vec<OpId>> {
        self.input_tensors(id)?
            .into_iter()
            .map(|t| Ok(self.tensor(t)?.op))
            .collect()
    }

    /// Consumers of every operator that has at least one, in graph order
    pub fn feed_graph(&self) -> BTreeMap<OpId, Vec<OpId>> {
        let mut feed: BTreeMap<OpId, Vec<OpId>> = BTreeMap::new();
        for (i, op) in self.ops.iter().enumerate() {
            if let OpKind::Compute(c) = &op.kind {
                for t in c.body.tensors() {
                    if let Some(tensor) = self.tensors.get(t.0) {
                        feed.entry(tensor.op).or_default().push(OpId(i));
                    }
                }
            }
        }
        feed
    }

    pub fn consumers(&self, id: OpId) -> Vec<OpId> {
        self.feed_graph().remove(&id).unwrap_or_default()
    }

    /// The final compute operator in graph order
    pub fn last_op(&self) -> Option<OpId> {
        self.ops.iter().rposition(Operation::is_compute).map(OpId)
    }

    /// Operators nothing reads
    pub fn outputs(&self) -> Vec<OpId> {
        let feed = self.feed_graph();
        self.op_ids().filter(|id| !feed.contains_key(id)).collect()
    }

    /// An operator can be inlined when it is a pure elementwise compute
    /// operator that somebody consumes.
    pub fn can_inline(&self, id: OpId) -> bool {
        match self.op(id).map(|op| &op.kind) {
            Ok(OpKind::Compute(c)) => {
                c.reduce_axis.is_empty() && !c.body.is_reduction() && !self.consumers(id).is_empty()
            }
            _ => false,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Placeholders an operator set depends on, used by tests and the driver
pub fn placeholders(graph: &ComputeGraph) -> BTreeSet<OpId> {
    graph
        .op_ids()
        .filter(|&id| matches!(graph.op(id).map(|op| &op.kind), Ok(OpKind::Placeholder)))
        .collect()
}

impl fmt::Display for ComputeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, op) in self.ops.iter().enumerate() {
            let out = &self.tensors[op.output.0];
            match &op.kind {
                OpKind::Placeholder => {
                    writeln!(f, "%{} {} = placeholder{:?} {}", i, op.name, out.shape, out.dtype)?
                }
                OpKind::Compute(c) => {
                    let axes: Vec<String> = c
                        .axis
                        .iter()
                        .chain(c.reduce_axis.iter())
                        .map(|iv| format!("{}:{}", iv.name, iv.extent))
                        .collect();
                    writeln!(
                        f,
                        "%{} {}[{}] {} = {}",
                        i,
                        op.name,
                        axes.join(", "),
                        out.dtype,
                        c.body
                    )?
                }
            }
        }
        Ok(())
    }
}

/// GEMM followed by a bias add, the canonical host graph used in tests and
/// the driver binary.
pub fn gemm_bias(m: usize, n: usize, k: usize) -> TensorizeResult<ComputeGraph> {
    let mut g = ComputeGraph::new();
    let a = g.placeholder("A", &[m, k], DType::F16)?;
    let b = g.placeholder("B", &[k, n], DType::F16)?;
    let bias = g.placeholder("bias", &[n], DType::F32)?;
    let lhs = Expr::cast(DType::F32, Expr::load(a, vec![Expr::spatial(0), Expr::reduce(0)]));
    let rhs = Expr::cast(DType::F32, Expr::load(b, vec![Expr::reduce(0), Expr::spatial(1)]));
    let c = g.compute_with(
        "gemm",
        vec![IterVar::spatial("i", m), IterVar::spatial("j", n)],
        vec![IterVar::reduce("k", k)],
        DType::F32,
        Expr::sum(lhs * rhs),
    )?;
    g.compute("bias_add", &[m, n], DType::F32, |idx| {
        Expr::load(c, idx.to_vec()) + Expr::load(bias, vec![idx[1].clone()])
    })?;
    Ok(g)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemm_bias_structure() {
        let g = gemm_bias(64, 32, 16).unwrap();
        assert_eq!(g.len(), 5);
        let gemm = g.find_op("gemm").unwrap();
        let bias_add = g.find_op("bias_add").unwrap();
        assert_eq!(g.consumers(gemm), vec![bias_add]);
        assert_eq!(g.last_op(), Some(bias_add));
        assert_eq!(g.outputs(), vec![bias_add]);
        assert_eq!(g.tensor(g.output_of(gemm).unwrap()).unwrap().shape, vec![64, 32]);
        assert_eq!(placeholders(&g).len(), 3);
    }

    #[test]
    fn test_read_graph_and_input_tensors() {
        let g = gemm_bias(64, 32, 16).unwrap();
        let gemm = g.find_op("gemm").unwrap();
        let inputs = g.input_tensors(gemm).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(g.read_graph(gemm).unwrap(), vec![OpId(0), OpId(1)]);
    }

    #[test]
    fn test_can_inline() {
        let g = gemm_bias(64, 32, 16).unwrap();
        assert!(!g.can_inline(g.find_op("gemm").unwrap()));
        // nothing consumes the final operator
        assert!(!g.can_inline(g.find_op("bias_add").unwrap()));
        assert!(!g.can_inline(g.find_op("A").unwrap()));
    }

    #[test]
    fn test_rejects_rank_mismatch() {
        let mut g = ComputeGraph::new();
        let a = g.placeholder("A", &[4, 4], DType::F32).unwrap();
        let err = g
            .compute("bad", &[4], DType::F32, |idx| Expr::load(a, idx.to_vec()))
            .unwrap_err();
        assert!(matches!(err, TensorizeError::Graph { .. }));
    }

    #[test]
    fn test_rejects_duplicate_name() {
        let mut g = ComputeGraph::new();
        g.placeholder("A", &[4], DType::F32).unwrap();
        assert!(g.placeholder("A", &[4], DType::F32).is_err());
    }

    #[test]
    fn test_rejects_sum_without_reduce_axis() {
        let mut g = ComputeGraph::new();
        let a = g.placeholder("A", &[4], DType::F32).unwrap();
        let err = g.compute("s", &[4], DType::F32, |idx| Expr::sum(Expr::load(a, idx.to_vec())));
        assert!(err.is_err());
    }
}
