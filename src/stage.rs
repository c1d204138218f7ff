//! Operator roles and the stage record produced by a successful splice

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::HwAbsDag;
use crate::error::{TensorizeError, TensorizeResult};
use crate::graph::{ComputeGraph, OpId};
use crate::hardware::InstructionScope;
use crate::splice::ConstructedDag;

/// Role of a spliced operator inside the matched unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationRole {
    Elementwise,
    Output,
    Main,
    Load,
}

/// Immutable metadata describing the spliced unit, consumed by the
/// generator and the applier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwAbsDagStage {
    pub operation_role: BTreeMap<OpId, OperationRole>,
    pub target: String,
    pub hw_abs_dag_key: String,
    pub compute_key: String,
    pub shape_key: String,
    /// operator -> capability node it implements
    pub hw_abs_key: BTreeMap<OpId, String>,
    /// innermost spatial axes each operator keeps for the instruction
    pub reserve_inner_axis_count: BTreeMap<OpId, usize>,
    pub main_op_reserve_reduce_axis: Vec<usize>,
    pub main_op_reserve_reduce_axis_factor: Vec<usize>,
    pub load_from_shared: BTreeMap<OpId, bool>,
    pub store_to_shared: BTreeMap<OpId, bool>,
    pub instruction_scope: InstructionScope,
}

impl HwAbsDagStage {
    /// Classify the constructed operators. Returns the stage together with
    /// the main and output operators.
    pub fn build(
        dag: &dyn HwAbsDag,
        compute_key: &str,
        shape_key: &str,
        graph: &ComputeGraph,
        constructed: &ConstructedDag,
    ) -> TensorizeResult<(Self, OpId, OpId)> {
        let cap = dag.graph();
        let serialized = cap.serialize(|n| cap.nodes.contains_key(n), |_| true)?;

        let mut operation_role = BTreeMap::new();
        let mut hw_abs_key = BTreeMap::new();
        let mut reserve_inner_axis_count = BTreeMap::new();
        let mut main_op_reserve_reduce_axis = Vec::new();
        let mut main_op_reserve_reduce_axis_factor = Vec::new();
        let mut load_from_shared = BTreeMap::new();
        let mut store_to_shared = BTreeMap::new();
        let mut main_op = None;
        let mut output_op = None;

        for name in &serialized.nodes {
            let tensor = constructed
                .nodes
                .get(name)
                .and_then(|ts| ts.first())
                .ok_or_else(|| TensorizeError::matching(format!("node '{}' was not constructed", name)))?;
            let op = graph.tensor(*tensor)?.op;
            hw_abs_key.insert(op, name.clone());
            let (spatial, reduce) = dag.reserve_axes(compute_key, shape_key, name)?;
            reserve_inner_axis_count.insert(op, spatial);

            let role = if *name == cap.main_node {
                let total = graph.compute_of(op)?.reduce_axis.len();
                if total < reduce.len() {
                    return Err(TensorizeError::matching(format!(
                        "main operator has {} reduce axes, instruction reserves {}",
                        total,
                        reduce.len()
                    )));
                }
                for (i, extent) in reduce.iter().enumerate() {
                    main_op_reserve_reduce_axis.push(total - reduce.len() + i);
                    main_op_reserve_reduce_axis_factor.push(*extent);
                }
                main_op = Some(op);
                OperationRole::Main
            } else if !serialized.read_graph.contains_key(name) {
                load_from_shared.insert(op, true);
                OperationRole::Load
            } else if !serialized.feed_graph.contains_key(name) {
                store_to_shared.insert(op, false);
                output_op = Some(op);
                OperationRole::Output
            } else {
                OperationRole::Elementwise
            };
            operation_role.insert(op, role);
        }

        let main_op = main_op.ok_or_else(|| TensorizeError::matching("no main operator after splicing"))?;
        let output_op = output_op.ok_or_else(|| TensorizeError::matching("no output operator after splicing"))?;
        debug!(
            dag = dag.name(),
            ops = operation_role.len(),
            reserve_reduce = ?main_op_reserve_reduce_axis,
            "built stage"
        );

        let stage = Self {
            operation_role,
            target: dag.target().to_string(),
            hw_abs_dag_key: dag.name().to_string(),
            compute_key: compute_key.to_string(),
            shape_key: shape_key.to_string(),
            hw_abs_key,
            reserve_inner_axis_count,
            main_op_reserve_reduce_axis,
            main_op_reserve_reduce_axis_factor,
            load_from_shared,
            store_to_shared,
            instruction_scope: dag.scope(),
        };
        Ok((stage, main_op, output_op))
    }

    pub fn role(&self, op: OpId) -> Option<OperationRole> {
        self.operation_role.get(&op).copied()
    }

    pub fn is_stage_op(&self, op: OpId) -> bool {
        self.operation_role.contains_key(&op)
    }

    pub fn has_role(&self, op: OpId, role: OperationRole) -> bool {
        self.role(op) == Some(role)
    }

    pub fn reserve_count(&self, op: OpId) -> TensorizeResult<usize> {
        self.reserve_inner_axis_count
            .get(&op)
            .copied()
            .ok_or_else(|| TensorizeError::structural(format!("{:?}", op), "no reserved axis count"))
    }

    pub fn node_name(&self, op: OpId) -> TensorizeResult<&str> {
        self.hw_abs_key
            .get(&op)
            .map(String::as_str)
            .ok_or_else(|| TensorizeError::structural(format!("{:?}", op), "not part of the stage"))
    }
}
