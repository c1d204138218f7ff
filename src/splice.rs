//! DAG splicer
//!
//! Embeds a capability graph into a host graph at the matched operator. The
//! walk goes backwards from the anchor to build the unit's inputs, then
//! forwards along the feed graph to build its outputs. Each capability node
//! is materialized once, and neither the capability graph nor the host graph
//! is touched: the result is written into a separate builder graph.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::capability::HwAbsDag;
use crate::error::{TensorizeError, TensorizeResult};
use crate::expr::{DType, TensorId};
use crate::graph::{ComputeGraph, ComputeOp, OpId, OpKind};
use crate::stage::HwAbsDagStage;
use crate::transform::{transform_main_op, IntrinMatch};

/// Host tensors handed to `construct_dag`
#[derive(Debug, Clone, Copy)]
pub struct DagInputs<'a> {
    /// Tensors the entry operator may read, also the external input pool
    pub input_tensors: &'a [TensorId],
    /// Output of the operator matched to the main node
    pub entry_tensors: &'a [TensorId],
    /// Appended to the external pool after `input_tensors`
    pub addition_inputs: &'a [TensorId],
    /// Host tensors replaced by the unit's outputs; defaults to the entry
    pub output_tensors: Option<&'a [TensorId]>,
}

/// What `construct_dag` built
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConstructedDag {
    /// External slots bound from the input pool, in binding order
    pub input_names: Vec<String>,
    /// Capability nodes without consumers
    pub output_names: Vec<String>,
    /// Node or slot name -> tensors in the builder graph
    pub nodes: BTreeMap<String, Vec<TensorId>>,
    pub read_graph: BTreeMap<String, Vec<String>>,
    pub feed_graph: BTreeMap<String, Vec<String>>,
    /// Host output tensor -> builder tensor that now stands for it
    pub rewired: BTreeMap<TensorId, TensorId>,
}

struct Construction<'a> {
    dag: &'a dyn HwAbsDag,
    compute_key: &'a str,
    shape_key: &'a str,
    host: &'a ComputeGraph,
    inputs: &'a DagInputs<'a>,
    builder: &'a mut ComputeGraph,
    imported: &'a BTreeMap<TensorId, TensorId>,
    entry_op: OpId,
    read_graph: BTreeMap<String, Vec<String>>,
    feed_graph: BTreeMap<String, Vec<String>>,
    nodes: BTreeMap<String, Vec<TensorId>>,
    input_names: Vec<String>,
    output_names: Vec<String>,
    next_input: usize,
}

impl<'a> Construction<'a> {
    fn import(&self, t: TensorId) -> TensorizeResult<TensorId> {
        self.imported.get(&t).copied().ok_or_else(|| {
            TensorizeError::graph(format!("host tensor {:?} has not been imported", t))
        })
    }

    fn entry_name(&self) -> TensorizeResult<&str> {
        Ok(self.host.op(self.entry_op)?.name.as_str())
    }

    fn take_input(&mut self, slot: &str) -> TensorizeResult<TensorId> {
        let pool_len = self.inputs.input_tensors.len() + self.inputs.addition_inputs.len();
        let host_tensor = self
            .inputs
            .input_tensors
            .iter()
            .chain(self.inputs.addition_inputs.iter())
            .nth(self.next_input)
            .copied()
            .ok_or_else(|| {
                TensorizeError::matching(format!(
                    "input pool of {} tensors exhausted at slot '{}'",
                    pool_len, slot
                ))
            })?;
        self.next_input += 1;
        self.import(host_tensor)
    }

    /// Rebuild the entry body reading `new_inputs` in place of the host inputs
    fn compute_like_entry(&mut self, new_inputs: &[TensorId]) -> TensorizeResult<TensorId> {
        let entry = self.host.compute_of(self.entry_op)?;
        let declared = self.inputs.input_tensors;
        let reads = entry.body.tensors();
        if reads.len() > new_inputs.len() {
            return Err(TensorizeError::matching(format!(
                "entry reads {} tensors, unit provides {}",
                reads.len(),
                new_inputs.len()
            )));
        }
        let body = entry.body.map_tensors(&mut |t| {
            let pos = declared.iter().position(|d| *d == t).ok_or_else(|| {
                TensorizeError::matching(format!("entry reads undeclared tensor {:?}", t))
            })?;
            new_inputs.get(pos).copied().ok_or_else(|| {
                TensorizeError::matching(format!("no constructed input for position {}", pos))
            })
        })?;
        let dtype = self.host.tensor(self.host.output_of(self.entry_op)?)?.dtype;
        let op = ComputeOp {
            axis: entry.axis.clone(),
            reduce_axis: entry.reduce_axis.clone(),
            body,
        };
        let name = self.entry_name()?.to_string();
        self.builder.compute_op(name, op, dtype)
    }

    fn materialize(&mut self, node: &str, new_inputs: &[TensorId]) -> TensorizeResult<TensorId> {
        let shapes = new_inputs
            .iter()
            .map(|t| Ok(self.builder.tensor(*t)?.shape.clone()))
            .collect::<TensorizeResult<Vec<_>>>()?;
        let expr = self
            .dag
            .node_expression_with_shape(self.compute_key, self.shape_key, node, &shapes)?;
        let name = format!("{}.{}", self.entry_name()?, node);
        expr.instantiate(self.builder, name, new_inputs)
    }

    fn construct_inputs(&mut self, cur: &str) -> TensorizeResult<()> {
        if self.nodes.contains_key(cur) {
            return Ok(());
        }
        let is_main = cur == self.dag.graph().main_node;
        let Some(reads) = self.read_graph.get(cur).cloned() else {
            let tensor = if is_main {
                let own: Vec<TensorId> = self
                    .inputs
                    .input_tensors
                    .iter()
                    .map(|t| self.import(*t))
                    .collect::<TensorizeResult<_>>()?;
                self.compute_like_entry(&own)?
            } else {
                let t = self.take_input(cur)?;
                self.input_names.push(cur.to_string());
                t
            };
            self.nodes.insert(cur.to_string(), vec![tensor]);
            return Ok(());
        };

        let mut new_inputs = Vec::new();
        for inp in &reads {
            self.construct_inputs(inp)?;
            new_inputs.extend(self.nodes.get(inp).cloned().unwrap_or_default());
        }
        let tensor = if is_main {
            self.compute_like_entry(&new_inputs)?
        } else {
            self.materialize(cur, &new_inputs)?
        };
        self.nodes.insert(cur.to_string(), vec![tensor]);
        Ok(())
    }

    fn construct_outputs(&mut self, cur: &str) -> TensorizeResult<()> {
        if !self.nodes.contains_key(cur) {
            let reads = self.read_graph.get(cur).cloned().ok_or_else(|| {
                TensorizeError::matching(format!("'{}' has no inputs to build from", cur))
            })?;
            let mut new_inputs = Vec::new();
            for inp in &reads {
                match self.nodes.get(inp) {
                    Some(ts) => new_inputs.extend(ts.iter().copied()),
                    // another branch builds it
                    None => return Ok(()),
                }
            }
            let tensor = self.materialize(cur, &new_inputs)?;
            self.nodes.insert(cur.to_string(), vec![tensor]);
        }
        match self.feed_graph.get(cur).cloned() {
            None => self.output_names.push(cur.to_string()),
            Some(consumers) => {
                for consumer in &consumers {
                    self.construct_outputs(consumer)?;
                }
            }
        }
        Ok(())
    }
}

/// Build the unit's operators into `builder` around the entry operator.
///
/// `imported` maps host tensors already copied into `builder` to their copies.
pub fn construct_dag(
    dag: &dyn HwAbsDag,
    compute_key: &str,
    shape_key: &str,
    host: &ComputeGraph,
    inputs: &DagInputs<'_>,
    builder: &mut ComputeGraph,
    imported: &BTreeMap<TensorId, TensorId>,
) -> TensorizeResult<ConstructedDag> {
    let entry_tensor = *inputs
        .entry_tensors
        .first()
        .ok_or_else(|| TensorizeError::matching("no entry tensor"))?;
    let entry_op = host.tensor(entry_tensor)?.op;
    for t in host.input_tensors(entry_op)? {
        if !inputs.input_tensors.contains(&t) {
            return Err(TensorizeError::matching(format!(
                "can't construct dag from multi-stage entry: '{}' reads '{}' outside the declared inputs",
                host.op(entry_op)?.name,
                host.tensor(t)?.name
            )));
        }
    }
    let cap = dag.graph();
    if !cap.valid() {
        return Err(TensorizeError::definition(
            dag.name(),
            "main node must be the only compute node",
        ));
    }

    let mut c = Construction {
        dag,
        compute_key,
        shape_key,
        host,
        inputs,
        builder,
        imported,
        entry_op,
        read_graph: cap.edges.clone(),
        feed_graph: cap.feed_graph(),
        nodes: BTreeMap::new(),
        input_names: Vec::new(),
        output_names: Vec::new(),
        next_input: 0,
    };
    c.construct_inputs(&cap.anchor)?;
    c.construct_outputs(&cap.anchor)?;

    let outputs = inputs.output_tensors.unwrap_or(inputs.entry_tensors);
    let built: Vec<TensorId> = c
        .output_names
        .iter()
        .flat_map(|n| c.nodes.get(n).cloned().unwrap_or_default())
        .collect();
    if built.len() != outputs.len() {
        return Err(TensorizeError::matching(format!(
            "{} output tensors to rewire, unit produced {}",
            outputs.len(),
            built.len()
        )));
    }
    let rewired = outputs.iter().copied().zip(built).collect();

    Ok(ConstructedDag {
        input_names: c.input_names,
        output_names: c.output_names,
        nodes: c.nodes,
        read_graph: c.read_graph,
        feed_graph: c.feed_graph,
        rewired,
    })
}

/// Copy one host operator into `builder`, reading remapped tensors
fn copy_op(
    host: &ComputeGraph,
    id: OpId,
    builder: &mut ComputeGraph,
    imported: &BTreeMap<TensorId, TensorId>,
) -> TensorizeResult<TensorId> {
    let op = host.op(id)?;
    let tensor = host.tensor(op.output)?;
    match &op.kind {
        OpKind::Placeholder => builder.placeholder(op.name.as_str(), &tensor.shape, tensor.dtype),
        OpKind::Compute(c) => {
            let body = c.body.map_tensors(&mut |t| {
                imported
                    .get(&t)
                    .copied()
                    .ok_or_else(|| TensorizeError::graph(format!("tensor {:?} not yet copied", t)))
            })?;
            builder.compute_op(
                op.name.as_str(),
                ComputeOp {
                    axis: c.axis.clone(),
                    reduce_axis: c.reduce_axis.clone(),
                    body,
                },
                tensor.dtype,
            )
        }
    }
}

/// Host graph with the main operator replaced by the unit's operators
#[derive(Debug, Clone)]
pub struct Reconstructed {
    pub graph: ComputeGraph,
    pub constructed: ConstructedDag,
}

/// Copy `host`, replacing `main_op` with the spliced unit and rewiring its
/// readers to the unit's outputs.
pub fn reconstruct_dag_as_intrin(
    host: &ComputeGraph,
    main_op: OpId,
    dag: &dyn HwAbsDag,
    compute_key: &str,
    shape_key: &str,
) -> TensorizeResult<Reconstructed> {
    let mut builder = ComputeGraph::new();
    let mut imported: BTreeMap<TensorId, TensorId> = BTreeMap::new();
    let mut constructed = None;

    for id in host.op_ids() {
        if id == main_op {
            let input_tensors = host.input_tensors(id)?;
            let entry_tensors = [host.output_of(id)?];
            let inputs = DagInputs {
                input_tensors: &input_tensors,
                entry_tensors: &entry_tensors,
                addition_inputs: &[],
                output_tensors: None,
            };
            let built = construct_dag(
                dag,
                compute_key,
                shape_key,
                host,
                &inputs,
                &mut builder,
                &imported,
            )?;
            imported.extend(built.rewired.iter().map(|(h, b)| (*h, *b)));
            constructed = Some(built);
        } else {
            let t = copy_op(host, id, &mut builder, &imported)?;
            imported.insert(host.output_of(id)?, t);
        }
    }

    let constructed =
        constructed.ok_or_else(|| TensorizeError::matching(format!("{:?} is not in the graph", main_op)))?;
    Ok(Reconstructed {
        graph: builder,
        constructed,
    })
}

/// A host graph with one unit spliced in, ready for scheduling
#[derive(Clone)]
pub struct SplicedDag {
    pub graph: ComputeGraph,
    pub stage: HwAbsDagStage,
    pub main_op: OpId,
    pub output_op: OpId,
    /// Final compute operator of the graph
    pub last_op: OpId,
    pub constructed: ConstructedDag,
    pub dag: Arc<dyn HwAbsDag>,
}

impl SplicedDag {
    /// Element type the main operator reads, drives vector lengths
    pub fn main_input_dtype(&self) -> TensorizeResult<DType> {
        let first = self
            .graph
            .input_tensors(self.main_op)?
            .into_iter()
            .next()
            .ok_or_else(|| TensorizeError::structural("main", "main operator reads nothing"))?;
        Ok(self.graph.tensor(first)?.dtype)
    }
}

impl fmt::Debug for SplicedDag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplicedDag")
            .field("dag", &self.dag.name())
            .field("stage", &self.stage)
            .field("main_op", &self.main_op)
            .field("output_op", &self.output_op)
            .field("last_op", &self.last_op)
            .field("ops", &self.graph.len())
            .finish()
    }
}

/// Tile the matched operator, splice the unit in and classify the result
pub fn splice(
    dag: Arc<dyn HwAbsDag>,
    host: &ComputeGraph,
    m: &IntrinMatch,
) -> TensorizeResult<SplicedDag> {
    let transformed = transform_main_op(host, dag.as_ref(), m)?;
    let rec = reconstruct_dag_as_intrin(
        &transformed.graph,
        transformed.main_op,
        dag.as_ref(),
        &m.compute_key,
        &m.shape_key,
    )?;
    let (stage, main_op, output_op) = HwAbsDagStage::build(
        dag.as_ref(),
        &m.compute_key,
        &m.shape_key,
        &rec.graph,
        &rec.constructed,
    )?;
    let last_op = rec
        .graph
        .last_op()
        .ok_or_else(|| TensorizeError::structural("graph", "no compute operator"))?;
    debug!(
        dag = dag.name(),
        ops = rec.graph.len(),
        inputs = ?rec.constructed.input_names,
        outputs = ?rec.constructed.output_names,
        "spliced capability"
    );
    Ok(SplicedDag {
        graph: rec.graph,
        stage,
        main_op,
        output_op,
        last_op,
        constructed: rec.constructed,
        dag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::gemm_bias;
    use crate::stage::OperationRole;
    use crate::wmma::WmmaFp16Fp32;

    fn spliced(m: usize, n: usize, k: usize) -> SplicedDag {
        let host = gemm_bias(m, n, k).unwrap();
        let gemm = host.find_op("gemm").unwrap();
        let matched = IntrinMatch::matmul("nnn", "16x16x16", gemm);
        splice(Arc::new(WmmaFp16Fp32::new()), &host, &matched).unwrap()
    }

    #[test]
    fn test_splice_gemm_bias() {
        let s = spliced(64, 64, 64);
        let names: Vec<&str> = s.graph.ops().iter().map(|op| op.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "A", "B", "bias", "A.tile", "B.tile", "gemm.load_a", "gemm.load_b", "gemm",
                "gemm.store", "bias_add"
            ]
        );
        assert_eq!(s.constructed.input_names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(s.constructed.output_names, vec!["store".to_string()]);
        assert_eq!(s.graph.op(s.main_op).unwrap().name, "gemm");
        assert_eq!(s.graph.op(s.output_op).unwrap().name, "gemm.store");
        assert_eq!(s.graph.op(s.last_op).unwrap().name, "bias_add");
        // the bias add now reads the store
        assert_eq!(s.graph.read_graph(s.last_op).unwrap()[0], s.output_op);
    }

    #[test]
    fn test_stage_roles() {
        let s = spliced(64, 64, 64);
        let load_a = s.graph.find_op("gemm.load_a").unwrap();
        assert_eq!(s.stage.role(load_a), Some(OperationRole::Load));
        assert_eq!(s.stage.role(s.main_op), Some(OperationRole::Main));
        assert_eq!(s.stage.role(s.output_op), Some(OperationRole::Output));
        assert_eq!(s.stage.role(s.last_op), None);
        assert_eq!(s.stage.main_op_reserve_reduce_axis, vec![1]);
        assert_eq!(s.stage.main_op_reserve_reduce_axis_factor, vec![16]);
        assert_eq!(s.stage.reserve_count(s.output_op).unwrap(), 2);
        assert_eq!(s.stage.node_name(load_a).unwrap(), "load_a");
        assert_eq!(s.stage.load_from_shared.get(&load_a), Some(&true));
        assert_eq!(s.main_input_dtype().unwrap(), DType::F16);
    }

    #[test]
    fn test_construct_dag_rejects_multi_stage_entry() {
        let host = gemm_bias(64, 64, 64).unwrap();
        let gemm = host.find_op("gemm").unwrap();
        let a = host.output_of(host.find_op("A").unwrap()).unwrap();
        let entry = [host.output_of(gemm).unwrap()];
        let inputs = DagInputs {
            input_tensors: &[a],
            entry_tensors: &entry,
            addition_inputs: &[],
            output_tensors: None,
        };
        let mut builder = ComputeGraph::new();
        let err = construct_dag(
            &WmmaFp16Fp32::new(),
            "nnn",
            "16x16x16",
            &host,
            &inputs,
            &mut builder,
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, TensorizeError::Match { .. }));
    }

    #[test]
    fn test_construct_dag_leaves_inputs_untouched() {
        let dag = WmmaFp16Fp32::new();
        let before = dag.graph().clone();
        let host = gemm_bias(32, 32, 32).unwrap();
        let host_before = host.clone();

        let gemm = host.find_op("gemm").unwrap();
        let mut builder = ComputeGraph::new();
        let mut imported = BTreeMap::new();
        for id in host.op_ids().take_while(|id| *id != gemm) {
            let t = copy_op(&host, id, &mut builder, &imported).unwrap();
            imported.insert(host.output_of(id).unwrap(), t);
        }
        let input_tensors = host.input_tensors(gemm).unwrap();
        let entry = [host.output_of(gemm).unwrap()];
        let inputs = DagInputs {
            input_tensors: &input_tensors,
            entry_tensors: &entry,
            addition_inputs: &[],
            output_tensors: None,
        };
        let built = construct_dag(&dag, "nnn", "16x16x16", &host, &inputs, &mut builder, &imported)
            .unwrap();

        assert_eq!(dag.graph(), &before);
        assert_eq!(host, host_before);
        assert_eq!(built.nodes.len(), 6);
        assert_eq!(built.rewired.len(), 1);
        // the copies read [32, 32] operands
        let load_a = built.nodes["load_a"][0];
        assert_eq!(builder.tensor(load_a).unwrap().shape, vec![32, 32]);
    }
}
