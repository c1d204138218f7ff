//! Capability graph model
//!
//! A hardware unit is described as a small dataflow graph of named nodes.
//! Exactly one node performs the unit's arithmetic (`Compute`); the others
//! move data (`Memory`) or apply elementwise epilogues (`Elementwise`).
//! Edge sources that are not nodes are external input slots, bound to host
//! tensors when the graph is spliced.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{TensorizeError, TensorizeResult};
use crate::expr::{DType, TensorId};
use crate::graph::{ComputeGraph, ComputeOp, IterVar};
use crate::hardware::{DeviceConfig, InstructionScope, MemoryScope};

/// Capability class of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityClass {
    Compute,
    Memory,
    Elementwise,
}

/// Nodes, read edges, main node and anchor of one hardware unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityGraph {
    pub name: String,
    pub nodes: BTreeMap<String, CapabilityClass>,
    /// node -> ordered list of names it reads from
    pub edges: BTreeMap<String, Vec<String>>,
    pub main_node: String,
    pub anchor: String,
}

/// Result of `CapabilityGraph::serialize`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SerializedDag {
    /// Kept nodes, producers before consumers
    pub nodes: Vec<String>,
    pub read_graph: BTreeMap<String, Vec<String>>,
    pub feed_graph: BTreeMap<String, Vec<String>>,
}

impl CapabilityGraph {
    pub fn new(
        name: impl Into<String>,
        main_node: impl Into<String>,
        anchor: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            main_node: main_node.into(),
            anchor: anchor.into(),
        }
    }

    pub fn node(mut self, name: impl Into<String>, class: CapabilityClass) -> Self {
        self.nodes.insert(name.into(), class);
        self
    }

    pub fn edge(mut self, name: impl Into<String>, reads: &[&str]) -> Self {
        self.edges
            .insert(name.into(), reads.iter().map(|s| s.to_string()).collect());
        self
    }

    /// True iff the main node is the only `Compute` node
    pub fn valid(&self) -> bool {
        self.nodes.iter().all(|(name, class)| {
            if *name == self.main_node {
                *class == CapabilityClass::Compute
            } else {
                matches!(class, CapabilityClass::Memory | CapabilityClass::Elementwise)
            }
        }) && self.nodes.contains_key(&self.main_node)
    }

    /// Fail-fast form of `valid` that also checks anchor and sink
    pub fn validate(&self) -> TensorizeResult<()> {
        if !self.nodes.contains_key(&self.main_node) {
            return Err(TensorizeError::definition(
                &self.name,
                format!("main node '{}' is not a node", self.main_node),
            ));
        }
        if !self.valid() {
            let computes: Vec<&str> = self
                .nodes
                .iter()
                .filter(|(_, c)| **c == CapabilityClass::Compute)
                .map(|(n, _)| n.as_str())
                .collect();
            return Err(TensorizeError::definition(
                &self.name,
                format!(
                    "expected '{}' to be the only compute node, found {:?}",
                    self.main_node, computes
                ),
            ));
        }
        if !self.nodes.contains_key(&self.anchor) {
            return Err(TensorizeError::definition(
                &self.name,
                format!("anchor '{}' is not a node", self.anchor),
            ));
        }
        for name in self.edges.keys() {
            if !self.nodes.contains_key(name) {
                return Err(TensorizeError::definition(
                    &self.name,
                    format!("edge list for unknown node '{}'", name),
                ));
            }
        }
        self.sink()?;
        Ok(())
    }

    /// Reverse adjacency: name -> nodes reading it
    pub fn feed_graph(&self) -> BTreeMap<String, Vec<String>> {
        let mut feed: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, inputs) in &self.edges {
            for inp in inputs {
                feed.entry(inp.clone()).or_default().push(name.clone());
            }
        }
        feed
    }

    /// Nodes that read external slots only (or nothing)
    pub fn sources(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|n| {
                self.edges
                    .get(*n)
                    .map_or(true, |ins| ins.iter().all(|i| !self.nodes.contains_key(i)))
            })
            .cloned()
            .collect()
    }

    /// External input slots in first-use order
    pub fn external_inputs(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for inputs in self.edges.values() {
            for inp in inputs {
                if !self.nodes.contains_key(inp) && !out.contains(inp) {
                    out.push(inp.clone());
                }
            }
        }
        out
    }

    fn sink(&self) -> TensorizeResult<&str> {
        let feed = self.feed_graph();
        let sinks: Vec<&String> = self.nodes.keys().filter(|n| !feed.contains_key(*n)).collect();
        match sinks.as_slice() {
            [one] => Ok(one.as_str()),
            [] => Err(TensorizeError::definition(&self.name, "graph has no sink")),
            many => Err(TensorizeError::definition(
                &self.name,
                format!("graph has {} sinks: {:?}", many.len(), many),
            )),
        }
    }

    /// Breadth-first walk from the sole sink towards the sources.
    ///
    /// Only nodes satisfying `expand` are entered; those also satisfying
    /// `keep` are returned, producers before consumers, together with the
    /// read/feed edges induced among kept nodes.
    pub fn serialize<K, E>(&self, keep: K, expand: E) -> TensorizeResult<SerializedDag>
    where
        K: Fn(&str) -> bool,
        E: Fn(&str) -> bool,
    {
        let sink = self.sink()?.to_string();
        let mut order: Vec<String> = Vec::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue = VecDeque::new();
        visited.insert(sink.clone());
        queue.push_back(sink);

        while let Some(cur) = queue.pop_front() {
            order.push(cur.clone());
            for p in self.edges.get(&cur).into_iter().flatten() {
                if self.nodes.contains_key(p) && !visited.contains(p) && expand(p) {
                    visited.insert(p.clone());
                    queue.push_back(p.clone());
                }
            }
        }

        // longest distance to the sink over visited nodes; producers sit further away
        let mut depth: BTreeMap<&str, usize> = order.iter().map(|n| (n.as_str(), 0)).collect();
        let mut changed = true;
        while changed {
            changed = false;
            for name in &order {
                let d = depth[name.as_str()];
                for p in self.edges.get(name).into_iter().flatten() {
                    if let Some(pd) = depth.get_mut(p.as_str()) {
                        if *pd < d + 1 {
                            *pd = d + 1;
                            changed = true;
                        }
                    }
                }
            }
        }
        let mut ranked: Vec<(usize, usize, &String)> = order
            .iter()
            .enumerate()
            .map(|(i, n)| (depth[n.as_str()], i, n))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        let kept: Vec<String> = ranked
            .into_iter()
            .map(|(_, _, n)| n.clone())
            .filter(|n| keep(n))
            .collect();
        let kept_set: BTreeSet<&str> = kept.iter().map(String::as_str).collect();

        let mut read_graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut feed_graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for cur in &kept {
            for p in self.edges.get(cur).into_iter().flatten() {
                if kept_set.contains(p.as_str()) {
                    read_graph.entry(cur.clone()).or_default().push(p.clone());
                    feed_graph.entry(p.clone()).or_default().push(cur.clone());
                }
            }
        }

        Ok(SerializedDag {
            nodes: kept,
            read_graph,
            feed_graph,
        })
    }
}

/// `M x N x K` of a matrix unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemSize {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl ProblemSize {
    /// Parse a shape key of the form `MxNxK`
    pub fn parse(key: &str) -> Option<Self> {
        let dims: Vec<usize> = key
            .split('x')
            .map(|d| d.parse::<usize>().ok())
            .collect::<Option<Vec<_>>>()?;
        match dims.as_slice() {
            [m, n, k] if *m > 0 && *n > 0 && *k > 0 => Some(Self {
                m: *m,
                n: *n,
                k: *k,
            }),
            _ => None,
        }
    }
}

/// Declared input of a node expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// A node's compute definition. Loads in `body` refer to input slots:
/// `TensorId(i)` is `inputs[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExpression {
    pub name: String,
    pub inputs: Vec<InputSpec>,
    pub axis: Vec<IterVar>,
    pub reduce_axis: Vec<IterVar>,
    pub dtype: DType,
    pub body: crate::expr::Expr,
}

impl NodeExpression {
    pub fn output_shape(&self) -> Vec<usize> {
        self.axis.iter().map(|iv| iv.extent).collect()
    }

    /// Materialize this expression in `graph`, reading `inputs` positionally
    pub fn instantiate(
        &self,
        graph: &mut ComputeGraph,
        name: impl Into<String>,
        inputs: &[TensorId],
    ) -> TensorizeResult<TensorId> {
        let name = name.into();
        if inputs.len() != self.inputs.len() {
            return Err(TensorizeError::matching(format!(
                "'{}' expects {} inputs, got {}",
                name,
                self.inputs.len(),
                inputs.len()
            )));
        }
        let body = self.body.map_tensors(&mut |slot| {
            inputs.get(slot.0).copied().ok_or_else(|| {
                TensorizeError::graph(format!("'{}' reads missing input slot {}", name, slot.0))
            })
        })?;
        graph.compute_op(
            name.as_str(),
            ComputeOp {
                axis: self.axis.clone(),
                reduce_axis: self.reduce_axis.clone(),
                body,
            },
            self.dtype,
        )
    }
}

/// Handle to a hardware instruction, passed to `tensorize`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intrinsic {
    pub name: String,
    pub node: String,
    pub compute_key: String,
    pub shape_key: String,
    pub output_scope: Option<MemoryScope>,
}

/// Behaviour every hardware-unit definition supplies
pub trait HwAbsDag: Send + Sync {
    fn name(&self) -> &str;

    fn target(&self) -> &str;

    fn scope(&self) -> InstructionScope;

    fn graph(&self) -> &CapabilityGraph;

    fn compute_keys(&self) -> Vec<String>;

    fn shape_keys(&self) -> Vec<String>;

    fn main_expression(&self, compute_key: &str, shape_key: &str)
        -> TensorizeResult<NodeExpression>;

    /// Expression of `node` at the unit's native problem size
    fn node_expression(
        &self,
        compute_key: &str,
        shape_key: &str,
        node: &str,
    ) -> TensorizeResult<NodeExpression>;

    /// Expression of `node` over inputs of the given shapes
    fn node_expression_with_shape(
        &self,
        compute_key: &str,
        shape_key: &str,
        node: &str,
        input_shapes: &[Vec<usize>],
    ) -> TensorizeResult<NodeExpression>;

    fn problem_size(&self, shape_key: &str) -> TensorizeResult<ProblemSize>;

    fn intrinsic(
        &self,
        compute_key: &str,
        shape_key: &str,
        node: &str,
        output_scope: Option<MemoryScope>,
    ) -> TensorizeResult<Intrinsic>;

    fn memory_realization(
        &self,
        dtype: DType,
        scope: &str,
        constant_size: usize,
        attributes: &BTreeMap<String, String>,
    ) -> TensorizeResult<String>;

    fn header(&self) -> &str {
        ""
    }

    fn special_dtype(&self, _dtype: DType) -> Option<String> {
        None
    }

    fn check_target_eligibility(&self, _device: &DeviceConfig) -> bool {
        true
    }

    /// Spatial axis count and reduce extents a node keeps for the instruction
    fn reserve_axes(
        &self,
        compute_key: &str,
        shape_key: &str,
        node: &str,
    ) -> TensorizeResult<(usize, Vec<usize>)> {
        let expr = self.node_expression(compute_key, shape_key, node)?;
        Ok((
            expr.axis.len(),
            expr.reduce_axis.iter().map(|iv| iv.extent).collect(),
        ))
    }

    /// The compute-only part of the unit as a standalone graph
    fn effective_compute_dag(
        &self,
        compute_key: &str,
        shape_key: &str,
    ) -> TensorizeResult<ComputeGraph> {
        let graph = self.graph();
        let serialized = graph.serialize(
            |n| graph.nodes.get(n) == Some(&CapabilityClass::Compute),
            |_| true,
        )?;
        let mut out = ComputeGraph::new();
        let mut built: BTreeMap<String, TensorId> = BTreeMap::new();
        for name in &serialized.nodes {
            let expr = self.node_expression(compute_key, shape_key, name)?;
            let reads = serialized.read_graph.get(name).cloned().unwrap_or_default();
            let mut inputs = Vec::with_capacity(expr.inputs.len());
            for (slot, spec) in expr.inputs.iter().enumerate() {
                let id = match reads.get(slot).and_then(|r| built.get(r)) {
                    Some(id) => *id,
                    None => out.placeholder(
                        format!("{}.{}", name, spec.name),
                        &spec.shape,
                        spec.dtype,
                    )?,
                };
                inputs.push(id);
            }
            let t = expr.instantiate(&mut out, name.as_str(), &inputs)?;
            built.insert(name.clone(), t);
        }
        Ok(out)
    }
}
