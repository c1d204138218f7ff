//! Schedule IR
//!
//! A schedule keeps one stage per compute operator plus the stages that
//! primitives introduce (shared-memory copies, rfactor and cache-write
//! stages). Axes live in a single arena; every primitive allocates ids
//! sequentially and all maps are ordered, so replaying the same primitive
//! sequence yields a structurally identical schedule.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capability::Intrinsic;
use crate::error::{TensorizeError, TensorizeResult};
use crate::expr::IterKind;
use crate::graph::{ComputeGraph, OpId};
use crate::hardware::{MemoryScope, ThreadTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AxisId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    pub extent: usize,
    pub kind: IterKind,
    pub stage: StageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitMode {
    Factor(usize),
    NParts(usize),
}

/// How a leaf axis was derived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    Split {
        parent: AxisId,
        outer: AxisId,
        inner: AxisId,
        mode: SplitMode,
    },
    Fuse {
        fused: Vec<AxisId>,
        result: AxisId,
    },
}

/// Where a stage is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attach {
    Root,
    Inline,
    At { parent: StageId, axis: AxisId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOrigin {
    Operation(OpId),
    CacheRead { source: StageId, readers: Vec<StageId> },
    RFactor { source: StageId },
    CacheWrite { source: StageId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pragma {
    AutoUnrollMaxStep(usize),
}

impl fmt::Display for Pragma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pragma::AutoUnrollMaxStep(step) => write!(f, "auto_unroll_max_step={}", step),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub origin: StageOrigin,
    pub root_axis: Vec<AxisId>,
    pub root_reduce_axis: Vec<AxisId>,
    pub leaf: Vec<AxisId>,
    pub relations: Vec<Relation>,
    pub scope: Option<MemoryScope>,
    pub attach: Attach,
    pub bindings: BTreeMap<AxisId, ThreadTag>,
    pub pragmas: Vec<(AxisId, Pragma)>,
    pub vectorized: Vec<AxisId>,
    pub tensorized: Option<(AxisId, Intrinsic)>,
}

impl Stage {
    fn new(name: String, origin: StageOrigin, root_axis: Vec<AxisId>, root_reduce_axis: Vec<AxisId>) -> Self {
        let leaf = root_axis.iter().chain(root_reduce_axis.iter()).copied().collect();
        Self {
            name,
            origin,
            root_axis,
            root_reduce_axis,
            leaf,
            relations: Vec::new(),
            scope: None,
            attach: Attach::Root,
            bindings: BTreeMap::new(),
            pragmas: Vec::new(),
            vectorized: Vec::new(),
            tensorized: None,
        }
    }

    pub fn is_inlined(&self) -> bool {
        self.attach == Attach::Inline
    }
}

/// One thread binding, as reported by [`Schedule::bindings`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisBinding {
    pub stage: String,
    pub axis: String,
    pub tag: ThreadTag,
    pub extent: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    axes: Vec<Axis>,
    stages: Vec<Stage>,
    /// Stage evaluation order
    order: Vec<StageId>,
    op_stage: BTreeMap<OpId, StageId>,
}

impl Schedule {
    /// One root stage per compute operator of `graph`
    pub fn new(graph: &ComputeGraph) -> TensorizeResult<Self> {
        let mut sch = Self {
            axes: Vec::new(),
            stages: Vec::new(),
            order: Vec::new(),
            op_stage: BTreeMap::new(),
        };
        for id in graph.op_ids() {
            let op = graph.op(id)?;
            let Some(compute) = op.as_compute() else {
                continue;
            };
            let stage = StageId(sch.stages.len());
            let root = compute
                .axis
                .iter()
                .map(|iv| sch.new_axis(iv.name.clone(), iv.extent, iv.kind, stage))
                .collect();
            let reduce = compute
                .reduce_axis
                .iter()
                .map(|iv| sch.new_axis(iv.name.clone(), iv.extent, iv.kind, stage))
                .collect();
            sch.stages
                .push(Stage::new(op.name.clone(), StageOrigin::Operation(id), root, reduce));
            sch.order.push(stage);
            sch.op_stage.insert(id, stage);
        }
        Ok(sch)
    }

    fn new_axis(&mut self, name: String, extent: usize, kind: IterKind, stage: StageId) -> AxisId {
        let id = AxisId(self.axes.len());
        self.axes.push(Axis {
            name,
            extent,
            kind,
            stage,
        });
        id
    }

    fn copy_axis(&mut self, axis: AxisId, kind: IterKind, stage: StageId) -> TensorizeResult<AxisId> {
        let (name, extent) = {
            let a = self.axis(axis)?;
            (a.name.clone(), a.extent)
        };
        Ok(self.new_axis(name, extent, kind, stage))
    }

    pub fn stage_of(&self, op: OpId) -> TensorizeResult<StageId> {
        self.op_stage
            .get(&op)
            .copied()
            .ok_or_else(|| TensorizeError::structural(format!("{:?}", op), "operator has no stage"))
    }

    pub fn stage(&self, id: StageId) -> TensorizeResult<&Stage> {
        self.stages
            .get(id.0)
            .ok_or_else(|| TensorizeError::structural(format!("{:?}", id), "unknown stage"))
    }

    fn stage_mut(&mut self, id: StageId) -> TensorizeResult<&mut Stage> {
        self.stages
            .get_mut(id.0)
            .ok_or_else(|| TensorizeError::structural(format!("{:?}", id), "unknown stage"))
    }

    pub fn axis(&self, id: AxisId) -> TensorizeResult<&Axis> {
        self.axes
            .get(id.0)
            .ok_or_else(|| TensorizeError::structural(format!("{:?}", id), "unknown axis"))
    }

    pub fn extent(&self, id: AxisId) -> TensorizeResult<usize> {
        Ok(self.axis(id)?.extent)
    }

    /// Stages in evaluation order
    pub fn stages(&self) -> impl Iterator<Item = &Stage> + '_ {
        self.order.iter().filter_map(|id| self.stages.get(id.0))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Root spatial axes of a stage
    pub fn root_axis(&self, stage: StageId) -> TensorizeResult<Vec<AxisId>> {
        Ok(self.stage(stage)?.root_axis.clone())
    }

    pub fn root_reduce_axis(&self, stage: StageId) -> TensorizeResult<Vec<AxisId>> {
        Ok(self.stage(stage)?.root_reduce_axis.clone())
    }

    pub fn leaf(&self, stage: StageId) -> TensorizeResult<&[AxisId]> {
        Ok(&self.stage(stage)?.leaf)
    }

    fn leaf_position(&self, stage: StageId, axis: AxisId) -> TensorizeResult<usize> {
        let s = self.stage(stage)?;
        s.leaf.iter().position(|a| *a == axis).ok_or_else(|| {
            let name = self.axes.get(axis.0).map_or("?", |a| a.name.as_str());
            TensorizeError::structural(&s.name, format!("axis '{}' is not a leaf", name))
        })
    }

    fn replace_leaf(&mut self, stage: StageId, pos: usize, len: usize, with: &[AxisId]) -> TensorizeResult<()> {
        let s = self.stage_mut(stage)?;
        s.leaf.splice(pos..pos + len, with.iter().copied());
        Ok(())
    }

    /// Split by inner factor: outer `ceil(e / f)`, inner `f`
    pub fn split(&mut self, stage: StageId, axis: AxisId, factor: usize) -> TensorizeResult<(AxisId, AxisId)> {
        self.split_with(stage, axis, SplitMode::Factor(factor))
    }

    /// Split into `nparts` outer iterations: outer `n`, inner `ceil(e / n)`
    pub fn split_nparts(&mut self, stage: StageId, axis: AxisId, nparts: usize) -> TensorizeResult<(AxisId, AxisId)> {
        self.split_with(stage, axis, SplitMode::NParts(nparts))
    }

    fn split_with(&mut self, stage: StageId, axis: AxisId, mode: SplitMode) -> TensorizeResult<(AxisId, AxisId)> {
        let pos = self.leaf_position(stage, axis)?;
        let (name, extent, kind) = {
            let a = self.axis(axis)?;
            (a.name.clone(), a.extent, a.kind)
        };
        let (outer_extent, inner_extent) = match mode {
            SplitMode::Factor(f) if f > 0 => (extent.div_ceil(f), f),
            SplitMode::NParts(n) if n > 0 => (n, extent.div_ceil(n)),
            _ => {
                return Err(TensorizeError::structural(
                    &self.stage(stage)?.name,
                    format!("cannot split '{}' by zero", name),
                ))
            }
        };
        let outer = self.new_axis(format!("{}.outer", name), outer_extent, kind, stage);
        let inner = self.new_axis(format!("{}.inner", name), inner_extent, kind, stage);
        self.replace_leaf(stage, pos, 1, &[outer, inner])?;
        self.stage_mut(stage)?.relations.push(Relation::Split {
            parent: axis,
            outer,
            inner,
            mode,
        });
        Ok((outer, inner))
    }

    /// Fuse consecutive leaf axes of one kind, outermost first. A single
    /// axis is returned unchanged.
    pub fn fuse(&mut self, stage: StageId, axes: &[AxisId]) -> TensorizeResult<AxisId> {
        let stage_name = self.stage(stage)?.name.clone();
        let (first, rest) = axes
            .split_first()
            .ok_or_else(|| TensorizeError::structural(&stage_name, "nothing to fuse"))?;
        if rest.is_empty() {
            self.leaf_position(stage, *first)?;
            return Ok(*first);
        }
        let pos = self.leaf_position(stage, *first)?;
        let kind = self.axis(*first)?.kind;
        let mut names = vec![self.axis(*first)?.name.clone()];
        let mut extent = self.axis(*first)?.extent;
        for (i, a) in rest.iter().enumerate() {
            if self.leaf_position(stage, *a)? != pos + i + 1 {
                return Err(TensorizeError::structural(&stage_name, "fused axes must be consecutive leaves"));
            }
            let axis = self.axis(*a)?;
            if axis.kind != kind {
                return Err(TensorizeError::structural(&stage_name, "cannot fuse spatial with reduce axes"));
            }
            names.push(axis.name.clone());
            extent *= axis.extent;
        }
        let result = self.new_axis(format!("{}.fused", names.join(".")), extent, kind, stage);
        self.replace_leaf(stage, pos, axes.len(), &[result])?;
        self.stage_mut(stage)?.relations.push(Relation::Fuse {
            fused: axes.to_vec(),
            result,
        });
        Ok(result)
    }

    /// Place `axes` into the leaf positions they currently occupy, in the
    /// given order. Leaves not named keep their place.
    pub fn reorder(&mut self, stage: StageId, axes: &[AxisId]) -> TensorizeResult<()> {
        let mut positions = axes
            .iter()
            .map(|a| self.leaf_position(stage, *a))
            .collect::<TensorizeResult<Vec<_>>>()?;
        positions.sort_unstable();
        if positions.windows(2).any(|w| w[0] == w[1]) {
            return Err(TensorizeError::structural(
                &self.stage(stage)?.name,
                "reorder names an axis twice",
            ));
        }
        let s = self.stage_mut(stage)?;
        for (pos, axis) in positions.into_iter().zip(axes) {
            s.leaf[pos] = *axis;
        }
        Ok(())
    }

    pub fn bind(&mut self, stage: StageId, axis: AxisId, tag: ThreadTag) -> TensorizeResult<()> {
        self.leaf_position(stage, axis)?;
        self.stage_mut(stage)?.bindings.insert(axis, tag);
        Ok(())
    }

    pub fn compute_at(&mut self, stage: StageId, parent: StageId, axis: AxisId) -> TensorizeResult<()> {
        self.leaf_position(parent, axis)?;
        if stage == parent {
            return Err(TensorizeError::structural(
                &self.stage(stage)?.name,
                "cannot compute a stage at itself",
            ));
        }
        self.stage_mut(stage)?.attach = Attach::At { parent, axis };
        Ok(())
    }

    pub fn compute_inline(&mut self, stage: StageId) -> TensorizeResult<()> {
        let s = self.stage_mut(stage)?;
        if !s.root_reduce_axis.is_empty() {
            return Err(TensorizeError::structural(&s.name, "cannot inline a reduction"));
        }
        s.attach = Attach::Inline;
        Ok(())
    }

    pub fn set_scope(&mut self, stage: StageId, scope: MemoryScope) -> TensorizeResult<()> {
        self.stage_mut(stage)?.scope = Some(scope);
        Ok(())
    }

    pub fn pragma(&mut self, stage: StageId, axis: AxisId, pragma: Pragma) -> TensorizeResult<()> {
        self.leaf_position(stage, axis)?;
        self.stage_mut(stage)?.pragmas.push((axis, pragma));
        Ok(())
    }

    pub fn vectorize(&mut self, stage: StageId, axis: AxisId) -> TensorizeResult<()> {
        self.leaf_position(stage, axis)?;
        self.stage_mut(stage)?.vectorized.push(axis);
        Ok(())
    }

    pub fn tensorize(&mut self, stage: StageId, axis: AxisId, intrinsic: Intrinsic) -> TensorizeResult<()> {
        self.leaf_position(stage, axis)?;
        self.stage_mut(stage)?.tensorized = Some((axis, intrinsic));
        Ok(())
    }

    fn insert_order(&mut self, new: StageId, anchor: StageId, after: bool) -> TensorizeResult<()> {
        let pos = self
            .order
            .iter()
            .position(|s| *s == anchor)
            .ok_or_else(|| TensorizeError::structural(format!("{:?}", anchor), "stage not scheduled"))?;
        self.order.insert(if after { pos + 1 } else { pos }, new);
        Ok(())
    }

    /// Stage a copy of `source` in `scope` for `readers`. The copy is
    /// evaluated right after its source.
    pub fn cache_read(&mut self, source: StageId, scope: MemoryScope, readers: &[StageId]) -> TensorizeResult<StageId> {
        let (name, root) = {
            let s = self.stage(source)?;
            (format!("{}.{}", s.name, scope), s.root_axis.clone())
        };
        let id = StageId(self.stages.len());
        let axes = root
            .iter()
            .map(|a| self.copy_axis(*a, IterKind::Spatial, id))
            .collect::<TensorizeResult<Vec<_>>>()?;
        let mut stage = Stage::new(
            name,
            StageOrigin::CacheRead {
                source,
                readers: readers.to_vec(),
            },
            axes,
            Vec::new(),
        );
        stage.scope = Some(scope);
        self.stages.push(stage);
        self.insert_order(id, source, true)?;
        Ok(id)
    }

    /// Factor the reduction over leaf axis `factor` out into a new stage
    /// that keeps it as its outermost spatial axis. The source is reset to
    /// reduce over that dimension only.
    pub fn rfactor(&mut self, stage: StageId, factor: AxisId) -> TensorizeResult<StageId> {
        let (name, root, leaf) = {
            let s = self.stage(stage)?;
            (s.name.clone(), s.root_axis.clone(), s.leaf.clone())
        };
        self.leaf_position(stage, factor)?;
        if self.axis(factor)?.kind != IterKind::Reduce {
            return Err(TensorizeError::structural(&name, "rfactor needs a reduce axis"));
        }
        let factor_extent = self.extent(factor)?;
        let factor_name = self.axis(factor)?.name.clone();

        let rf = StageId(self.stages.len());
        let mut rf_root = vec![self.new_axis(factor_name.clone(), factor_extent, IterKind::Spatial, rf)];
        for a in &root {
            rf_root.push(self.copy_axis(*a, IterKind::Spatial, rf)?);
        }
        let mut rf_reduce = Vec::new();
        for a in &leaf {
            if *a != factor && self.axis(*a)?.kind == IterKind::Reduce {
                rf_reduce.push(self.copy_axis(*a, IterKind::Reduce, rf)?);
            }
        }
        self.stages.push(Stage::new(
            format!("{}.rf", name),
            StageOrigin::RFactor { source: stage },
            rf_root,
            rf_reduce,
        ));
        self.insert_order(rf, stage, false)?;

        let new_root = root
            .iter()
            .map(|a| self.copy_axis(*a, IterKind::Spatial, stage))
            .collect::<TensorizeResult<Vec<_>>>()?;
        let new_reduce = vec![self.new_axis(format!("{}.v", factor_name), factor_extent, IterKind::Reduce, stage)];
        let origin = self.stage(stage)?.origin.clone();
        let scope = self.stage(stage)?.scope;
        let mut reset = Stage::new(name, origin, new_root, new_reduce);
        reset.scope = scope;
        *self.stage_mut(stage)? = reset;
        Ok(rf)
    }

    /// Move the computation of `stage` into a new `scope` stage evaluated
    /// before it; `stage` becomes a plain copy of the cache.
    pub fn cache_write(&mut self, stage: StageId, scope: MemoryScope) -> TensorizeResult<StageId> {
        let (name, root, reduce) = {
            let s = self.stage(stage)?;
            (s.name.clone(), s.root_axis.clone(), s.root_reduce_axis.clone())
        };
        let id = StageId(self.stages.len());
        let new_root = root
            .iter()
            .map(|a| self.copy_axis(*a, IterKind::Spatial, id))
            .collect::<TensorizeResult<Vec<_>>>()?;
        let new_reduce = reduce
            .iter()
            .map(|a| self.copy_axis(*a, IterKind::Reduce, id))
            .collect::<TensorizeResult<Vec<_>>>()?;
        let mut cache = Stage::new(
            format!("{}.{}", name, scope),
            StageOrigin::CacheWrite { source: stage },
            new_root,
            new_reduce,
        );
        cache.scope = Some(scope);
        self.stages.push(cache);
        self.insert_order(id, stage, false)?;

        let kinds = self
            .stage(stage)?
            .leaf
            .iter()
            .map(|a| Ok((*a, self.axis(*a)?.kind)))
            .collect::<TensorizeResult<Vec<_>>>()?;
        let s = self.stage_mut(stage)?;
        s.root_reduce_axis.clear();
        s.leaf = kinds
            .into_iter()
            .filter(|(_, k)| *k == IterKind::Spatial)
            .map(|(a, _)| a)
            .collect();
        Ok(id)
    }

    /// Every thread binding, stage by stage
    pub fn bindings(&self) -> Vec<AxisBinding> {
        self.stages()
            .flat_map(|s| {
                s.bindings.iter().filter_map(move |(axis, tag)| {
                    self.axes.get(axis.0).map(|a| AxisBinding {
                        stage: s.name.clone(),
                        axis: a.name.clone(),
                        tag: *tag,
                        extent: a.extent,
                    })
                })
            })
            .collect()
    }

    pub fn find_stage(&self, name: &str) -> Option<StageId> {
        self.stages.iter().position(|s| s.name == name).map(StageId)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stage in self.stages() {
            write!(f, "stage {}", stage.name)?;
            if let Some(scope) = stage.scope {
                write!(f, " [{}]", scope)?;
            }
            match stage.attach {
                Attach::Root => {}
                Attach::Inline => write!(f, " inline")?,
                Attach::At { parent, axis } => {
                    let p = self.stages.get(parent.0).map_or("?", |s| s.name.as_str());
                    let a = self.axes.get(axis.0).map_or("?", |a| a.name.as_str());
                    write!(f, " @ {}.{}", p, a)?;
                }
            }
            writeln!(f)?;
            if stage.is_inlined() {
                continue;
            }
            for id in &stage.leaf {
                let Some(axis) = self.axes.get(id.0) else {
                    continue;
                };
                let marker = if axis.kind == IterKind::Reduce { "r" } else { " " };
                write!(f, "  {} {}: {}", marker, axis.name, axis.extent)?;
                if let Some(tag) = stage.bindings.get(id) {
                    write!(f, " -> {}", tag)?;
                }
                if stage.vectorized.contains(id) {
                    write!(f, " vectorized")?;
                }
                for (_, pragma) in stage.pragmas.iter().filter(|(a, _)| a == id) {
                    write!(f, " {}", pragma)?;
                }
                if let Some((_, intrin)) = stage.tensorized.as_ref().filter(|(a, _)| a == id) {
                    write!(f, " tensorize {}", intrin.name)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
