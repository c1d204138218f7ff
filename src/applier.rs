//! Schedule applier
//!
//! Replays a [`ScheduleParams`] record onto a fresh [`Schedule`] of a
//! spliced graph. Compute operators are visited in reverse topological
//! order, and each runs the fixed primitive pipeline
//! `Inline -> CacheRead -> SetScope -> Tiling -> ComputeAt -> Unroll -> Tensorize`.
//! Decisions made for consumers (tiled output axes, main reduce groups,
//! tensorize axes) are carried to producers through a [`ScheduleState`]
//! owned by the single `apply` call.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{TensorizeError, TensorizeResult};
use crate::graph::OpId;
use crate::hardware::{DeviceConfig, InstructionScope, MemoryScope, ThreadTag};
use crate::record::ScheduleParams;
use crate::schedule::{AxisId, Pragma, Schedule, StageId};
use crate::splice::SplicedDag;
use crate::stage::OperationRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Primitive {
    Inline,
    CacheRead,
    SetScope,
    Tiling,
    ComputeAt,
    Unroll,
    Tensorize,
}

/// Order every operator runs the primitives in
pub const PIPELINE: [Primitive; 7] = [
    Primitive::Inline,
    Primitive::CacheRead,
    Primitive::SetScope,
    Primitive::Tiling,
    Primitive::ComputeAt,
    Primitive::Unroll,
    Primitive::Tensorize,
];

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Primitive::Inline => "inline",
            Primitive::CacheRead => "cache_read",
            Primitive::SetScope => "set_scope",
            Primitive::Tiling => "tiling",
            Primitive::ComputeAt => "compute_at",
            Primitive::Unroll => "unroll",
            Primitive::Tensorize => "tensorize",
        };
        write!(f, "{}", s)
    }
}

/// Decisions shared between the operators of one `apply` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleState {
    pub inlined: BTreeSet<OpId>,
    /// Reduce axis groups of the main stage, outermost group first
    pub main_op_reduce_axis: Vec<Vec<AxisId>>,
    /// Output axis groups, outermost first
    pub output_op_axis: Vec<Vec<AxisId>>,
    pub last_op_axis: Vec<Vec<AxisId>>,
    pub tensorize_iter: BTreeMap<OpId, AxisId>,
    /// Stage playing the main role; the local cache stage after a K-split
    pub main_stage: StageId,
}

impl ScheduleState {
    pub fn new(main_stage: StageId) -> Self {
        Self {
            inlined: BTreeSet::new(),
            main_op_reduce_axis: Vec::new(),
            output_op_axis: Vec::new(),
            last_op_axis: Vec::new(),
            tensorize_iter: BTreeMap::new(),
            main_stage,
        }
    }

    fn group(groups: &[Vec<AxisId>], index: Option<usize>, last: bool, what: &str) -> TensorizeResult<AxisId> {
        let group = index
            .and_then(|i| groups.get(i))
            .ok_or_else(|| TensorizeError::structural(what, format!("only {} axis groups", groups.len())))?;
        let axis = if last { group.last() } else { group.first() };
        axis.copied()
            .ok_or_else(|| TensorizeError::structural(what, "empty axis group"))
    }

    pub fn main_outermost_last_reduce(&self) -> TensorizeResult<AxisId> {
        Self::group(&self.main_op_reduce_axis, Some(0), true, "main reduce axis")
    }

    pub fn main_outermost_first_reduce(&self) -> TensorizeResult<AxisId> {
        Self::group(&self.main_op_reduce_axis, Some(0), false, "main reduce axis")
    }

    /// Falls back to the outermost group when there is only one
    pub fn main_second_outermost_last_reduce(&self) -> TensorizeResult<AxisId> {
        if self.main_op_reduce_axis.len() > 1 {
            Self::group(&self.main_op_reduce_axis, Some(1), true, "main reduce axis")
        } else {
            self.main_outermost_last_reduce()
        }
    }

    pub fn output_third_innermost_last(&self) -> TensorizeResult<AxisId> {
        let n = self.output_op_axis.len();
        Self::group(&self.output_op_axis, n.checked_sub(3), true, "output axis")
    }

    pub fn output_outermost_last(&self) -> TensorizeResult<AxisId> {
        Self::group(&self.output_op_axis, Some(0), true, "output axis")
    }

    pub fn output_innermost_last(&self) -> TensorizeResult<AxisId> {
        let n = self.output_op_axis.len();
        Self::group(&self.output_op_axis, n.checked_sub(1), true, "output axis")
    }

    pub fn last_outermost_first(&self) -> TensorizeResult<AxisId> {
        Self::group(&self.last_op_axis, Some(0), false, "terminal axis")
    }

    pub fn tensorize_axis(&self, op: OpId) -> TensorizeResult<AxisId> {
        self.tensorize_iter
            .get(&op)
            .copied()
            .ok_or_else(|| TensorizeError::structural(format!("{:?}", op), "no tensorize axis recorded"))
    }
}

/// `[outermost, ..., innermost]` parts of `axis` split by `factors[1..]`
fn tile_axes(sch: &mut Schedule, stage: StageId, axis: AxisId, factors: &[usize]) -> TensorizeResult<Vec<AxisId>> {
    let mut inner_parts = Vec::new();
    let mut outer = axis;
    for &f in factors.iter().skip(1).rev() {
        let (o, i) = sch.split(stage, outer, f)?;
        inner_parts.push(i);
        outer = o;
    }
    inner_parts.push(outer);
    inner_parts.reverse();
    Ok(inner_parts)
}

/// Group the j-th part of every tiled axis together
fn zip_parts(parts: &[Vec<AxisId>]) -> Vec<Vec<AxisId>> {
    let levels = parts.iter().map(Vec::len).min().unwrap_or(0);
    (0..levels)
        .map(|j| parts.iter().map(|p| p[j]).collect())
        .collect()
}

fn split_reserved<T: Copy>(axes: &[T], reserved: usize, what: &str) -> TensorizeResult<(Vec<T>, Vec<T>)> {
    if axes.len() < reserved {
        return Err(TensorizeError::structural(
            what,
            format!("{} axes, {} reserved for the instruction", axes.len(), reserved),
        ));
    }
    let (outer, inner) = axes.split_at(axes.len() - reserved);
    Ok((outer.to_vec(), inner.to_vec()))
}

fn factors_for<'p>(factors: &'p [Vec<usize>], count: usize, what: &str) -> TensorizeResult<&'p [Vec<usize>]> {
    if factors.len() < count {
        return Err(TensorizeError::structural(
            what,
            format!("{} axes to tile, {} factor lists", count, factors.len()),
        ));
    }
    Ok(&factors[..count])
}

pub struct ScheduleApplier<'a> {
    spliced: &'a SplicedDag,
    warp_size: usize,
    feed: BTreeMap<OpId, Vec<OpId>>,
}

impl<'a> ScheduleApplier<'a> {
    pub fn new(spliced: &'a SplicedDag, device: &DeviceConfig) -> Self {
        Self {
            spliced,
            warp_size: device.warp_size,
            feed: spliced.graph.feed_graph(),
        }
    }

    pub fn apply(&self, params: &ScheduleParams) -> TensorizeResult<Schedule> {
        Ok(self.apply_with_state(params)?.0)
    }

    /// Apply and also return the final state
    pub fn apply_with_state(&self, params: &ScheduleParams) -> TensorizeResult<(Schedule, ScheduleState)> {
        let graph = &self.spliced.graph;
        let mut sch = Schedule::new(graph)?;
        let mut state = ScheduleState::new(sch.stage_of(self.spliced.main_op)?);
        for op in graph.op_ids().rev() {
            if !graph.op(op)?.is_compute() {
                continue;
            }
            for primitive in PIPELINE {
                trace!(op = %graph.op(op)?.name, %primitive, "apply primitive");
                self.run(primitive, op, &mut sch, &mut state, params)?;
            }
        }
        debug!(
            stages = sch.len(),
            bindings = sch.bindings().len(),
            split_k = params.split_k,
            "applied schedule"
        );
        Ok((sch, state))
    }

    fn run(
        &self,
        primitive: Primitive,
        op: OpId,
        sch: &mut Schedule,
        state: &mut ScheduleState,
        params: &ScheduleParams,
    ) -> TensorizeResult<()> {
        if primitive != Primitive::Inline && state.inlined.contains(&op) {
            return Ok(());
        }
        match primitive {
            Primitive::Inline => self.inline(op, sch, state, params),
            Primitive::CacheRead => self.cache_read(op, sch, state, params),
            Primitive::SetScope => self.set_scope(op, sch, params),
            Primitive::Tiling if params.uses_split_k() => self.tiling_split_k(op, sch, state, params),
            Primitive::Tiling => self.tiling(op, sch, state, params),
            Primitive::ComputeAt => self.compute_at(op, sch, state),
            Primitive::Unroll => self.unroll(op, sch, state, params),
            Primitive::Tensorize => self.tensorize(op, sch, state, params),
        }
    }

    fn role(&self, op: OpId) -> Option<OperationRole> {
        self.spliced.stage.role(op)
    }

    fn name(&self, op: OpId) -> String {
        self.spliced
            .graph
            .op(op)
            .map_or_else(|_| format!("{:?}", op), |o| o.name.clone())
    }

    fn consumers(&self, op: OpId) -> &[OpId] {
        self.feed.get(&op).map_or(&[], Vec::as_slice)
    }

    fn single_consumer(&self, op: OpId) -> Option<OpId> {
        match self.consumers(op) {
            [one] => Some(*one),
            _ => None,
        }
    }

    fn feeds_load(&self, op: OpId) -> bool {
        self.single_consumer(op)
            .map_or(false, |c| self.role(c) == Some(OperationRole::Load))
    }

    fn intrinsic(&self, op: OpId, output_scope: Option<MemoryScope>) -> TensorizeResult<crate::capability::Intrinsic> {
        let stage = &self.spliced.stage;
        self.spliced
            .dag
            .intrinsic(&stage.compute_key, &stage.shape_key, stage.node_name(op)?, output_scope)
    }

    fn inline(&self, op: OpId, sch: &mut Schedule, state: &mut ScheduleState, params: &ScheduleParams) -> TensorizeResult<()> {
        if self.role(op).is_some() || self.consumers(op).is_empty() {
            return Ok(());
        }
        if self.feeds_load(op) && !params.inline {
            return Ok(());
        }
        if self.spliced.graph.can_inline(op) {
            sch.compute_inline(sch.stage_of(op)?)?;
            state.inlined.insert(op);
            trace!(op = %self.name(op), "inlined");
        }
        Ok(())
    }

    fn cache_read(&self, op: OpId, sch: &mut Schedule, state: &ScheduleState, params: &ScheduleParams) -> TensorizeResult<()> {
        if self.role(op).is_some() {
            return Ok(());
        }
        let Some(consumer) = self.single_consumer(op) else {
            return Ok(());
        };
        let (parent, axis, warps) = if self.role(consumer) == Some(OperationRole::Load) {
            let warps = if params.uses_split_k() {
                params.split_k
            } else {
                params.warp_count()?
            };
            (state.main_stage, state.main_outermost_last_reduce()?, warps)
        } else if consumer == self.spliced.last_op {
            (
                sch.stage_of(consumer)?,
                state.last_outermost_first()?,
                params.last_warp_count()?,
            )
        } else {
            return Ok(());
        };

        let source = sch.stage_of(op)?;
        let readers = [sch.stage_of(consumer)?];
        let shared = sch.cache_read(source, MemoryScope::Shared, &readers)?;
        sch.compute_at(shared, parent, axis)?;
        let root = sch.root_axis(shared)?;
        let fused = sch.fuse(shared, &root)?;
        let (fused, vectorized) = sch.split(shared, fused, params.vectorize)?;
        let (fused, lane) = sch.split(shared, fused, self.warp_size)?;
        let (_, warp) = sch.split(shared, fused, warps)?;
        sch.bind(shared, lane, ThreadTag::ThreadX)?;
        sch.bind(shared, warp, ThreadTag::ThreadY)?;
        sch.vectorize(shared, vectorized)?;
        trace!(op = %self.name(op), warps, vector = params.vectorize, "shared copy");
        Ok(())
    }

    fn set_scope(&self, op: OpId, sch: &mut Schedule, params: &ScheduleParams) -> TensorizeResult<()> {
        let Some(role) = self.role(op) else {
            return Ok(());
        };
        let local = if params.uses_split_k() {
            role == OperationRole::Load
        } else {
            role != OperationRole::Output
        };
        if local {
            sch.set_scope(sch.stage_of(op)?, MemoryScope::Local)?;
        }
        Ok(())
    }

    fn tiling(&self, op: OpId, sch: &mut Schedule, state: &mut ScheduleState, params: &ScheduleParams) -> TensorizeResult<()> {
        if op == self.spliced.main_op {
            self.tile_main(op, sch, state, params)
        } else if op == self.spliced.output_op {
            self.tile_output(op, sch, state, params)
        } else if op == self.spliced.last_op {
            state.last_op_axis = vec![self.tile_like_last(op, sch, params)?];
            Ok(())
        } else if self.feeds_load(op) && !params.inline {
            self.tile_like_last(op, sch, params).map(|_| ())
        } else {
            Ok(())
        }
    }

    fn tiling_split_k(&self, op: OpId, sch: &mut Schedule, state: &mut ScheduleState, params: &ScheduleParams) -> TensorizeResult<()> {
        if op == self.spliced.main_op {
            self.tile_main_split_k(op, sch, state, params)
        } else if op == self.spliced.output_op {
            self.tile_output_split_k(op, sch, state, params)
        } else {
            self.tiling(op, sch, state, params)
        }
    }

    /// Reduce and spatial tiles of the main operator, reserved axes innermost
    fn tile_main(&self, op: OpId, sch: &mut Schedule, state: &mut ScheduleState, params: &ScheduleParams) -> TensorizeResult<()> {
        let name = self.name(op);
        let stage = sch.stage_of(op)?;
        let reserve_spatial = self.spliced.stage.reserve_count(op)?;
        let (spatial_outer, spatial_inner) = split_reserved(&sch.root_axis(stage)?, reserve_spatial, &name)?;

        let reserved: BTreeSet<usize> = self.spliced.stage.main_op_reserve_reduce_axis.iter().copied().collect();
        let (reserve_reduce, split_reduce): (Vec<_>, Vec<_>) = sch
            .root_reduce_axis(stage)?
            .into_iter()
            .enumerate()
            .partition(|(i, _)| reserved.contains(i));
        let reserve_reduce: Vec<AxisId> = reserve_reduce.into_iter().map(|(_, a)| a).collect();
        let split_reduce: Vec<AxisId> = split_reduce.into_iter().map(|(_, a)| a).collect();

        let out_stage = sch.stage_of(self.spliced.output_op)?;
        sch.compute_at(stage, out_stage, state.output_third_innermost_last()?)?;

        let factors = factors_for(&params.reduce_factors, split_reduce.len(), &name)?;
        let mut parts = Vec::new();
        for (axis, f) in split_reduce.iter().zip(factors) {
            parts.push(tile_axes(sch, stage, *axis, f)?);
        }
        let mut groups = zip_parts(&parts);
        groups.push(reserve_reduce.clone());

        let n = groups.len();
        let mut ordered: Vec<AxisId> = groups[..n.saturating_sub(2)].concat();
        ordered.extend(&spatial_outer);
        if n >= 2 {
            ordered.extend(&groups[n - 2]);
        }
        ordered.extend(&spatial_inner);
        ordered.extend(&groups[n - 1]);
        sch.reorder(stage, &ordered)?;

        let back = reserve_spatial + reserve_reduce.len();
        let tensorize_at = ordered
            .len()
            .checked_sub(back)
            .and_then(|i| ordered.get(i))
            .copied()
            .ok_or_else(|| TensorizeError::structural(&name, "no axis left for the instruction"))?;
        state.tensorize_iter.insert(op, tensorize_at);
        trace!(op = %name, groups = n, "tiled main operator");
        state.main_op_reduce_axis = groups;
        Ok(())
    }

    /// Tile the output's spatial axes; returns the level groups with the
    /// reserved group last
    fn tile_output_groups(&self, op: OpId, stage: StageId, sch: &mut Schedule, params: &ScheduleParams) -> TensorizeResult<Vec<Vec<AxisId>>> {
        let name = self.name(op);
        let reserve = self.spliced.stage.reserve_count(op)?;
        let (split_spatial, reserve_spatial) = split_reserved(&sch.root_axis(stage)?, reserve, &name)?;
        let factors = factors_for(&params.spatial_factors, split_spatial.len(), &name)?;
        let mut parts = Vec::new();
        for (axis, f) in split_spatial.iter().zip(factors) {
            parts.push(tile_axes(sch, stage, *axis, f)?);
        }
        let mut groups = zip_parts(&parts);
        groups.push(reserve_spatial);
        sch.reorder(stage, &groups.concat())?;
        if groups.len() <= 3 {
            return Err(TensorizeError::structural(
                &name,
                format!("{} spatial axis groups, need at least four", groups.len()),
            ));
        }
        Ok(groups)
    }

    fn tile_output(&self, op: OpId, sch: &mut Schedule, state: &mut ScheduleState, params: &ScheduleParams) -> TensorizeResult<()> {
        let stage = sch.stage_of(op)?;
        let groups = self.tile_output_groups(op, stage, sch, params)?;
        let n = groups.len();
        let fused = groups[..n - 2]
            .iter()
            .map(|g| sch.fuse(stage, g))
            .collect::<TensorizeResult<Vec<_>>>()?;
        let mut final_axis: Vec<Vec<AxisId>> = fused.iter().map(|a| vec![*a]).collect();
        if let (Some(first), Some(last)) = (fused.first(), fused.last()) {
            sch.bind(stage, *first, ThreadTag::BlockX)?;
            sch.bind(stage, *last, ThreadTag::ThreadY)?;
        }
        match self.spliced.stage.instruction_scope {
            InstructionScope::Thread => {
                let lanes = sch.fuse(stage, &groups[n - 2])?;
                let (outer, inner) = sch.split_nparts(stage, lanes, self.warp_size)?;
                sch.bind(stage, outer, ThreadTag::ThreadX)?;
                final_axis.push(vec![outer, inner]);
            }
            InstructionScope::Warp => final_axis.push(groups[n - 2].clone()),
        }
        final_axis.push(groups[n - 1].clone());

        let reserve = &groups[n - 1];
        let tensorize_at = reserve
            .len()
            .checked_sub(2)
            .map(|i| reserve[i])
            .ok_or_else(|| TensorizeError::structural(self.name(op), "instruction needs two reserved axes"))?;
        state.tensorize_iter.insert(op, tensorize_at);
        state.output_op_axis = final_axis;
        trace!(op = %self.name(op), groups = n, "tiled output operator");
        Ok(())
    }

    /// Fuse, split off a warp of lanes, tile the rest by the terminal
    /// factors. Returns the tiles followed by the lane axis.
    fn tile_like_last(&self, op: OpId, sch: &mut Schedule, params: &ScheduleParams) -> TensorizeResult<Vec<AxisId>> {
        let stage = sch.stage_of(op)?;
        let root = sch.root_axis(stage)?;
        let fused = sch.fuse(stage, &root)?;
        let (fused, lane) = sch.split(stage, fused, self.warp_size)?;
        let mut parts = tile_axes(sch, stage, fused, params.last_split()?)?;
        if let (Some(first), Some(last)) = (parts.first(), parts.last()) {
            sch.bind(stage, *first, ThreadTag::BlockX)?;
            sch.bind(stage, *last, ThreadTag::ThreadY)?;
        }
        sch.bind(stage, lane, ThreadTag::ThreadX)?;
        parts.push(lane);
        trace!(op = %self.name(op), "tiled like the terminal operator");
        Ok(parts)
    }

    /// Partition the reduction over `split_k` warps: an rfactor stage holds
    /// the partial sums and a local cache stage runs the instruction.
    fn tile_main_split_k(&self, op: OpId, sch: &mut Schedule, state: &mut ScheduleState, params: &ScheduleParams) -> TensorizeResult<()> {
        let name = self.name(op);
        let stage = sch.stage_of(op)?;
        let reserved: BTreeSet<usize> = self.spliced.stage.main_op_reserve_reduce_axis.iter().copied().collect();
        let reduce = sch.root_reduce_axis(stage)?;
        let (reserve_reduce, split_reduce): (Vec<_>, Vec<_>) = reduce
            .iter()
            .enumerate()
            .partition(|(i, _)| reserved.contains(i));
        // TODO: generalize the K-split to several split or reserved reduce axes
        let (rko, rki) = match (split_reduce.as_slice(), reserve_reduce.as_slice()) {
            ([(_, rko)], [(_, rki)]) => (**rko, **rki),
            _ => {
                return Err(TensorizeError::structural(
                    &name,
                    format!(
                        "K-split needs one split and one reserved reduce axis, found {} and {}",
                        split_reduce.len(),
                        reserve_reduce.len()
                    ),
                ))
            }
        };
        let inner_extent = sch.extent(rki)?;
        let rk = sch.fuse(stage, &[rko, rki])?;
        let (rk, _) = sch.split(stage, rk, inner_extent)?;
        let mut factors = factors_for(&params.reduce_factors, 1, &name)?[0].clone();
        match factors.last_mut() {
            Some(last) => *last = params.split_k,
            None => return Err(TensorizeError::structural(&name, "empty reduce factor list")),
        }
        let rk_parts = tile_axes(sch, stage, rk, &factors)?;
        let factor_axis = *rk_parts
            .last()
            .ok_or_else(|| TensorizeError::structural(&name, "no reduce part to factor out"))?;

        let rf = sch.rfactor(stage, factor_axis)?;
        let ll = sch.cache_write(rf, MemoryScope::Local)?;
        let out_stage = sch.stage_of(self.spliced.output_op)?;

        sch.compute_at(stage, out_stage, state.output_innermost_last()?)?;

        // partial sums, one warp per K slice
        sch.compute_at(rf, out_stage, state.output_outermost_last()?)?;
        let rf_axis = sch.root_axis(rf)?;
        let (rf_k, rf_spatial) = rf_axis
            .split_first()
            .ok_or_else(|| TensorizeError::structural(&name, "rfactor stage has no axes"))?;
        let reserve = self.spliced.stage.reserve_count(self.spliced.output_op)?;
        let (split_spatial, reserve_spatial) = split_reserved(rf_spatial, reserve, &name)?;
        let spatial_factors = factors_for(&params.spatial_factors, split_spatial.len(), &name)?;
        let mut parts = Vec::new();
        for (axis, f) in split_spatial.iter().zip(spatial_factors) {
            parts.push(tile_axes(sch, rf, *axis, f)?);
        }
        let mut groups = vec![vec![*rf_k]];
        groups.extend(zip_parts(&parts));
        groups.push(reserve_spatial.clone());
        sch.reorder(rf, &groups.concat())?;
        sch.bind(rf, *rf_k, ThreadTag::ThreadY)?;
        let store = self.intrinsic(self.spliced.output_op, Some(MemoryScope::Shared))?;
        let rf_at = *reserve_spatial
            .first()
            .ok_or_else(|| TensorizeError::structural(&name, "no reserved spatial axis"))?;
        sch.tensorize(rf, rf_at, store)?;

        // the instruction itself, in registers
        sch.compute_at(ll, rf, *rf_k)?;
        let ll_axis = sch.root_axis(ll)?;
        let ll_spatial = ll_axis.get(1..).unwrap_or_default();
        let (ll_split, ll_reserve) = split_reserved(ll_spatial, reserve, &name)?;
        let ll_reduce = sch.root_reduce_axis(ll)?;
        let (ll_rki, ll_rk) = ll_reduce
            .split_last()
            .ok_or_else(|| TensorizeError::structural(&name, "local stage has no reduce axis"))?;
        let mut order = ll_split.clone();
        order.extend(ll_rk);
        order.extend(&ll_reserve);
        order.push(*ll_rki);
        sch.reorder(ll, &order)?;
        let mma = self.intrinsic(op, None)?;
        let ll_at = *ll_reserve
            .first()
            .ok_or_else(|| TensorizeError::structural(&name, "no reserved spatial axis"))?;
        sch.tensorize(ll, ll_at, mma)?;

        state.main_op_reduce_axis = ll_rk.iter().map(|a| vec![*a]).collect();
        state.main_stage = ll;
        trace!(op = %name, split_k = params.split_k, "K-split main operator");
        Ok(())
    }

    fn tile_output_split_k(&self, op: OpId, sch: &mut Schedule, state: &mut ScheduleState, params: &ScheduleParams) -> TensorizeResult<()> {
        let stage = sch.stage_of(op)?;
        let groups = self.tile_output_groups(op, stage, sch, params)?;
        let fused = groups
            .iter()
            .map(|g| sch.fuse(stage, g))
            .collect::<TensorizeResult<Vec<_>>>()?;
        let n = fused.len();
        let mut final_axis: Vec<Vec<AxisId>> = fused.iter().map(|a| vec![*a]).collect();
        sch.bind(stage, fused[0], ThreadTag::BlockX)?;

        let (fused_y, tty) = sch.split(stage, fused[n - 2], params.split_k)?;
        sch.bind(stage, tty, ThreadTag::ThreadY)?;
        final_axis[n - 2] = vec![fused_y, tty];

        let (fused_x, lanes) = sch.split(stage, fused[n - 1], self.warp_size * params.vectorize)?;
        let (ttx, vec) = sch.split_nparts(stage, lanes, self.warp_size)?;
        sch.bind(stage, ttx, ThreadTag::ThreadX)?;
        sch.vectorize(stage, vec)?;
        final_axis[n - 1] = vec![fused_x, ttx, vec];

        state.output_op_axis = final_axis;
        trace!(op = %self.name(op), split_k = params.split_k, "K-split output operator");
        Ok(())
    }

    fn compute_at(&self, op: OpId, sch: &mut Schedule, state: &mut ScheduleState) -> TensorizeResult<()> {
        if self.role(op).is_none() {
            return Ok(());
        }
        let (main, output) = (self.spliced.main_op, self.spliced.output_op);
        let (parent, axis) = if op < main {
            (state.main_stage, state.main_second_outermost_last_reduce()?)
        } else if main < op && op < output {
            (sch.stage_of(output)?, state.output_third_innermost_last()?)
        } else {
            return Ok(());
        };
        let stage = sch.stage_of(op)?;
        sch.compute_at(stage, parent, axis)?;
        let reserve = self.spliced.stage.reserve_count(op)?;
        let (_, inner) = split_reserved(&sch.root_axis(stage)?, reserve, &self.name(op))?;
        if let Some(first) = inner.first() {
            state.tensorize_iter.insert(op, *first);
        }
        Ok(())
    }

    fn unroll(&self, op: OpId, sch: &mut Schedule, state: &ScheduleState, params: &ScheduleParams) -> TensorizeResult<()> {
        let (axis, step) = if op == self.spliced.output_op {
            (state.output_outermost_last()?, params.output_unroll_step)
        } else if op == self.spliced.main_op {
            if params.uses_split_k() {
                return Ok(());
            }
            (state.main_outermost_first_reduce()?, params.output_unroll_step)
        } else if op == self.spliced.last_op {
            (state.last_outermost_first()?, params.last_unroll_step)
        } else {
            return Ok(());
        };
        sch.pragma(sch.stage_of(op)?, axis, Pragma::AutoUnrollMaxStep(step))
    }

    fn tensorize(&self, op: OpId, sch: &mut Schedule, state: &ScheduleState, params: &ScheduleParams) -> TensorizeResult<()> {
        let Some(role) = self.role(op) else {
            return Ok(());
        };
        if params.uses_split_k() && role != OperationRole::Load {
            return Ok(());
        }
        let intrinsic = self.intrinsic(op, None)?;
        let axis = state.tensorize_axis(op)?;
        sch.tensorize(sch.stage_of(op)?, axis, intrinsic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::graph::gemm_bias;
    use crate::schedule::Attach;
    use crate::splice::splice;
    use crate::transform::IntrinMatch;
    use crate::wmma::WmmaFp16Fp32;

    fn spliced(m: usize, n: usize, k: usize) -> SplicedDag {
        let host = gemm_bias(m, n, k).unwrap();
        let gemm = host.find_op("gemm").unwrap();
        let matched = IntrinMatch::matmul("nnn", "16x16x16", gemm);
        splice(Arc::new(WmmaFp16Fp32::new()), &host, &matched).unwrap()
    }

    fn params(split_k: usize, inline: bool) -> ScheduleParams {
        ScheduleParams {
            split_k,
            inline,
            vectorize: 4,
            spatial_factors: vec![vec![2, 1, 2, 1], vec![1, 2, 2, 1]],
            reduce_factors: vec![vec![2, 2, 2]],
            last_factors: vec![vec![32, 2, 2]],
            output_unroll_step: 512,
            last_unroll_step: 64,
        }
    }

    #[test]
    fn test_pipeline_order() {
        assert_eq!(PIPELINE[0], Primitive::Inline);
        assert_eq!(PIPELINE[6], Primitive::Tensorize);
        assert_eq!(Primitive::CacheRead.to_string(), "cache_read");
    }

    #[test]
    fn test_main_reduce_groups() {
        let s = spliced(64, 64, 128);
        let applier = ScheduleApplier::new(&s, &DeviceConfig::cuda(70));
        let (sch, state) = applier.apply_with_state(&params(1, false)).unwrap();
        // three split groups plus the reserved one
        assert_eq!(state.main_op_reduce_axis.len(), 4);
        let product: usize = state.main_op_reduce_axis[..3]
            .iter()
            .map(|g| sch.extent(g[0]).unwrap())
            .product();
        assert_eq!(product, 8);
        let reserved = state.main_op_reduce_axis[3][0];
        assert_eq!(sch.axis(reserved).unwrap().name, "k.i");
        let main = sch.stage_of(s.main_op).unwrap();
        assert_eq!(sch.leaf(main).unwrap().last(), Some(&reserved));
        assert_eq!(sch.axis(state.tensorize_axis(s.main_op).unwrap()).unwrap().name, "i.i");
    }

    #[test]
    fn test_output_binding() {
        let s = spliced(64, 64, 128);
        let applier = ScheduleApplier::new(&s, &DeviceConfig::cuda(70));
        let sch = applier.apply(&params(1, false)).unwrap();
        let out = sch.stage(sch.stage_of(s.output_op).unwrap()).unwrap();
        let tags: Vec<ThreadTag> = out.bindings.values().copied().collect();
        assert_eq!(tags, vec![ThreadTag::BlockX, ThreadTag::ThreadY]);
        assert!(out.tensorized.is_some());
        assert_eq!(out.pragmas.len(), 1);
    }

    #[test]
    fn test_loads_attach_to_main() {
        let s = spliced(64, 64, 128);
        let applier = ScheduleApplier::new(&s, &DeviceConfig::cuda(70));
        let (sch, state) = applier.apply_with_state(&params(1, false)).unwrap();
        let main = sch.stage_of(s.main_op).unwrap();
        let load_a = sch.stage(sch.find_stage("gemm.load_a").unwrap()).unwrap();
        assert_eq!(load_a.scope, Some(MemoryScope::Local));
        assert_eq!(
            load_a.attach,
            Attach::At {
                parent: main,
                axis: state.main_op_reduce_axis[1][0]
            }
        );
        assert!(load_a.tensorized.is_some());
        // not inlined: the layout gets a shared copy and its own tiling
        let shared = sch.stage(sch.find_stage("A.tile.shared").unwrap()).unwrap();
        assert_eq!(shared.vectorized.len(), 1);
        let a_tile = sch.stage(sch.find_stage("A.tile").unwrap()).unwrap();
        assert_eq!(a_tile.bindings.len(), 3);
    }

    #[test]
    fn test_inline_layout() {
        let s = spliced(64, 64, 128);
        let applier = ScheduleApplier::new(&s, &DeviceConfig::cuda(70));
        let (sch, state) = applier.apply_with_state(&params(1, true)).unwrap();
        let a_tile = s.graph.find_op("A.tile").unwrap();
        assert!(state.inlined.contains(&a_tile));
        assert!(sch.stage(sch.stage_of(a_tile).unwrap()).unwrap().is_inlined());
        assert!(sch.find_stage("A.tile.shared").is_none());
    }

    #[test]
    fn test_split_k_path() {
        let s = spliced(64, 64, 128);
        let applier = ScheduleApplier::new(&s, &DeviceConfig::cuda(70));
        let (sch, state) = applier.apply_with_state(&params(4, false)).unwrap();
        let rf = sch.find_stage("gemm.rf").unwrap();
        let ll = sch.find_stage("gemm.rf.local").unwrap();
        assert_eq!(state.main_stage, ll);
        assert_eq!(state.main_op_reduce_axis.len(), 2);
        let rf_stage = sch.stage(rf).unwrap();
        assert_eq!(
            rf_stage.tensorized.as_ref().map(|(_, i)| i.output_scope),
            Some(Some(MemoryScope::Shared))
        );
        assert!(sch.stage(ll).unwrap().tensorized.is_some());
        // only loads run the instruction on their own
        let main = sch.stage(sch.stage_of(s.main_op).unwrap()).unwrap();
        assert!(main.tensorized.is_none());
        assert_eq!(main.scope, None);
        let out = sch.stage(sch.stage_of(s.output_op).unwrap()).unwrap();
        assert_eq!(out.vectorized.len(), 1);
    }

    #[test]
    fn test_split_k_rejects_extra_reduce_axes() {
        let s = spliced(64, 64, 128);
        let applier = ScheduleApplier::new(&s, &DeviceConfig::cuda(70));
        let mut stage = s.stage.clone();
        stage.main_op_reserve_reduce_axis = vec![];
        let broken = SplicedDag { stage, ..s.clone() };
        let applier_broken = ScheduleApplier::new(&broken, &DeviceConfig::cuda(70));
        assert!(applier.apply(&params(4, false)).is_ok());
        assert!(matches!(
            applier_broken.apply(&params(4, false)),
            Err(TensorizeError::Structural { .. })
        ));
    }

    #[test]
    fn test_missing_factors_fail_fast() {
        let s = spliced(64, 64, 128);
        let applier = ScheduleApplier::new(&s, &DeviceConfig::cuda(70));
        let mut p = params(1, false);
        p.reduce_factors.clear();
        assert!(matches!(applier.apply(&p), Err(TensorizeError::Structural { .. })));
    }
}
