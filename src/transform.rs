//! Compute transform of the matched operator
//!
//! Every host axis matched to an instruction axis of extent `e` is split into
//! an outer axis (`E / e`) and an inner axis (`e`). The operator's axes
//! become `[outer..., inner...]`, inputs read with plain axis indices are
//! routed through a layout operator that exposes `e`-sized inner tiles, and
//! consumers of the operator's output are rewritten to read the tiled layout.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::HwAbsDag;
use crate::error::{TensorizeError, TensorizeResult};
use crate::expr::{AxisRef, Expr, TensorId};
use crate::graph::{ComputeGraph, ComputeOp, IterVar, OpId, OpKind};

/// Which host operator and axes correspond to the instruction's main node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntrinMatch {
    pub compute_key: String,
    pub shape_key: String,
    pub main_op: OpId,
    /// (instruction axis, host axis) pairs
    pub axis_map: Vec<(AxisRef, AxisRef)>,
}

impl IntrinMatch {
    pub fn new(compute_key: impl Into<String>, shape_key: impl Into<String>, main_op: OpId) -> Self {
        Self {
            compute_key: compute_key.into(),
            shape_key: shape_key.into(),
            main_op,
            axis_map: Vec::new(),
        }
    }

    pub fn map(mut self, intrinsic: AxisRef, host: AxisRef) -> Self {
        self.axis_map.push((intrinsic, host));
        self
    }

    /// Identity matching for a `[i, j] x [k]` operator
    pub fn matmul(compute_key: impl Into<String>, shape_key: impl Into<String>, main_op: OpId) -> Self {
        Self::new(compute_key, shape_key, main_op)
            .map(AxisRef::Spatial(0), AxisRef::Spatial(0))
            .map(AxisRef::Spatial(1), AxisRef::Spatial(1))
            .map(AxisRef::Reduce(0), AxisRef::Reduce(0))
    }
}

/// Host graph with the matched operator in tiled form
#[derive(Debug, Clone)]
pub struct TransformedGraph {
    pub graph: ComputeGraph,
    pub main_op: OpId,
    pub layout_ops: Vec<OpId>,
}

/// Host axis -> (instruction axis position, instruction extent)
#[derive(Debug, Default)]
struct AxisTiling {
    spatial: BTreeMap<usize, (usize, usize)>,
    reduce: BTreeMap<usize, (usize, usize)>,
    num_spatial: usize,
    num_reduce: usize,
}

impl AxisTiling {
    fn tile_of(&self, axis: AxisRef) -> Option<(usize, usize)> {
        match axis {
            AxisRef::Spatial(h) => self.spatial.get(&h).copied(),
            AxisRef::Reduce(h) => self.reduce.get(&h).copied(),
        }
    }

    fn inner_ref(&self, axis: AxisRef, position: usize) -> AxisRef {
        match axis {
            AxisRef::Spatial(_) => AxisRef::Spatial(self.num_spatial + position),
            AxisRef::Reduce(_) => AxisRef::Reduce(self.num_reduce + position),
        }
    }

    /// `h` becomes `outer * e + inner` when tiled
    fn substitute(&self, axis: AxisRef) -> Expr {
        match self.tile_of(axis) {
            Some((q, e)) => {
                Expr::Axis(axis) * Expr::Int(e as i64) + Expr::Axis(self.inner_ref(axis, q))
            }
            None => Expr::Axis(axis),
        }
    }
}

fn check_match(
    host: &ComputeOp,
    host_name: &str,
    intrinsic: &ComputeOp,
    m: &IntrinMatch,
) -> TensorizeResult<AxisTiling> {
    let mut tiling = AxisTiling {
        num_spatial: host.axis.len(),
        num_reduce: host.reduce_axis.len(),
        ..AxisTiling::default()
    };
    let mut seen_intrinsic = Vec::new();
    for (intrin_axis, host_axis) in &m.axis_map {
        if intrin_axis.kind() != host_axis.kind() {
            return Err(TensorizeError::matching(format!(
                "{:?} cannot be matched to {:?} of '{}'",
                intrin_axis, host_axis, host_name
            )));
        }
        if seen_intrinsic.contains(intrin_axis) {
            return Err(TensorizeError::matching(format!("{:?} matched twice", intrin_axis)));
        }
        seen_intrinsic.push(*intrin_axis);
        let iv = intrinsic.iter_var(*intrin_axis).ok_or_else(|| {
            TensorizeError::matching(format!("instruction has no axis {:?}", intrin_axis))
        })?;
        let hv = host.iter_var(*host_axis).ok_or_else(|| {
            TensorizeError::matching(format!("'{}' has no axis {:?}", host_name, host_axis))
        })?;
        if hv.extent % iv.extent != 0 {
            return Err(TensorizeError::matching(format!(
                "axis '{}' of '{}' has extent {}, not divisible by {}",
                hv.name, host_name, hv.extent, iv.extent
            )));
        }
        let slot = (intrin_axis.index(), iv.extent);
        let previous = match host_axis {
            AxisRef::Spatial(h) => tiling.spatial.insert(*h, slot),
            AxisRef::Reduce(h) => tiling.reduce.insert(*h, slot),
        };
        if previous.is_some() {
            return Err(TensorizeError::matching(format!(
                "axis '{}' of '{}' matched twice",
                hv.name, host_name
            )));
        }
    }
    let expected = intrinsic.axis.len() + intrinsic.reduce_axis.len();
    if seen_intrinsic.len() != expected {
        return Err(TensorizeError::matching(format!(
            "{} of {} instruction axes matched",
            seen_intrinsic.len(),
            expected
        )));
    }
    Ok(tiling)
}

/// Index pattern of an input read only through plain, full-extent axis loads
fn plain_pattern(
    body: &Expr,
    tensor: TensorId,
    shape: &[usize],
    op: &ComputeOp,
    tiling: &AxisTiling,
) -> Option<Vec<AxisRef>> {
    let mut pattern: Option<Vec<AxisRef>> = None;
    for (t, indices) in body.loads() {
        if t != tensor {
            continue;
        }
        let refs = indices
            .iter()
            .map(|idx| match idx {
                Expr::Axis(a) => Some(*a),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        match &pattern {
            Some(p) if *p != refs => return None,
            _ => pattern = Some(refs),
        }
    }
    let pattern = pattern?;
    let full_extent = pattern
        .iter()
        .zip(shape)
        .all(|(a, &dim)| op.iter_var(*a).map_or(false, |iv| iv.extent == dim));
    let any_tiled = pattern.iter().any(|a| tiling.tile_of(*a).is_some());
    (full_extent && any_tiled).then_some(pattern)
}

fn tiled_name(iv: &IterVar, suffix: &str) -> String {
    format!("{}.{}", iv.name, suffix)
}

/// Rewrite the matched operator into its tiled form
pub fn transform_main_op(
    host: &ComputeGraph,
    dag: &dyn HwAbsDag,
    m: &IntrinMatch,
) -> TensorizeResult<TransformedGraph> {
    let intrinsic = dag.main_expression(&m.compute_key, &m.shape_key)?;
    let intrinsic_op = ComputeOp {
        axis: intrinsic.axis.clone(),
        reduce_axis: intrinsic.reduce_axis.clone(),
        body: intrinsic.body.clone(),
    };
    let main = host.op(m.main_op)?;
    let main_name = main.name.clone();
    let main_op = host.compute_of(m.main_op)?;
    let main_out = main.output;
    let tiling = check_match(main_op, &main_name, &intrinsic_op, m)?;

    // host position of each instruction axis, in instruction order
    let by_position = |tiles: &BTreeMap<usize, (usize, usize)>| -> Vec<(usize, usize)> {
        tiles
            .iter()
            .map(|(&h, &(q, e))| (q, (h, e)))
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect()
    };
    let inner_spatial = by_position(&tiling.spatial);
    let inner_reduce = by_position(&tiling.reduce);

    let split_axes = |axes: &[IterVar], tiles: &BTreeMap<usize, (usize, usize)>, inner: &[(usize, usize)]| {
        let mut out: Vec<IterVar> = axes
            .iter()
            .enumerate()
            .map(|(h, iv)| match tiles.get(&h) {
                Some(&(_, e)) => IterVar {
                    name: tiled_name(iv, "o"),
                    extent: iv.extent / e,
                    kind: iv.kind,
                },
                None => iv.clone(),
            })
            .collect();
        for &(h, e) in inner {
            out.push(IterVar {
                name: tiled_name(&axes[h], "i"),
                extent: e,
                kind: axes[h].kind,
            });
        }
        out
    };
    let new_axis = split_axes(&main_op.axis, &tiling.spatial, &inner_spatial);
    let new_reduce = split_axes(&main_op.reduce_axis, &tiling.reduce, &inner_reduce);

    let mut out = ComputeGraph::new();
    let mut remap: BTreeMap<TensorId, TensorId> = BTreeMap::new();
    let mut layout_ops = Vec::new();
    let mut new_main = None;

    for id in host.op_ids() {
        let op = host.op(id)?;
        let tensor = host.tensor(op.output)?;
        let new_tensor = match &op.kind {
            OpKind::Placeholder => out.placeholder(op.name.as_str(), &tensor.shape, tensor.dtype)?,
            OpKind::Compute(c) if id == m.main_op => {
                let mut layouts: BTreeMap<TensorId, (TensorId, Vec<AxisRef>)> = BTreeMap::new();
                for input in c.body.tensors() {
                    let t = host.tensor(input)?;
                    let Some(pattern) = plain_pattern(&c.body, input, &t.shape, c, &tiling) else {
                        continue;
                    };
                    let layout = build_layout(&mut out, &remap, input, t, &pattern, c, &tiling)?;
                    layout_ops.push(out.tensor(layout)?.op);
                    layouts.insert(input, (layout, pattern));
                }
                let body = rewrite_main_body(&c.body, &remap, &layouts, &tiling)?;
                let t = out.compute_op(
                    op.name.as_str(),
                    ComputeOp {
                        axis: new_axis.clone(),
                        reduce_axis: new_reduce.clone(),
                        body,
                    },
                    tensor.dtype,
                )?;
                new_main = Some(out.tensor(t)?.op);
                t
            }
            OpKind::Compute(c) => {
                let main_new = remap.get(&main_out).copied();
                let body = c.body.rewrite_loads(&mut |t, indices| {
                    if t == main_out {
                        let target = main_new.ok_or_else(|| {
                            TensorizeError::graph(format!("'{}' read before it was built", main_name))
                        })?;
                        Ok(Expr::load(target, tiled_indices(&indices, &tiling, &inner_spatial)))
                    } else {
                        Ok(Expr::load(lookup(&remap, t)?, indices))
                    }
                })?;
                out.compute_op(
                    op.name.as_str(),
                    ComputeOp {
                        axis: c.axis.clone(),
                        reduce_axis: c.reduce_axis.clone(),
                        body,
                    },
                    tensor.dtype,
                )?
            }
        };
        remap.insert(op.output, new_tensor);
    }

    let main_op = new_main.ok_or_else(|| TensorizeError::matching("matched operator not found"))?;
    debug!(
        op = %main_name,
        layouts = layout_ops.len(),
        axes = new_axis.len(),
        reduce_axes = new_reduce.len(),
        "tiled matched operator"
    );
    Ok(TransformedGraph {
        graph: out,
        main_op,
        layout_ops,
    })
}

fn lookup(remap: &BTreeMap<TensorId, TensorId>, t: TensorId) -> TensorizeResult<TensorId> {
    remap
        .get(&t)
        .copied()
        .ok_or_else(|| TensorizeError::graph(format!("tensor {:?} used before definition", t)))
}

/// `<tensor>.tile[outer..., inner...] = tensor[outer * e + inner, ...]`
fn build_layout(
    out: &mut ComputeGraph,
    remap: &BTreeMap<TensorId, TensorId>,
    input: TensorId,
    tensor: &crate::graph::Tensor,
    pattern: &[AxisRef],
    op: &ComputeOp,
    tiling: &AxisTiling,
) -> TensorizeResult<TensorId> {
    let mut axis = Vec::new();
    let mut inner = Vec::new();
    let mut indices = Vec::new();
    for (p, a) in pattern.iter().enumerate() {
        let iv = op
            .iter_var(*a)
            .ok_or_else(|| TensorizeError::graph(format!("missing axis {:?}", a)))?;
        match tiling.tile_of(*a) {
            Some((_, e)) => {
                axis.push(IterVar::spatial(tiled_name(iv, "o"), iv.extent / e));
                inner.push(IterVar::spatial(tiled_name(iv, "i"), e));
                indices.push((p, Some(e)));
            }
            None => {
                axis.push(IterVar::spatial(iv.name.clone(), iv.extent));
                indices.push((p, None));
            }
        }
    }
    let dims = pattern.len();
    let mut next_inner = dims;
    let index_exprs: Vec<Expr> = indices
        .into_iter()
        .map(|(p, tile)| match tile {
            Some(e) => {
                let inner_pos = next_inner;
                next_inner += 1;
                Expr::spatial(p) * Expr::Int(e as i64) + Expr::spatial(inner_pos)
            }
            None => Expr::spatial(p),
        })
        .collect();
    axis.extend(inner);
    out.compute_with(
        format!("{}.tile", tensor.name),
        axis,
        Vec::new(),
        tensor.dtype,
        Expr::load(lookup(remap, input)?, index_exprs),
    )
}

fn rewrite_main_body(
    expr: &Expr,
    remap: &BTreeMap<TensorId, TensorId>,
    layouts: &BTreeMap<TensorId, (TensorId, Vec<AxisRef>)>,
    tiling: &AxisTiling,
) -> TensorizeResult<Expr> {
    Ok(match expr {
        Expr::Axis(a) => tiling.substitute(*a),
        Expr::Load { tensor, indices } => match layouts.get(tensor) {
            Some((layout, pattern)) => {
                let mut idx: Vec<Expr> = pattern.iter().map(|a| Expr::Axis(*a)).collect();
                for a in pattern {
                    if let Some((q, _)) = tiling.tile_of(*a) {
                        idx.push(Expr::Axis(tiling.inner_ref(*a, q)));
                    }
                }
                Expr::load(*layout, idx)
            }
            None => Expr::load(
                lookup(remap, *tensor)?,
                indices
                    .iter()
                    .map(|i| rewrite_main_body(i, remap, layouts, tiling))
                    .collect::<TensorizeResult<Vec<_>>>()?,
            ),
        },
        Expr::Binary { op, lhs, rhs } => Expr::binary(
            *op,
            rewrite_main_body(lhs, remap, layouts, tiling)?,
            rewrite_main_body(rhs, remap, layouts, tiling)?,
        ),
        Expr::Cast { dtype, value } => {
            Expr::cast(*dtype, rewrite_main_body(value, remap, layouts, tiling)?)
        }
        Expr::Sum(source) => Expr::sum(rewrite_main_body(source, remap, layouts, tiling)?),
        Expr::Int(_) | Expr::Float(_) => expr.clone(),
    })
}

/// Consumer index into the tiled output: `[idx / e..., idx % e...]`
fn tiled_indices(indices: &[Expr], tiling: &AxisTiling, inner_spatial: &[(usize, usize)]) -> Vec<Expr> {
    let mut out: Vec<Expr> = indices
        .iter()
        .enumerate()
        .map(|(h, idx)| match tiling.spatial.get(&h) {
            Some(&(_, e)) => idx.clone() / Expr::Int(e as i64),
            None => idx.clone(),
        })
        .collect();
    for &(h, e) in inner_spatial {
        if let Some(idx) = indices.get(h) {
            out.push(idx.clone() % Expr::Int(e as i64));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::gemm_bias;
    use crate::wmma::WmmaFp16Fp32;

    #[test]
    fn test_gemm_is_tiled() {
        let host = gemm_bias(64, 32, 48).unwrap();
        let gemm = host.find_op("gemm").unwrap();
        let m = IntrinMatch::matmul("nnn", "16x16x16", gemm);
        let t = transform_main_op(&host, &WmmaFp16Fp32::new(), &m).unwrap();

        let main = t.graph.compute_of(t.main_op).unwrap();
        let extents: Vec<usize> = main.axis.iter().map(|iv| iv.extent).collect();
        assert_eq!(extents, vec![4, 2, 16, 16]);
        let reduce: Vec<usize> = main.reduce_axis.iter().map(|iv| iv.extent).collect();
        assert_eq!(reduce, vec![3, 16]);
        assert_eq!(main.axis[2].name, "i.i");

        assert_eq!(t.layout_ops.len(), 2);
        let a_tile = t.graph.find_op("A.tile").unwrap();
        let shape = &t.graph.tensor(t.graph.output_of(a_tile).unwrap()).unwrap().shape;
        assert_eq!(shape, &vec![4, 3, 16, 16]);
        // layouts feed the operator directly
        assert_eq!(t.graph.read_graph(t.main_op).unwrap(), t.layout_ops);
    }

    #[test]
    fn test_consumer_reads_tiled_output() {
        let host = gemm_bias(64, 32, 48).unwrap();
        let gemm = host.find_op("gemm").unwrap();
        let m = IntrinMatch::matmul("nnn", "16x16x16", gemm);
        let t = transform_main_op(&host, &WmmaFp16Fp32::new(), &m).unwrap();
        let bias_add = t.graph.find_op("bias_add").unwrap();
        let body = &t.graph.compute_of(bias_add).unwrap().body;
        let main_out = t.graph.output_of(t.main_op).unwrap();
        let (_, indices) = body
            .loads()
            .into_iter()
            .find(|(tensor, _)| *tensor == main_out)
            .unwrap();
        assert_eq!(indices.len(), 4);
        assert_eq!(indices[0].to_string(), "(s0 / 16)");
        assert_eq!(indices[3].to_string(), "(s1 % 16)");
        // output shape is unchanged
        let out = t.graph.output_of(bias_add).unwrap();
        assert_eq!(t.graph.tensor(out).unwrap().shape, vec![64, 32]);
    }

    #[test]
    fn test_non_divisible_extent() {
        let host = gemm_bias(60, 32, 48).unwrap();
        let gemm = host.find_op("gemm").unwrap();
        let m = IntrinMatch::matmul("nnn", "16x16x16", gemm);
        let err = transform_main_op(&host, &WmmaFp16Fp32::new(), &m).unwrap_err();
        assert!(matches!(err, TensorizeError::Match { .. }));
    }

    #[test]
    fn test_incomplete_match() {
        let host = gemm_bias(64, 32, 48).unwrap();
        let gemm = host.find_op("gemm").unwrap();
        let m = IntrinMatch::new("nnn", "16x16x16", gemm)
            .map(AxisRef::Spatial(0), AxisRef::Spatial(0))
            .map(AxisRef::Spatial(1), AxisRef::Spatial(1));
        assert!(transform_main_op(&host, &WmmaFp16Fp32::new(), &m).is_err());
    }

    #[test]
    fn test_kind_mismatch() {
        let host = gemm_bias(64, 32, 48).unwrap();
        let gemm = host.find_op("gemm").unwrap();
        let m = IntrinMatch::new("nnn", "16x16x16", gemm)
            .map(AxisRef::Spatial(0), AxisRef::Reduce(0))
            .map(AxisRef::Spatial(1), AxisRef::Spatial(1))
            .map(AxisRef::Reduce(0), AxisRef::Spatial(0));
        assert!(transform_main_op(&host, &WmmaFp16Fp32::new(), &m).is_err());
    }
}
