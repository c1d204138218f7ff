//! End-to-end runs of splice + apply on the GEMM + bias graph

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use auto_tensorize::schedule::Relation;
use auto_tensorize::wmma::WmmaFp16Fp32;
use auto_tensorize::{
    gemm_bias, splice, DeviceConfig, IntrinMatch, SamplePolicy, ScheduleApplier, ScheduleGenerator,
    ScheduleParams, SplicedDag, TilingConfig,
};

fn spliced(m: usize, n: usize, k: usize) -> SplicedDag {
    let host = gemm_bias(m, n, k).unwrap();
    let gemm = host.find_op("gemm").unwrap();
    splice(
        Arc::new(WmmaFp16Fp32::new()),
        &host,
        &IntrinMatch::matmul("nnn", "16x16x16", gemm),
    )
    .unwrap()
}

fn sampled(s: &SplicedDag, seed: u64) -> ScheduleParams {
    let generator = ScheduleGenerator::new(s, &DeviceConfig::cuda(70), &TilingConfig::default()).unwrap();
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    generator.sample(SamplePolicy::Random, &mut rng, 1.0)
}

#[test]
fn test_reduce_groups_keep_reserved_axis() {
    let s = spliced(64, 64, 1024);
    let device = DeviceConfig::cuda(70);
    let record = ScheduleParams {
        split_k: 1,
        ..sampled(&s, 5)
    };
    assert_eq!(record.reduce_factors.len(), 1);
    assert_eq!(record.reduce_factors[0].len(), 3);

    let (sch, state) = ScheduleApplier::new(&s, &device).apply_with_state(&record).unwrap();
    let main = sch.stage_of(s.main_op).unwrap();
    let root_reduce = sch.root_reduce_axis(main).unwrap();
    let reserved = root_reduce[1];

    // three split groups, then the reserved group
    assert_eq!(state.main_op_reduce_axis.len(), 4);
    let product: usize = state.main_op_reduce_axis[..3]
        .iter()
        .flatten()
        .map(|a| sch.extent(*a).unwrap())
        .product();
    assert_eq!(product, 1024 / 16);
    assert_eq!(state.main_op_reduce_axis[3], vec![reserved]);

    // never split or fused
    let stage = sch.stage(main).unwrap();
    let touched = stage.relations.iter().any(|r| match r {
        Relation::Split { parent, .. } => *parent == reserved,
        Relation::Fuse { fused, .. } => fused.contains(&reserved),
    });
    assert!(!touched);
    assert_eq!(sch.extent(reserved).unwrap(), 16);
    assert_eq!(stage.leaf.last(), Some(&reserved));

    // the instruction covers the reserved inner block
    let (at, intrinsic) = stage.tensorized.clone().unwrap();
    assert_eq!(intrinsic.node, "mma");
    let pos = |a| stage.leaf.iter().position(|x| *x == a).unwrap();
    assert_eq!(pos(at), stage.leaf.len() - 3);
    assert!(pos(at) < pos(reserved));
}

#[test]
fn test_unit_split_k_takes_plain_path() {
    let s = spliced(64, 64, 256);
    let device = DeviceConfig::cuda(70);
    let applier = ScheduleApplier::new(&s, &device);
    let base = sampled(&s, 9);

    let one = applier.apply(&ScheduleParams { split_k: 1, ..base.clone() }).unwrap();
    let zero = applier.apply(&ScheduleParams { split_k: 0, ..base.clone() }).unwrap();
    assert_eq!(one, zero);
    assert!(one.find_stage("gemm.rf").is_none());
    assert!(one.find_stage("gemm.rf.local").is_none());

    let split = applier.apply(&ScheduleParams { split_k: 4, ..base }).unwrap();
    assert!(split.find_stage("gemm.rf").is_some());
    assert!(split.find_stage("gemm.rf.local").is_some());
}

#[test]
fn test_apply_is_deterministic() {
    let device = DeviceConfig::cuda(70);
    let first = spliced(128, 64, 256);
    let second = spliced(128, 64, 256);
    for seed in 0..8 {
        let record = sampled(&first, seed);
        let a = ScheduleApplier::new(&first, &device).apply(&record).unwrap();
        let b = ScheduleApplier::new(&second, &device).apply(&record).unwrap();
        assert_eq!(a.bindings(), b.bindings());
        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }
}

#[test]
fn test_record_replays_from_log_line() {
    let s = spliced(64, 64, 128);
    let device = DeviceConfig::cuda(70);
    let record = sampled(&s, 3);
    let line = auto_tensorize::TuningEntry::new(record.clone(), 2.5).to_json().unwrap();
    let entry = auto_tensorize::TuningEntry::from_json(&line).unwrap();
    assert_eq!(
        auto_tensorize::replay(&s, &device, &entry.record).unwrap(),
        auto_tensorize::replay(&s, &device, &record).unwrap()
    );
}
