//! Property tests over capability graphs, the registry and records

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::collection::vec;
use proptest::prelude::*;

use auto_tensorize::capability::{CapabilityClass, CapabilityGraph, HwAbsDag};
use auto_tensorize::registry::HwAbsDagFactory;
use auto_tensorize::wmma::WmmaFp16Fp32;
use auto_tensorize::{
    gemm_bias, splice, DeviceConfig, HwAbsDagRegistry, IntrinMatch, ScheduleGenerator, ScheduleParams,
    TensorizeError, TilingConfig,
};

fn class() -> impl Strategy<Value = CapabilityClass> {
    prop_oneof![
        Just(CapabilityClass::Compute),
        Just(CapabilityClass::Memory),
        Just(CapabilityClass::Elementwise),
    ]
}

/// A single-sink DAG: node i reads the nodes picked by `reads[i]`, and a
/// final sink reads every node nobody else reads
fn dag(classes: &[CapabilityClass], reads: &[u32]) -> CapabilityGraph {
    let name = |i: usize| format!("n{}", i);
    let main = classes
        .iter()
        .position(|c| *c == CapabilityClass::Compute)
        .map_or_else(|| name(0), name);
    let mut g = CapabilityGraph::new("random", main.clone(), main);
    let mut edges: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, mask) in reads.iter().enumerate().take(classes.len()).skip(1) {
        let inputs: Vec<usize> = (0..i).filter(|j| mask & (1 << j) != 0).collect();
        edges.insert(i, inputs);
    }
    let sink = classes.len();
    let read_somewhere: Vec<usize> = edges.values().flatten().copied().collect();
    edges.insert(sink, (0..sink).filter(|i| !read_somewhere.contains(i)).collect());

    for (i, c) in classes.iter().enumerate() {
        g = g.node(name(i), *c);
    }
    g = g.node(name(sink), CapabilityClass::Memory);
    for (i, inputs) in &edges {
        let names: Vec<String> = inputs.iter().map(|j| name(*j)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        g = g.edge(name(*i), &refs);
    }
    g
}

fn record() -> impl Strategy<Value = ScheduleParams> {
    (
        1usize..32,
        any::<bool>(),
        1usize..16,
        vec(vec(1usize..64, 1..5), 0..4),
        vec(vec(1usize..64, 1..5), 0..3),
        vec(vec(1usize..512, 1..4), 0..2),
        1usize..2048,
        1usize..2048,
    )
        .prop_map(|(split_k, inline, vectorize, spatial, reduce, last, ou, lu)| ScheduleParams {
            split_k,
            inline,
            vectorize,
            spatial_factors: spatial,
            reduce_factors: reduce,
            last_factors: last,
            output_unroll_step: ou,
            last_unroll_step: lu,
        })
}

proptest! {
    #[test]
    fn prop_valid_iff_one_compute_node(classes in vec(class(), 1..8)) {
        let g = dag(&classes, &[]);
        let computes = classes.iter().filter(|c| **c == CapabilityClass::Compute).count();
        prop_assert_eq!(g.valid(), computes == 1);
    }

    #[test]
    fn prop_serialize_is_topological(n in 1usize..8, reads in vec(any::<u32>(), 8)) {
        let mut classes = vec![CapabilityClass::Memory; n];
        classes[0] = CapabilityClass::Compute;
        let g = dag(&classes, &reads);
        let s = g.serialize(|_| true, |_| true).unwrap();

        let mut sorted = s.nodes.clone();
        sorted.sort();
        let mut expected: Vec<String> = g.nodes.keys().cloned().collect();
        expected.sort();
        prop_assert_eq!(sorted, expected);

        let pos = |name: &str| s.nodes.iter().position(|x| x == name).unwrap();
        for (consumer, inputs) in &g.edges {
            for producer in inputs {
                prop_assert!(pos(producer) < pos(consumer));
            }
        }
    }

    #[test]
    fn prop_registry_rejects_duplicates(target in "[a-z]{1,8}", mnemonic in "[a-z_]{1,12}") {
        let reg = HwAbsDagRegistry::new();
        let factory: HwAbsDagFactory = Arc::new(|| Box::new(WmmaFp16Fp32::new()) as Box<dyn HwAbsDag>);
        reg.add(&target, &mnemonic, factory.clone(), false).unwrap();
        let dup = reg.add(&target, &mnemonic, factory.clone(), false);
        let is_duplicate = matches!(dup, Err(TensorizeError::Duplicate { .. }));
        prop_assert!(is_duplicate);
        prop_assert!(reg.add(&target, &mnemonic, factory, true).is_ok());
        reg.remove(&target, &mnemonic, false).unwrap();
        prop_assert!(
            matches!(reg.find(&target, &mnemonic), Err(TensorizeError::Lookup { .. })),
            "found a removed entry"
        );
    }

    #[test]
    fn prop_record_round_trip(r in record()) {
        let text = r.to_canonical().unwrap();
        prop_assert_eq!(ScheduleParams::from_canonical(&text).unwrap(), r);
    }

    #[test]
    fn prop_splice_leaves_inputs_untouched(m in 1usize..5, n in 1usize..5, k in 1usize..5) {
        let host = gemm_bias(16 * m, 16 * n, 16 * k).unwrap();
        let host_before = host.clone();
        let dag = Arc::new(WmmaFp16Fp32::new());
        let graph_before = dag.graph().clone();
        let gemm = host.find_op("gemm").unwrap();
        splice(dag.clone(), &host, &IntrinMatch::matmul("nnn", "16x16x16", gemm)).unwrap();
        prop_assert_eq!(host, host_before);
        prop_assert_eq!(dag.graph(), &graph_before);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_too_many_blocks_is_illegal(
        outer in vec(3usize..64, 2),
        r in record(),
    ) {
        let host = gemm_bias(64, 64, 64).unwrap();
        let gemm = host.find_op("gemm").unwrap();
        let s = splice(
            Arc::new(WmmaFp16Fp32::new()),
            &host,
            &IntrinMatch::matmul("nnn", "16x16x16", gemm),
        )
        .unwrap();
        let mut device = DeviceConfig::cuda(70);
        device.max_blocks = 8;
        let generator = ScheduleGenerator::new(&s, &device, &TilingConfig::default()).unwrap();

        let record = ScheduleParams {
            spatial_factors: outer.iter().map(|o| vec![*o, 1, 1, 1]).collect(),
            ..r
        };
        prop_assert!(
            matches!(
                generator.check_legality(&record),
                Err(TensorizeError::Legality { limit: "blocks", .. })
            ),
            "record passed the block limit"
        );
        prop_assert!(!generator.valid(&record));
    }
}
