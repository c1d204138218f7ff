//! Splice the WMMA unit into a GEMM + bias graph, replay one hand-written
//! record and run a short search with a custom oracle.
//!
//! Run with: cargo run --example gemm_bias

use auto_tensorize::{
    gemm_bias, prepare, replay, tune, DeviceConfig, HwAbsDagRegistry, IntrinMatch, Schedule, ScheduleParams,
    SearchConfig, TensorizeResult, TilingConfig,
};

fn main() -> TensorizeResult<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let host = gemm_bias(256, 256, 512)?;
    println!("{}", host);

    let gemm = host
        .find_op("gemm")
        .ok_or_else(|| auto_tensorize::TensorizeError::graph("no gemm operator"))?;
    let matched = IntrinMatch::matmul("nnn", "16x16x16", gemm);
    let spliced = prepare(HwAbsDagRegistry::global()?, &host, "cuda", "wmma_fp16_fp32", &matched)?;
    println!("{}", spliced.graph);

    let device = DeviceConfig::cuda(70);
    let record = ScheduleParams::from_canonical(
        r#"{"split_K":1,"inline":false,"vectorize":4,"spatial_factors":[[4,1,4,1],[2,2,4,1]],"reduce_factors":[[8,2,2]],"last_factors":[[128,4,4]],"output_unroll_step":512,"last_unroll_step":64}"#,
    )?;
    println!("{}", replay(&spliced, &device, &record)?);

    // prefer schedules with many bound threads per block
    let mut oracle = |sch: &Schedule| {
        sch.bindings()
            .iter()
            .filter(|b| b.stage == "gemm.store")
            .map(|b| b.extent as f64)
            .product::<f64>()
    };
    let report = tune(&spliced, &device, &TilingConfig::default(), SearchConfig::new(32, 1), &mut oracle)?;
    if let Some(best) = report.best {
        println!("best {:.1}: {}", best.score, best.record);
    }
    Ok(())
}
