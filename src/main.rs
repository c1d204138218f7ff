//! Schedule search CLI
//!
//! Usage:
//!   hwtune --m 1024 --n 1024 --k 1024
//!   hwtune --m 512 --n 256 --k 128 --trials 200 --seed 7 --json
//!   hwtune --search-config search.json -v

use clap::Parser as ClapParser;
use colored::Colorize;
use std::fs;
use tracing_subscriber::EnvFilter;

use auto_tensorize::{
    gemm_bias, prepare, replay, tune, DeviceConfig, IntrinMatch, Schedule, SearchConfig, SearchReport,
    HwAbsDagRegistry, ThreadTag, TilingConfig,
};

#[derive(ClapParser, Debug)]
#[command(name = "hwtune")]
#[command(version = "0.1.0")]
#[command(about = "Splices a matrix unit into a GEMM + bias graph and searches its schedule")]
struct Args {
    /// Rows of the product
    #[arg(long, default_value = "1024")]
    m: usize,

    /// Columns of the product
    #[arg(long, default_value = "1024")]
    n: usize,

    /// Reduction length
    #[arg(long, default_value = "1024")]
    k: usize,

    /// Instruction problem size, e.g. "16x16x16" or "32x8x16"
    #[arg(long = "shape-key", default_value = "16x16x16")]
    shape_key: String,

    /// Operand layout key of the instruction
    #[arg(long = "compute-key", default_value = "nnn")]
    compute_key: String,

    /// Target registered in the capability registry
    #[arg(long, default_value = "cuda")]
    target: String,

    /// Hardware unit mnemonic
    #[arg(long, default_value = "wmma_fp16_fp32")]
    mnemonic: String,

    /// Number of search trials (overrides the search config)
    #[arg(short = 't', long)]
    trials: Option<usize>,

    /// Random seed (overrides the search config)
    #[arg(long)]
    seed: Option<u64>,

    /// Compute capability
    #[arg(long, default_value = "70")]
    arch: u32,

    /// Search settings as JSON
    #[arg(long = "search-config")]
    search_config: Option<String>,

    /// Tiling settings as JSON
    #[arg(long = "tiling-config")]
    tiling_config: Option<String>,

    /// Output as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn fail(what: &str, e: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", what.red(), e);
    std::process::exit(1);
}

fn read_json(path: &str) -> String {
    fs::read_to_string(path).unwrap_or_else(|e| fail("Error", format!("Failed to read '{}': {}", path, e)))
}

/// Analytic stand-in for a real measurement: rewards full thread blocks
/// and enough blocks to cover every SM. Zero when a block is too large.
fn occupancy(schedule: &Schedule, device: &DeviceConfig) -> f64 {
    let bindings = schedule.bindings();
    let blocks = bindings
        .iter()
        .filter(|b| b.tag == ThreadTag::BlockX)
        .map(|b| b.extent)
        .max()
        .unwrap_or(1);
    let threads = |stage: &str| -> usize {
        bindings
            .iter()
            .filter(|b| b.stage == stage && b.tag != ThreadTag::BlockX)
            .map(|b| b.extent)
            .product()
    };
    let threads = bindings.iter().map(|b| threads(&b.stage)).max().unwrap_or(1);
    if threads > device.max_threads_per_block {
        return 0.0;
    }
    let fill = threads as f64 / device.max_threads_per_block as f64;
    let waves = (blocks as f64 / device.num_sms.max(1) as f64).min(1.0);
    fill * waves * 100.0
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let mut search = match &args.search_config {
        Some(path) => SearchConfig::from_json(&read_json(path)).unwrap_or_else(|e| fail("Config error", e)),
        None => SearchConfig::default(),
    };
    if let Some(trials) = args.trials {
        search.trials = trials;
    }
    if let Some(seed) = args.seed {
        search.seed = seed;
    }
    let tiling = match &args.tiling_config {
        Some(path) => TilingConfig::from_json(&read_json(path)).unwrap_or_else(|e| fail("Config error", e)),
        None => TilingConfig::default(),
    };
    let device = DeviceConfig::cuda(args.arch);

    if args.verbose && !args.json_output {
        println!("{}", "Hardware Schedule Search".bold().blue());
        println!("{}", "=".repeat(35));
        println!();
        println!("{}: gemm {}x{}x{} + bias", "Input".green(), args.m, args.n, args.k);
        println!(
            "{}: {}/{} ({}, {})",
            "Unit".green(),
            args.target,
            args.mnemonic,
            args.compute_key,
            args.shape_key
        );
        println!();
    }

    let host = gemm_bias(args.m, args.n, args.k).unwrap_or_else(|e| fail("Graph error", e));
    let gemm = host
        .find_op("gemm")
        .unwrap_or_else(|| fail("Graph error", "no gemm operator"));
    let matched = IntrinMatch::matmul(&args.compute_key, &args.shape_key, gemm);
    let registry = HwAbsDagRegistry::global().unwrap_or_else(|e| fail("Registry error", e));
    let spliced = prepare(registry, &host, &args.target, &args.mnemonic, &matched)
        .unwrap_or_else(|e| fail("Splice error", e));

    let mut oracle = |sch: &Schedule| occupancy(sch, &device);
    let report = tune(&spliced, &device, &tiling, search, &mut oracle).unwrap_or_else(|e| fail("Search error", e));

    let schedule = report
        .best
        .as_ref()
        .map(|best| replay(&spliced, &device, &best.record).unwrap_or_else(|e| fail("Replay error", e)));

    if args.json_output {
        let out = serde_json::json!({
            "report": report,
            "schedule": schedule,
        });
        match serde_json::to_string_pretty(&out) {
            Ok(json) => println!("{}", json),
            Err(e) => fail("Error", format!("Failed to serialize to JSON: {}", e)),
        }
    } else {
        print_report(&report, schedule.as_ref(), &device, args.verbose);
    }
}

fn print_report(report: &SearchReport, schedule: Option<&Schedule>, device: &DeviceConfig, verbose: bool) {
    println!("{}", "Search Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();

    println!("{}: {} (sm_{})", "Target".cyan(), device.target, device.arch);
    println!(
        "{}: {} trials, {} measured, {} failed, {} illegal, {} repeated",
        "Trials".cyan(),
        report.trials,
        report.measured,
        report.failed,
        report.rejected,
        report.repeated
    );
    println!();

    let (Some(best), Some(schedule)) = (&report.best, schedule) else {
        println!("{}", "No schedule scored above zero".yellow());
        return;
    };
    println!("{}: {:.3}", "Best score".cyan(), best.score);
    println!("{}: {}", "Best record".cyan(), best.record);
    println!();

    if verbose {
        println!("{}", "Top Records".bold().yellow());
        println!("{}", "-".repeat(50));
        for entry in &report.top {
            println!("  {:>8.3}  {}", entry.score, entry.record);
        }
        println!();
    }

    println!("{}", "Schedule".bold().yellow());
    println!("{}", "-".repeat(50));
    print!("{}", schedule);
}

#[cfg(test)]
mod tests {
    use super::*;
    use auto_tensorize::{splice, wmma::WmmaFp16Fp32, ScheduleParams};
    use std::sync::Arc;

    fn schedule() -> Schedule {
        let host = gemm_bias(256, 256, 512).unwrap();
        let gemm = host.find_op("gemm").unwrap();
        let matched = IntrinMatch::matmul("nnn", "16x16x16", gemm);
        let spliced = splice(Arc::new(WmmaFp16Fp32::new()), &host, &matched).unwrap();
        let record = ScheduleParams::from_canonical(
            r#"{"split_K":1,"inline":false,"vectorize":4,"spatial_factors":[[4,1,4,1],[2,2,4,1]],"reduce_factors":[[8,2,2]],"last_factors":[[128,4,4]],"output_unroll_step":512,"last_unroll_step":64}"#,
        )
        .unwrap();
        replay(&spliced, &DeviceConfig::cuda(70), &record).unwrap()
    }

    #[test]
    fn test_occupancy_scales_with_sm_count() {
        let sch = schedule();
        let blocks = sch
            .bindings()
            .iter()
            .filter(|b| b.tag == ThreadTag::BlockX)
            .map(|b| b.extent)
            .max()
            .unwrap();

        let mut exact = DeviceConfig::cuda(70);
        exact.num_sms = blocks;
        let mut wide = exact.clone();
        wide.num_sms = blocks * 2;

        let full = occupancy(&sch, &exact);
        assert!(full > 0.0);
        assert_eq!(occupancy(&sch, &wide) * 2.0, full);
    }

    #[test]
    fn test_occupancy_follows_arch() {
        let sch = schedule();
        let v100 = occupancy(&sch, &DeviceConfig::cuda(70));
        let a100 = occupancy(&sch, &DeviceConfig::cuda(80));
        assert!(a100 <= v100);
    }
}
