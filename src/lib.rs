//! Automatic tensorization for fixed-function matrix units
//!
//! This library describes a hardware matrix unit as a small dataflow graph of
//! instructions (load, compute, store), splices that graph into a host
//! computation around a matched main operator, and searches a space of tiling
//! and placement parameters for a good loop schedule of the result.
//!
//! # Example
//!
//! ```rust
//! use auto_tensorize::{gemm_bias, prepare, tune, DeviceConfig, IntrinMatch, Schedule};
//! use auto_tensorize::{HwAbsDagRegistry, SearchConfig, TilingConfig};
//!
//! let host = gemm_bias(64, 64, 64).unwrap();
//! let gemm = host.find_op("gemm").unwrap();
//! let matched = IntrinMatch::matmul("nnn", "16x16x16", gemm);
//! let registry = HwAbsDagRegistry::global().unwrap();
//! let spliced = prepare(registry, &host, "cuda", "wmma_fp16_fp32", &matched).unwrap();
//!
//! let mut oracle = |sch: &Schedule| sch.bindings().len() as f64;
//! let report = tune(
//!     &spliced,
//!     &DeviceConfig::cuda(70),
//!     &TilingConfig::default(),
//!     SearchConfig::new(8, 0),
//!     &mut oracle,
//! )
//! .unwrap();
//! println!("{:?}", report.best);
//! ```

pub mod applier;
pub mod capability;
pub mod config;
pub mod error;
pub mod expr;
pub mod generator;
pub mod graph;
pub mod hardware;
pub mod record;
pub mod registry;
pub mod schedule;
pub mod search;
pub mod splice;
pub mod stage;
pub mod transform;
pub mod wmma;

use std::sync::Arc;

use tracing::debug;

pub use applier::{Primitive, ScheduleApplier, ScheduleState, PIPELINE};
pub use capability::{CapabilityClass, CapabilityGraph, HwAbsDag, Intrinsic, NodeExpression};
pub use config::{SearchConfig, TilingConfig};
pub use error::{TensorizeError, TensorizeResult};
pub use expr::{AxisRef, DType, Expr, IterKind, TensorId};
pub use generator::{ChoiceGenerator, Direction, ParamGenerator, SamplePolicy, SplitFactorGenerator};
pub use graph::{gemm_bias, ComputeGraph, IterVar, OpId};
pub use hardware::{DeviceConfig, InstructionScope, MemoryScope, ThreadTag};
pub use record::{ScheduleParams, TuningEntry};
pub use registry::{HwAbsDagRegistry, HW_ABS_DAG_REGISTRY};
pub use schedule::{AxisId, Schedule, StageId};
pub use search::{PerformanceOracle, ScheduleGenerator, SearchDriver, SearchReport};
pub use splice::{splice, SplicedDag};
pub use stage::{HwAbsDagStage, OperationRole};
pub use transform::IntrinMatch;

/// Look up a hardware unit and splice it into `host` around the matched
/// main operator
pub fn prepare(
    registry: &HwAbsDagRegistry,
    host: &ComputeGraph,
    target: &str,
    mnemonic: &str,
    matched: &IntrinMatch,
) -> TensorizeResult<SplicedDag> {
    let dag: Arc<dyn HwAbsDag> = Arc::from(registry.instantiate(target, mnemonic)?);
    let spliced = splice(dag, host, matched)?;
    debug!(target_name = target, mnemonic, ops = spliced.graph.len(), "prepared host graph");
    Ok(spliced)
}

/// Search for the best schedule of a spliced graph
pub fn tune<O: PerformanceOracle + ?Sized>(
    spliced: &SplicedDag,
    device: &DeviceConfig,
    tiling: &TilingConfig,
    search: SearchConfig,
    oracle: &mut O,
) -> TensorizeResult<SearchReport> {
    let mut driver = SearchDriver::new(spliced, device, tiling, search)?;
    driver.run(oracle)
}

/// Rebuild the schedule a record describes, e.g. from a tuning log line
pub fn replay(spliced: &SplicedDag, device: &DeviceConfig, record: &ScheduleParams) -> TensorizeResult<Schedule> {
    ScheduleApplier::new(spliced, device).apply(record)
}
