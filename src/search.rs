//! Schedule search
//!
//! [`ScheduleGenerator`] composes one parameter generator per knob of a
//! [`ScheduleParams`] record. [`SearchDriver`] draws records from it,
//! gates them on device limits, applies them and feeds the oracle's score
//! back into the generators.

use std::collections::BTreeSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::applier::ScheduleApplier;
use crate::config::{SearchConfig, TilingConfig};
use crate::error::{TensorizeError, TensorizeResult};
use crate::generator::{ChoiceGenerator, Direction, ParamGenerator, SamplePolicy, SplitFactorGenerator};
use crate::hardware::DeviceConfig;
use crate::record::{ScheduleParams, TuningEntry};
use crate::schedule::Schedule;
use crate::splice::SplicedDag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    SplitK,
    Inline,
    Vectorize,
    Spatial(usize),
    Reduce(usize),
    Last(usize),
    UnrollOutput,
    UnrollLast,
}

fn walk<G: ParamGenerator>(
    generator: &G,
    value: &G::Value,
    direction: Direction,
    steps: usize,
    record: &ScheduleParams,
    set: impl Fn(&mut ScheduleParams, G::Value),
) -> Vec<ScheduleParams> {
    generator
        .mutate(value, direction, steps)
        .map(|v| {
            let mut next = record.clone();
            set(&mut next, v);
            next
        })
        .collect()
}

fn entry<'r>(lists: &'r [Vec<usize>], i: usize, what: &str) -> TensorizeResult<&'r Vec<usize>> {
    lists
        .get(i)
        .ok_or_else(|| TensorizeError::structural(what, format!("record has no factor list {}", i)))
}

/// Every knob of a schedule record, in record order:
/// `split_K, inline, vectorize, spatial.., reduce.., last.., output_unroll, last_unroll`
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleGenerator {
    device: DeviceConfig,
    split_k: ChoiceGenerator<usize>,
    inline: ChoiceGenerator<bool>,
    vectorize: ChoiceGenerator<usize>,
    spatial: Vec<SplitFactorGenerator>,
    reduce: Vec<SplitFactorGenerator>,
    last: Vec<SplitFactorGenerator>,
    unroll_output: ChoiceGenerator<usize>,
    unroll_last: ChoiceGenerator<usize>,
}

impl ScheduleGenerator {
    pub fn new(spliced: &SplicedDag, device: &DeviceConfig, tiling: &TilingConfig) -> TensorizeResult<Self> {
        let graph = &spliced.graph;

        let reserved: BTreeSet<usize> = spliced.stage.main_op_reserve_reduce_axis.iter().copied().collect();
        let reduce = graph
            .compute_of(spliced.main_op)?
            .reduce_axis
            .iter()
            .enumerate()
            .filter(|(i, _)| !reserved.contains(i))
            .map(|(_, iv)| SplitFactorGenerator::new(iv.extent, tiling.reduce_tiling))
            .collect::<TensorizeResult<Vec<_>>>()?;

        let output_axis = &graph.compute_of(spliced.output_op)?.axis;
        let reserve = spliced.stage.reserve_count(spliced.output_op)?;
        let output_name = &graph.op(spliced.output_op)?.name;
        let tiled = output_axis
            .len()
            .checked_sub(reserve)
            .ok_or_else(|| TensorizeError::structural(output_name, "fewer axes than the instruction reserves"))?;
        let spatial = output_axis[..tiled]
            .iter()
            .map(|iv| SplitFactorGenerator::new(iv.extent, tiling.spatial_tiling))
            .collect::<TensorizeResult<Vec<_>>>()?;

        let points: usize = graph.compute_of(spliced.last_op)?.axis.iter().map(|iv| iv.extent).product();
        let last = vec![SplitFactorGenerator::new(
            points.div_ceil(device.warp_size.max(1)),
            tiling.last_tiling,
        )?];

        let generator = Self {
            device: device.clone(),
            split_k: ChoiceGenerator::<usize>::split_k(&tiling.split_k_candidates)?,
            inline: ChoiceGenerator::<bool>::inline(),
            vectorize: ChoiceGenerator::<usize>::vectorize_length(device, spliced.main_input_dtype()?)?,
            spatial,
            reduce,
            last,
            unroll_output: ChoiceGenerator::<usize>::unroll_steps(&tiling.unroll_candidates)?,
            unroll_last: ChoiceGenerator::<usize>::unroll_steps(&tiling.unroll_candidates)?,
        };
        debug!(
            generators = generator.num_generators(),
            spatial = generator.spatial.len(),
            reduce = generator.reduce.len(),
            "built schedule generator"
        );
        Ok(generator)
    }

    pub fn num_generators(&self) -> usize {
        5 + self.spatial.len() + self.reduce.len() + self.last.len()
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    fn slot(&self, index: usize) -> TensorizeResult<Slot> {
        let (s, r, l) = (self.spatial.len(), self.reduce.len(), self.last.len());
        let slot = match index {
            0 => Slot::SplitK,
            1 => Slot::Inline,
            2 => Slot::Vectorize,
            i if i < 3 + s => Slot::Spatial(i - 3),
            i if i < 3 + s + r => Slot::Reduce(i - 3 - s),
            i if i < 3 + s + r + l => Slot::Last(i - 3 - s - r),
            i if i == 3 + s + r + l => Slot::UnrollOutput,
            i if i == 4 + s + r + l => Slot::UnrollLast,
            _ => {
                return Err(TensorizeError::structural(
                    "schedule generator",
                    format!("no generator {} of {}", index, self.num_generators()),
                ))
            }
        };
        Ok(slot)
    }

    pub fn sample<R: Rng + ?Sized>(&self, policy: SamplePolicy, rng: &mut R, temperature: f64) -> ScheduleParams {
        ScheduleParams {
            split_k: self.split_k.sample(policy, rng, temperature),
            inline: self.inline.sample(policy, rng, temperature),
            vectorize: self.vectorize.sample(policy, rng, temperature),
            spatial_factors: self.spatial.iter().map(|g| g.sample(policy, rng, temperature)).collect(),
            reduce_factors: self.reduce.iter().map(|g| g.sample(policy, rng, temperature)).collect(),
            last_factors: self.last.iter().map(|g| g.sample(policy, rng, temperature)).collect(),
            output_unroll_step: self.unroll_output.sample(policy, rng, temperature),
            last_unroll_step: self.unroll_last.sample(policy, rng, temperature),
        }
    }

    /// Every knob resampled among its current value and direct neighbours
    pub fn sample_near<R: Rng + ?Sized>(&self, record: &ScheduleParams, rng: &mut R, temperature: f64) -> ScheduleParams {
        fn near_all<R: Rng + ?Sized>(
            gens: &[SplitFactorGenerator],
            hints: &[Vec<usize>],
            rng: &mut R,
            temperature: f64,
        ) -> Vec<Vec<usize>> {
            gens.iter()
                .enumerate()
                .map(|(i, g)| match hints.get(i) {
                    Some(h) => g.sample_near(h, rng, temperature),
                    None => g.sample(SamplePolicy::Softmax, rng, temperature),
                })
                .collect()
        }
        ScheduleParams {
            split_k: self.split_k.sample_near(&record.split_k, rng, temperature),
            inline: self.inline.sample_near(&record.inline, rng, temperature),
            vectorize: self.vectorize.sample_near(&record.vectorize, rng, temperature),
            spatial_factors: near_all(&self.spatial, &record.spatial_factors, rng, temperature),
            reduce_factors: near_all(&self.reduce, &record.reduce_factors, rng, temperature),
            last_factors: near_all(&self.last, &record.last_factors, rng, temperature),
            output_unroll_step: self.unroll_output.sample_near(&record.output_unroll_step, rng, temperature),
            last_unroll_step: self.unroll_last.sample_near(&record.last_unroll_step, rng, temperature),
        }
    }

    pub fn directions_of(&self, index: usize) -> TensorizeResult<Vec<Direction>> {
        Ok(match self.slot(index)? {
            Slot::SplitK => self.split_k.directions(),
            Slot::Inline => self.inline.directions(),
            Slot::Vectorize => self.vectorize.directions(),
            Slot::Spatial(i) => self.spatial[i].directions(),
            Slot::Reduce(i) => self.reduce[i].directions(),
            Slot::Last(i) => self.last[i].directions(),
            Slot::UnrollOutput => self.unroll_output.directions(),
            Slot::UnrollLast => self.unroll_last.directions(),
        })
    }

    /// Up to `steps` records that differ from `record` only in generator
    /// `index`, walking `direction`
    pub fn mutate_one_generator(
        &self,
        record: &ScheduleParams,
        index: usize,
        direction: Direction,
        steps: usize,
    ) -> TensorizeResult<Vec<ScheduleParams>> {
        let out = match self.slot(index)? {
            Slot::SplitK => walk(&self.split_k, &record.split_k, direction, steps, record, |r, v| r.split_k = v),
            Slot::Inline => walk(&self.inline, &record.inline, direction, steps, record, |r, v| r.inline = v),
            Slot::Vectorize => walk(&self.vectorize, &record.vectorize, direction, steps, record, |r, v| {
                r.vectorize = v
            }),
            Slot::Spatial(i) => {
                let value = entry(&record.spatial_factors, i, "spatial_factors")?;
                walk(&self.spatial[i], value, direction, steps, record, |r, v| r.spatial_factors[i] = v)
            }
            Slot::Reduce(i) => {
                let value = entry(&record.reduce_factors, i, "reduce_factors")?;
                walk(&self.reduce[i], value, direction, steps, record, |r, v| r.reduce_factors[i] = v)
            }
            Slot::Last(i) => {
                let value = entry(&record.last_factors, i, "last_factors")?;
                walk(&self.last[i], value, direction, steps, record, |r, v| r.last_factors[i] = v)
            }
            Slot::UnrollOutput => walk(
                &self.unroll_output,
                &record.output_unroll_step,
                direction,
                steps,
                record,
                |r, v| r.output_unroll_step = v,
            ),
            Slot::UnrollLast => walk(
                &self.unroll_last,
                &record.last_unroll_step,
                direction,
                steps,
                record,
                |r, v| r.last_unroll_step = v,
            ),
        };
        Ok(out)
    }

    pub fn feedback(&mut self, record: &ScheduleParams, score: f64) {
        self.split_k.feedback(&record.split_k, score);
        self.inline.feedback(&record.inline, score);
        self.vectorize.feedback(&record.vectorize, score);
        for (g, v) in self.spatial.iter_mut().zip(&record.spatial_factors) {
            g.feedback(v, score);
        }
        for (g, v) in self.reduce.iter_mut().zip(&record.reduce_factors) {
            g.feedback(v, score);
        }
        for (g, v) in self.last.iter_mut().zip(&record.last_factors) {
            g.feedback(v, score);
        }
        self.unroll_output.feedback(&record.output_unroll_step, score);
        self.unroll_last.feedback(&record.last_unroll_step, score);
    }

    /// Reject records exceeding device launch limits
    pub fn check_legality(&self, record: &ScheduleParams) -> TensorizeResult<()> {
        let max_warps = self.device.max_warps();
        let checks = [
            ("blocks", record.block_count()?, self.device.max_blocks),
            ("warps", record.warp_count()?, max_warps),
            ("terminal warps", record.last_warp_count()?, max_warps),
            ("terminal blocks", record.last_block_count()?, self.device.max_blocks),
        ];
        for (limit, value, max) in checks {
            if value > max {
                return Err(TensorizeError::legality(limit, value, max));
            }
        }
        Ok(())
    }

    pub fn valid(&self, record: &ScheduleParams) -> bool {
        self.check_legality(record).is_ok()
    }
}

/// Scores a schedule; higher is better, non-positive means the build failed
pub trait PerformanceOracle {
    fn measure(&mut self, schedule: &Schedule) -> f64;
}

impl<F> PerformanceOracle for F
where
    F: FnMut(&Schedule) -> f64,
{
    fn measure(&mut self, schedule: &Schedule) -> f64 {
        self(schedule)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchReport {
    pub best: Option<TuningEntry>,
    /// Best entries first
    pub top: Vec<TuningEntry>,
    pub trials: usize,
    pub measured: usize,
    pub failed: usize,
    /// Illegal records
    pub rejected: usize,
    /// Trials that found nothing new within the attempt budget
    pub repeated: usize,
}

pub struct SearchDriver<'a> {
    applier: ScheduleApplier<'a>,
    generator: ScheduleGenerator,
    config: SearchConfig,
    rng: ChaCha20Rng,
    seen: BTreeSet<String>,
    top: Vec<TuningEntry>,
    best_score: f64,
}

impl<'a> SearchDriver<'a> {
    pub fn new(
        spliced: &'a SplicedDag,
        device: &DeviceConfig,
        tiling: &TilingConfig,
        config: SearchConfig,
    ) -> TensorizeResult<Self> {
        Ok(Self {
            applier: ScheduleApplier::new(spliced, device),
            generator: ScheduleGenerator::new(spliced, device, tiling)?,
            rng: ChaCha20Rng::seed_from_u64(config.seed),
            config,
            seen: BTreeSet::new(),
            top: Vec::new(),
            best_score: 0.0,
        })
    }

    pub fn generator(&self) -> &ScheduleGenerator {
        &self.generator
    }

    pub fn top(&self) -> &[TuningEntry] {
        &self.top
    }

    pub fn run<O: PerformanceOracle + ?Sized>(&mut self, oracle: &mut O) -> TensorizeResult<SearchReport> {
        let mut report = SearchReport {
            trials: self.config.trials,
            ..SearchReport::default()
        };
        for trial in 0..self.config.trials {
            let Some(record) = self.propose(trial)? else {
                report.repeated += 1;
                continue;
            };
            match self.generator.check_legality(&record) {
                Ok(()) => {}
                Err(e) if e.is_legality() => {
                    debug!(trial, error = %e, "rejected record");
                    report.rejected += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let schedule = self.applier.apply(&record)?;
            let score = oracle.measure(&schedule);
            report.measured += 1;
            if score.is_nan() || score <= 0.0 {
                debug!(trial, score, "build failed");
                report.failed += 1;
                self.generator.feedback(&record, 0.0);
                continue;
            }
            if score > self.best_score {
                self.best_score = score;
                info!(trial, score, record = %record, "new best");
            }
            self.generator.feedback(&record, score / self.best_score);
            self.keep(TuningEntry::new(record, score));
        }
        report.best = self.top.first().cloned();
        report.top = self.top.clone();
        Ok(report)
    }

    fn keep(&mut self, entry: TuningEntry) {
        let pos = self.top.partition_point(|e| e.score >= entry.score);
        self.top.insert(pos, entry);
        self.top.truncate(self.config.topk.max(1));
    }

    /// A record not seen before, or `None` once the attempt budget is spent
    fn propose(&mut self, trial: usize) -> TensorizeResult<Option<ScheduleParams>> {
        let temperature = self.config.softmax_temperature;
        for _ in 0..self.config.max_attempts_per_trial.max(1) {
            let exploit = trial >= self.config.warm_up_trials
                && !self.top.is_empty()
                && self.rng.gen::<f64>() < self.config.eps;
            let candidate = if exploit {
                self.exploit()?
            } else {
                self.generator.sample(SamplePolicy::Softmax, &mut self.rng, temperature)
            };
            if self.seen.insert(candidate.to_canonical()?) {
                return Ok(Some(candidate));
            }
            debug!(trial, "repeated candidate");
        }
        Ok(None)
    }

    /// Seed from the top entries and take one random generator step
    fn exploit(&mut self) -> TensorizeResult<ScheduleParams> {
        let temperature = self.config.softmax_temperature;
        let seed = self.pick_seed();
        let near = self.generator.sample_near(&seed, &mut self.rng, temperature);
        let index = self.rng.gen_range(0..self.generator.num_generators());
        let directions = self.generator.directions_of(index)?;
        if directions.is_empty() {
            return Ok(near);
        }
        let direction = directions[self.rng.gen_range(0..directions.len())];
        let mut walked = self
            .generator
            .mutate_one_generator(&near, index, direction, self.config.mutate_steps)?;
        Ok(walked.pop().unwrap_or(near))
    }

    fn pick_seed(&mut self) -> ScheduleParams {
        let best = self.best_score.max(f64::MIN_POSITIVE);
        for e in &self.top {
            if self.rng.gen::<f64>() < (e.score / best - 1.0).exp() {
                return e.record.clone();
            }
        }
        self.top
            .first()
            .map(|e| e.record.clone())
            .unwrap_or_else(|| self.generator.sample(SamplePolicy::Greedy, &mut self.rng, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::graph::gemm_bias;
    use crate::splice::splice;
    use crate::transform::IntrinMatch;
    use crate::wmma::WmmaFp16Fp32;

    fn spliced() -> SplicedDag {
        let host = gemm_bias(64, 64, 128).unwrap();
        let gemm = host.find_op("gemm").unwrap();
        splice(
            Arc::new(WmmaFp16Fp32::new()),
            &host,
            &IntrinMatch::matmul("nnn", "16x16x16", gemm),
        )
        .unwrap()
    }

    fn generator(s: &SplicedDag) -> ScheduleGenerator {
        ScheduleGenerator::new(s, &DeviceConfig::cuda(70), &TilingConfig::default()).unwrap()
    }

    #[test]
    fn test_generator_layout() {
        let s = spliced();
        let g = generator(&s);
        // two spatial, one reduce, one terminal
        assert_eq!(g.num_generators(), 9);
        assert!(g.directions_of(9).is_err());
        assert_eq!(g.directions_of(0).unwrap(), vec![Direction::Up, Direction::Down]);
        assert_eq!(g.directions_of(3).unwrap().len(), 12);
    }

    #[test]
    fn test_sample_shapes() {
        let s = spliced();
        let g = generator(&s);
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let r = g.sample(SamplePolicy::Random, &mut rng, 1.0);
        assert_eq!(r.spatial_factors.len(), 2);
        assert!(r.spatial_factors.iter().all(|f| f.len() == 4 && f.iter().product::<usize>() == 4));
        assert_eq!(r.reduce_factors, vec![r.reduce_factors[0].clone()]);
        assert_eq!(r.reduce_factors[0].iter().product::<usize>(), 8);
        assert_eq!(r.last_factors[0].iter().product::<usize>(), 128);
        assert!([1, 2, 4, 8].contains(&r.vectorize));
    }

    #[test]
    fn test_mutate_touches_one_knob() {
        let s = spliced();
        let g = generator(&s);
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let mut r = g.sample(SamplePolicy::Random, &mut rng, 1.0);
        r.reduce_factors = vec![vec![8, 1, 1]];
        let out = g
            .mutate_one_generator(&r, 5, Direction::Move { from: 0, to: 2 }, 5)
            .unwrap();
        let walked: Vec<Vec<usize>> = out.iter().map(|x| x.reduce_factors[0].clone()).collect();
        assert_eq!(walked, vec![vec![4, 1, 2], vec![2, 1, 4], vec![1, 1, 8]]);
        assert!(out.iter().all(|x| x.spatial_factors == r.spatial_factors && x.split_k == r.split_k));
    }

    #[test]
    fn test_legality_gate() {
        let s = spliced();
        let mut device = DeviceConfig::cuda(70);
        device.max_threads_per_block = 64;
        let g = ScheduleGenerator::new(&s, &device, &TilingConfig::default()).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let mut r = g.sample(SamplePolicy::Random, &mut rng, 1.0);
        r.split_k = 4;
        r.last_factors = vec![vec![128, 1, 1]];
        assert!(matches!(
            g.check_legality(&r),
            Err(TensorizeError::Legality { limit: "warps", value: 4, max: 2 })
        ));
        r.split_k = 2;
        assert!(g.valid(&r));
    }

    #[test]
    fn test_search_is_reproducible() {
        let s = spliced();
        let device = DeviceConfig::cuda(70);
        let run = |seed| {
            let mut driver =
                SearchDriver::new(&s, &device, &TilingConfig::default(), SearchConfig::new(12, seed)).unwrap();
            let mut oracle = |sch: &Schedule| sch.bindings().len() as f64;
            driver.run(&mut oracle).unwrap()
        };
        let a = run(11);
        let b = run(11);
        assert_eq!(a, b);
        assert_eq!(a.measured + a.rejected + a.repeated, 12);
        assert!(a.best.is_some());
        let scores: Vec<f64> = a.top.iter().map(|e| e.score).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_illegal_records_leave_generators_untouched() {
        let s = spliced();
        let mut device = DeviceConfig::cuda(70);
        // every record launches at least one block
        device.max_blocks = 0;
        let fresh = ScheduleGenerator::new(&s, &device, &TilingConfig::default()).unwrap();
        let mut driver = SearchDriver::new(&s, &device, &TilingConfig::default(), SearchConfig::new(10, 4)).unwrap();

        let mut calls = 0;
        let mut oracle = |_: &Schedule| {
            calls += 1;
            1.0
        };
        let report = driver.run(&mut oracle).unwrap();
        assert_eq!(calls, 0);
        assert_eq!(report.rejected, 10);
        assert_eq!(report.measured, 0);
        assert!(report.best.is_none());

        assert_eq!(driver.generator(), &fresh);
        let mut a = ChaCha20Rng::seed_from_u64(0);
        let mut b = ChaCha20Rng::seed_from_u64(0);
        assert_eq!(
            driver.generator().sample(SamplePolicy::Greedy, &mut a, 1.0),
            fresh.sample(SamplePolicy::Greedy, &mut b, 1.0)
        );
    }

    #[test]
    fn test_failed_builds_are_not_kept() {
        let s = spliced();
        let mut driver = SearchDriver::new(
            &s,
            &DeviceConfig::cuda(70),
            &TilingConfig::default(),
            SearchConfig::new(5, 2),
        )
        .unwrap();
        let mut oracle = |_: &Schedule| 0.0;
        let report = driver.run(&mut oracle).unwrap();
        assert_eq!(report.failed, report.measured);
        assert!(report.best.is_none());
        assert!(driver.top().is_empty());
    }
}
