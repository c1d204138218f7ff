//! Schedule parameter generators
//!
//! Each generator owns a fixed list of choices and a score table biasing
//! future samples towards choices that scored well. Values are explored
//! either by sampling, by sampling near a known value, or by walking a
//! direction with [`ParamGenerator::mutate`].

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{TensorizeError, TensorizeResult};
use crate::expr::DType;
use crate::hardware::DeviceConfig;

/// Score every choice starts with
pub const INITIAL_SCORE: f64 = 0.5;
/// Weight of a new observation in the moving average
const SCORE_MOMENTUM: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplePolicy {
    /// Proportional to the prior weight only
    Random,
    /// Proportional to `weight * exp(score / temperature)`
    Softmax,
    /// Best score, first choice on ties
    Greedy,
}

/// A way to step from one value to a neighbouring one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    /// Move one prime factor from part `from` to part `to`
    Move { from: usize, to: usize },
}

/// Prior weight and running score of each choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTable {
    weights: Vec<f64>,
    scores: Vec<f64>,
}

impl ScoreTable {
    pub fn new(weights: Vec<f64>) -> Self {
        let scores = vec![INITIAL_SCORE; weights.len()];
        Self { weights, scores }
    }

    pub fn uniform(len: usize) -> Self {
        Self::new(vec![1.0; len])
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn score(&self, index: usize) -> Option<f64> {
        self.scores.get(index).copied()
    }

    /// Fold an observation into the moving average of `index`
    pub fn update(&mut self, index: usize, score: f64) {
        if let Some(s) = self.scores.get_mut(index) {
            *s = (1.0 - SCORE_MOMENTUM) * *s + SCORE_MOMENTUM * score;
        }
    }

    /// Sampling distribution over `indices`
    pub fn probabilities(&self, indices: &[usize], temperature: f64) -> Vec<f64> {
        let t = if temperature > 0.0 { temperature } else { 1.0 };
        let logits: Vec<f64> = indices
            .iter()
            .map(|&i| {
                let w = self.weights.get(i).copied().unwrap_or(0.0);
                let s = self.scores.get(i).copied().unwrap_or(INITIAL_SCORE);
                if w > 0.0 {
                    s / t + w.ln()
                } else {
                    f64::NEG_INFINITY
                }
            })
            .collect();
        softmax(&logits)
    }

    /// Pick one of `indices` under `policy`
    pub fn choose<R: Rng + ?Sized>(
        &self,
        indices: &[usize],
        policy: SamplePolicy,
        rng: &mut R,
        temperature: f64,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }
        let pos = match policy {
            SamplePolicy::Greedy => {
                let scores: Vec<f64> = indices
                    .iter()
                    .map(|&i| self.scores.get(i).copied().unwrap_or(f64::NEG_INFINITY))
                    .collect();
                argmax(&scores)
            }
            SamplePolicy::Random => {
                let weights: Vec<f64> = indices
                    .iter()
                    .map(|&i| self.weights.get(i).copied().unwrap_or(0.0))
                    .collect();
                let total: f64 = weights.iter().sum();
                let probs: Vec<f64> = if total > 0.0 {
                    weights.iter().map(|w| w / total).collect()
                } else {
                    vec![1.0 / indices.len() as f64; indices.len()]
                };
                sample_from_probs(&probs, rng)
            }
            SamplePolicy::Softmax => {
                let probs = self.probabilities(indices, temperature);
                sample_from_probs(&probs, rng)
            }
        };
        indices.get(pos).copied()
    }
}

pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return vec![1.0 / logits.len().max(1) as f64; logits.len()];
    }
    let exp: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}

fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    let mut best_val = f64::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

fn sample_from_probs<R: Rng + ?Sized>(probs: &[f64], rng: &mut R) -> usize {
    let uniform: f64 = rng.gen();
    let mut cumsum = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if cumsum > uniform {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

/// Common behaviour of every parameter generator
pub trait ParamGenerator {
    type Value: Clone + PartialEq + fmt::Debug;

    /// Every value this generator can produce
    fn choices(&self) -> &[Self::Value];

    fn table(&self) -> &ScoreTable;

    fn table_mut(&mut self) -> &mut ScoreTable;

    /// Directions `neighbor` understands
    fn directions(&self) -> Vec<Direction>;

    /// One step from `value`; `None` when the domain ends there
    fn neighbor(&self, value: &Self::Value, direction: Direction) -> Option<Self::Value>;

    fn index_of(&self, value: &Self::Value) -> Option<usize> {
        self.choices().iter().position(|c| c == value)
    }

    fn sample<R: Rng + ?Sized>(&self, policy: SamplePolicy, rng: &mut R, temperature: f64) -> Self::Value {
        let all: Vec<usize> = (0..self.choices().len()).collect();
        let index = self.table().choose(&all, policy, rng, temperature).unwrap_or(0);
        self.choices()[index].clone()
    }

    /// Sample among `hint` and its direct neighbours
    fn sample_near<R: Rng + ?Sized>(&self, hint: &Self::Value, rng: &mut R, temperature: f64) -> Self::Value {
        let Some(start) = self.index_of(hint) else {
            return self.sample(SamplePolicy::Softmax, rng, temperature);
        };
        let mut candidates = vec![start];
        for d in self.directions() {
            if let Some(i) = self.neighbor(hint, d).and_then(|v| self.index_of(&v)) {
                if !candidates.contains(&i) {
                    candidates.push(i);
                }
            }
        }
        let index = self
            .table()
            .choose(&candidates, SamplePolicy::Softmax, rng, temperature)
            .unwrap_or(start);
        self.choices()[index].clone()
    }

    /// Up to `steps` values reachable from `value` along `direction`
    fn mutate(&self, value: &Self::Value, direction: Direction, steps: usize) -> Mutation<'_, Self>
    where
        Self: Sized,
    {
        Mutation::new(self, value.clone(), direction, steps)
    }

    /// Record the score observed for `value`
    fn feedback(&mut self, value: &Self::Value, score: f64) {
        match self.index_of(value) {
            Some(i) => self.table_mut().update(i, score),
            None => warn!(value = ?value, "feedback for a value the generator never offers"),
        }
    }
}

/// Lazy walk along one direction. Finite, and restartable from its origin.
pub struct Mutation<'g, G: ParamGenerator> {
    generator: &'g G,
    origin: G::Value,
    current: G::Value,
    direction: Direction,
    steps: usize,
    taken: usize,
    exhausted: bool,
}

impl<'g, G: ParamGenerator> Mutation<'g, G> {
    fn new(generator: &'g G, origin: G::Value, direction: Direction, steps: usize) -> Self {
        Self {
            generator,
            current: origin.clone(),
            origin,
            direction,
            steps,
            taken: 0,
            exhausted: false,
        }
    }

    /// Start again from the original value
    pub fn restart(&mut self) {
        self.current = self.origin.clone();
        self.taken = 0;
        self.exhausted = false;
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted || self.taken >= self.steps
    }
}

impl<'g, G: ParamGenerator> Iterator for Mutation<'g, G> {
    type Item = G::Value;

    fn next(&mut self) -> Option<G::Value> {
        if self.is_exhausted() {
            return None;
        }
        match self.generator.neighbor(&self.current, self.direction) {
            Some(v) => {
                self.taken += 1;
                self.current = v.clone();
                Some(v)
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

/// Ordered factorizations of an extent into a fixed number of parts
#[derive(Debug, Clone, PartialEq)]
pub struct SplitFactorGenerator {
    extent: usize,
    parts: usize,
    choices: Vec<Vec<usize>>,
    table: ScoreTable,
}

impl SplitFactorGenerator {
    pub fn new(extent: usize, parts: usize) -> TensorizeResult<Self> {
        if extent == 0 || parts == 0 {
            return Err(TensorizeError::structural(
                "split generator",
                format!("cannot split extent {} into {} parts", extent, parts),
            ));
        }
        let choices = factorizations(extent, parts);
        let table = ScoreTable::uniform(choices.len());
        Ok(Self {
            extent,
            parts,
            choices,
            table,
        })
    }

    pub fn extent(&self) -> usize {
        self.extent
    }

    pub fn parts(&self) -> usize {
        self.parts
    }
}

fn divisors(n: usize) -> Vec<usize> {
    (1..=n).filter(|d| n % d == 0).collect()
}

/// All `parts`-tuples whose product is `n`, in lexicographic order
pub fn factorizations(n: usize, parts: usize) -> Vec<Vec<usize>> {
    if parts == 1 {
        return vec![vec![n]];
    }
    let mut out = Vec::new();
    for d in divisors(n) {
        for mut rest in factorizations(n / d, parts - 1) {
            rest.insert(0, d);
            out.push(rest);
        }
    }
    out
}

fn smallest_prime_factor(n: usize) -> Option<usize> {
    (2..=n).find(|p| n % p == 0)
}

impl ParamGenerator for SplitFactorGenerator {
    type Value = Vec<usize>;

    fn choices(&self) -> &[Vec<usize>] {
        &self.choices
    }

    fn table(&self) -> &ScoreTable {
        &self.table
    }

    fn table_mut(&mut self) -> &mut ScoreTable {
        &mut self.table
    }

    fn directions(&self) -> Vec<Direction> {
        let mut out = Vec::new();
        for from in 0..self.parts {
            for to in 0..self.parts {
                if from != to {
                    out.push(Direction::Move { from, to });
                }
            }
        }
        out
    }

    fn neighbor(&self, value: &Vec<usize>, direction: Direction) -> Option<Vec<usize>> {
        let Direction::Move { from, to } = direction else {
            return None;
        };
        if from == to || from >= value.len() || to >= value.len() {
            return None;
        }
        let p = smallest_prime_factor(value[from])?;
        let mut next = value.clone();
        next[from] /= p;
        next[to] *= p;
        Some(next)
    }
}

/// A generator over a fixed candidate list. Repeated candidates are merged
/// and their multiplicity becomes the prior weight.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceGenerator<T> {
    choices: Vec<T>,
    table: ScoreTable,
}

impl<T: Clone + PartialEq + fmt::Debug> ChoiceGenerator<T> {
    pub fn new(candidates: &[T]) -> TensorizeResult<Self> {
        let mut choices: Vec<T> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        for c in candidates {
            match choices.iter().position(|x| x == c) {
                Some(i) => weights[i] += 1.0,
                None => {
                    choices.push(c.clone());
                    weights.push(1.0);
                }
            }
        }
        if choices.is_empty() {
            return Err(TensorizeError::structural("choice generator", "empty candidate list"));
        }
        Ok(Self {
            choices,
            table: ScoreTable::new(weights),
        })
    }
}

impl ChoiceGenerator<bool> {
    pub fn inline() -> Self {
        Self {
            choices: vec![false, true],
            table: ScoreTable::uniform(2),
        }
    }
}

impl ChoiceGenerator<usize> {
    pub fn split_k(candidates: &[usize]) -> TensorizeResult<Self> {
        Self::new(candidates)
    }

    pub fn unroll_steps(candidates: &[usize]) -> TensorizeResult<Self> {
        Self::new(candidates)
    }

    /// Vector lengths whose width fits one load of `dtype` elements
    pub fn vectorize_length(device: &DeviceConfig, dtype: DType) -> TensorizeResult<Self> {
        Self::new(&device.vector_lengths(dtype))
    }
}

impl<T: Clone + PartialEq + fmt::Debug> ParamGenerator for ChoiceGenerator<T> {
    type Value = T;

    fn choices(&self) -> &[T] {
        &self.choices
    }

    fn table(&self) -> &ScoreTable {
        &self.table
    }

    fn table_mut(&mut self) -> &mut ScoreTable {
        &mut self.table
    }

    fn directions(&self) -> Vec<Direction> {
        vec![Direction::Up, Direction::Down]
    }

    fn neighbor(&self, value: &T, direction: Direction) -> Option<T> {
        let i = self.index_of(value)?;
        let j = match direction {
            Direction::Up => i + 1,
            Direction::Down => i.checked_sub(1)?,
            Direction::Move { .. } => return None,
        };
        self.choices.get(j).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_factorizations() {
        let f = factorizations(12, 2);
        assert_eq!(
            f,
            vec![vec![1, 12], vec![2, 6], vec![3, 4], vec![4, 3], vec![6, 2], vec![12, 1]]
        );
        // 64 = 2^6 into three parts: C(8, 2)
        assert_eq!(factorizations(64, 3).len(), 28);
        assert!(factorizations(64, 3).iter().all(|v| v.iter().product::<usize>() == 64));
    }

    #[test]
    fn test_split_move_neighbor() {
        let g = SplitFactorGenerator::new(64, 3).unwrap();
        let v = vec![4, 4, 4];
        assert_eq!(g.neighbor(&v, Direction::Move { from: 0, to: 2 }), Some(vec![2, 4, 8]));
        assert_eq!(g.neighbor(&vec![1, 8, 8], Direction::Move { from: 0, to: 1 }), None);
        assert_eq!(g.neighbor(&v, Direction::Up), None);
        assert_eq!(g.directions().len(), 6);
    }

    #[test]
    fn test_mutation_is_finite_and_restartable() {
        let g = SplitFactorGenerator::new(8, 2).unwrap();
        let mut m = g.mutate(&vec![8, 1], Direction::Move { from: 0, to: 1 }, 5);
        let walked: Vec<Vec<usize>> = m.by_ref().collect();
        assert_eq!(walked, vec![vec![4, 2], vec![2, 4], vec![1, 8]]);
        assert!(m.is_exhausted());
        assert_eq!(m.next(), None);
        m.restart();
        assert_eq!(m.next(), Some(vec![4, 2]));
    }

    #[test]
    fn test_mutation_respects_step_count() {
        let g = ChoiceGenerator::<usize>::unroll_steps(&[16, 64, 512, 1500]).unwrap();
        let walked: Vec<usize> = g.mutate(&16, Direction::Up, 2).collect();
        assert_eq!(walked, vec![64, 512]);
        assert_eq!(g.mutate(&16, Direction::Down, 3).count(), 0);
    }

    #[test]
    fn test_duplicates_become_weights() {
        let g = ChoiceGenerator::<usize>::split_k(&[1, 4, 4, 8, 8, 16, 16]).unwrap();
        assert_eq!(g.choices(), &[1, 4, 8, 16]);
        let p = g.table().probabilities(&[0, 1, 2, 3], 1.0);
        assert!((p[1] / p[0] - 2.0).abs() < 1e-9);
        assert!(ChoiceGenerator::<usize>::new(&[]).is_err());
    }

    #[test]
    fn test_vectorize_lengths() {
        let g = ChoiceGenerator::<usize>::vectorize_length(&DeviceConfig::cuda(70), DType::F16).unwrap();
        assert_eq!(g.choices(), &[1, 2, 4, 8]);
    }

    #[test]
    fn test_feedback_biases_greedy() {
        let mut g = ChoiceGenerator::<bool>::inline();
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        assert_eq!(g.sample(SamplePolicy::Greedy, &mut rng, 0.2), false);
        g.feedback(&true, 1.0);
        assert_eq!(g.sample(SamplePolicy::Greedy, &mut rng, 0.2), true);
        assert!((g.table().score(1).unwrap() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_sample_near_stays_close() {
        let g = ChoiceGenerator::<usize>::unroll_steps(&[16, 64, 512, 1500]).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        for _ in 0..50 {
            let v = g.sample_near(&16, &mut rng, 0.2);
            assert!(v == 16 || v == 64);
        }
    }

    #[test]
    fn test_sampling_is_seeded() {
        let g = SplitFactorGenerator::new(256, 4).unwrap();
        let draw = |seed| {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            (0..10)
                .map(|_| g.sample(SamplePolicy::Softmax, &mut rng, 0.2))
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(11), draw(11));
        assert!(draw(11).iter().all(|v| v.iter().product::<usize>() == 256));
    }
}
