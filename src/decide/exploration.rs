//! Choosing among mutually indifferent candidates.
//!
//! Randomness comes from a seeded [`StdRng`]. The number of draws is tracked
//! so a restored agent can fast-forward its generator to the exact point it
//! was saved at.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::symbol::Sym;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExplorationPolicy {
    /// Sample with probability proportional to `exp(value / temperature)`.
    Boltzmann,
    /// Best value, except with probability epsilon a uniform pick.
    EpsilonGreedy,
    /// Sample with probability proportional to the (non-negative) value.
    SoftMax,
    /// Always the first candidate in canonical order.
    First,
    /// Always the last candidate in canonical order.
    Last,
}

/// How several numeric-indifferent preferences for one value combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NumericMode {
    Sum,
    Avg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExplorationConfig {
    /// Default: epsilon-greedy.
    pub policy: ExplorationPolicy,
    /// Default: 0.1.
    pub epsilon: f64,
    /// Default: 25.0.
    pub temperature: f64,
    /// Default: sum.
    pub numeric: NumericMode,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            policy: ExplorationPolicy::EpsilonGreedy,
            epsilon: 0.1,
            temperature: 25.0,
            numeric: NumericMode::Sum,
        }
    }
}

/// Seeded generator with a replayable position.
#[derive(Debug, Clone)]
pub struct AgentRng {
    seed: u64,
    draws: u64,
    rng: StdRng,
}

/// Serializable position of an [`AgentRng`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    pub seed: u64,
    pub draws: u64,
}

impl AgentRng {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            draws: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn state(&self) -> RngState {
        RngState {
            seed: self.seed,
            draws: self.draws,
        }
    }

    pub fn restore(state: RngState) -> Self {
        let mut rng = Self::new(state.seed);
        for _ in 0..state.draws {
            rng.next_u64();
        }
        rng
    }

    pub fn next_u64(&mut self) -> u64 {
        self.draws += 1;
        self.rng.next_u64()
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }

    /// Index drawn with probability proportional to `weights`.
    fn sample(&mut self, weights: &[f64]) -> usize {
        let total: f64 = weights.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            return self.below(weights.len());
        }
        let mut r = self.next_f64() * total;
        for (i, w) in weights.iter().enumerate() {
            if r < *w {
                return i;
            }
            r -= w;
        }
        weights.len() - 1
    }
}

/// Pick one of `candidates` (already in canonical order, non-empty) given
/// each one's combined numeric value.
pub fn choose(candidates: &[(Sym, f64)], config: &ExplorationConfig, rng: &mut AgentRng) -> Option<Sym> {
    let (first, last) = (candidates.first()?, candidates.last()?);
    if candidates.len() == 1 {
        return Some(first.0);
    }
    let index = match config.policy {
        ExplorationPolicy::First => return Some(first.0),
        ExplorationPolicy::Last => return Some(last.0),
        ExplorationPolicy::EpsilonGreedy => {
            if rng.next_f64() < config.epsilon {
                rng.below(candidates.len())
            } else {
                best_index(candidates)
            }
        }
        ExplorationPolicy::Boltzmann => {
            let t = if config.temperature > 0.0 {
                config.temperature
            } else {
                1.0
            };
            let max = candidates
                .iter()
                .map(|c| c.1)
                .fold(f64::NEG_INFINITY, f64::max);
            let weights: Vec<f64> = candidates.iter().map(|c| ((c.1 - max) / t).exp()).collect();
            rng.sample(&weights)
        }
        ExplorationPolicy::SoftMax => {
            let weights: Vec<f64> = candidates.iter().map(|c| c.1.max(0.0)).collect();
            rng.sample(&weights)
        }
    };
    candidates.get(index).map(|c| c.0)
}

fn best_index(candidates: &[(Sym, f64)]) -> usize {
    let mut best = 0;
    for (i, c) in candidates.iter().enumerate() {
        if c.1 > candidates[best].1 {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolTable;

    fn candidates() -> Vec<(Sym, f64)> {
        let mut s = SymbolTable::new();
        vec![(s.string("a"), 0.0), (s.string("b"), 5.0), (s.string("c"), 1.0)]
    }

    #[test]
    fn greedy_without_exploration_takes_best() {
        let c = candidates();
        let cfg = ExplorationConfig {
            epsilon: 0.0,
            ..Default::default()
        };
        let mut rng = AgentRng::new(1);
        assert_eq!(choose(&c, &cfg, &mut rng), Some(c[1].0));
    }

    #[test]
    fn first_and_last_do_not_draw() {
        let c = candidates();
        let mut rng = AgentRng::new(1);
        for (policy, want) in [(ExplorationPolicy::First, c[0].0), (ExplorationPolicy::Last, c[2].0)] {
            let cfg = ExplorationConfig {
                policy,
                ..Default::default()
            };
            assert_eq!(choose(&c, &cfg, &mut rng), Some(want));
        }
        assert_eq!(rng.state().draws, 0);
    }

    #[test]
    fn same_seed_same_choices_and_restore_resumes() {
        let c = candidates();
        let cfg = ExplorationConfig {
            policy: ExplorationPolicy::Boltzmann,
            temperature: 1.0,
            ..Default::default()
        };
        let mut a = AgentRng::new(9);
        let mut b = AgentRng::new(9);
        let xs: Vec<_> = (0..20).map(|_| choose(&c, &cfg, &mut a)).collect();
        let ys: Vec<_> = (0..20).map(|_| choose(&c, &cfg, &mut b)).collect();
        assert_eq!(xs, ys);

        let mut restored = AgentRng::restore(a.state());
        assert_eq!(restored.next_u64(), a.next_u64());
    }
}
