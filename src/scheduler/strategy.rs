//! Scheduling strategies for claim ordering.
//!
//! A strategy is a pure ordering policy: it contributes an ORDER BY clause to
//! the claim query and, for Weighted-Random, a pick among the fetched
//! candidates. Adding a strategy means adding a variant here; the claim
//! protocol itself never changes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default candidate window for the Weighted-Random strategy.
pub const DEFAULT_WEIGHTED_TOP_K: usize = 16;

/// Error returned when parsing a strategy name.
#[derive(Debug, Error)]
#[error("unknown scheduling strategy: {0} (expected fifo, lifo, priority or weighted-random)")]
pub struct ParseStrategyError(pub String);

/// Ordering policy used when selecting the next claimable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingStrategy {
    /// Oldest first: fair ordering for background batch work.
    Fifo,
    /// Freshest first: interactive and user-triggered work. The default.
    Lifo,
    /// Lowest priority value first, tie-broken by age.
    Priority,
    /// Top-K by priority, then one picked with probability proportional to
    /// an inverse-priority weight. Prevents starvation of low-priority tasks
    /// under constant high-priority pressure.
    WeightedRandom {
        /// Size of the candidate window.
        top_k: usize,
    },
}

impl Default for SchedulingStrategy {
    fn default() -> Self {
        SchedulingStrategy::Lifo
    }
}

impl SchedulingStrategy {
    /// Canonical name, as accepted by configuration and the CLI.
    pub fn name(&self) -> &'static str {
        match self {
            SchedulingStrategy::Fifo => "fifo",
            SchedulingStrategy::Lifo => "lifo",
            SchedulingStrategy::Priority => "priority",
            SchedulingStrategy::WeightedRandom { .. } => "weighted-random",
        }
    }

    /// The ORDER BY clause applied to the candidate select.
    ///
    /// The id tie-break keeps the order total even when timestamps collide.
    /// Weighted-Random orders its candidate window like Priority; the random
    /// pick happens over the fetched window.
    pub fn order_clause(&self) -> &'static str {
        match self {
            SchedulingStrategy::Fifo => "created_at_utc ASC, id ASC",
            SchedulingStrategy::Lifo => "created_at_utc DESC, id DESC",
            SchedulingStrategy::Priority | SchedulingStrategy::WeightedRandom { .. } => {
                "priority ASC, created_at_utc ASC, id ASC"
            }
        }
    }

    /// How many candidate rows the claim query fetches.
    pub fn candidate_limit(&self) -> usize {
        match self {
            SchedulingStrategy::WeightedRandom { top_k } => (*top_k).max(1),
            _ => 1,
        }
    }

    /// Picks the index of the candidate to lease.
    ///
    /// For the deterministic strategies the candidate list has one entry and
    /// the first is taken. Weighted-Random rolls over the inverse-priority
    /// weights of the window.
    pub fn pick(&self, candidates: &[ClaimCandidate]) -> Option<usize> {
        use rand::RngExt;

        if candidates.is_empty() {
            return None;
        }

        match self {
            SchedulingStrategy::WeightedRandom { .. } => {
                let total = total_weight(candidates);
                let roll = rand::rng().random_range(0.0..total);
                Some(pick_weighted(candidates, roll))
            }
            _ => Some(0),
        }
    }
}

impl std::fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for SchedulingStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(SchedulingStrategy::Fifo),
            "lifo" => Ok(SchedulingStrategy::Lifo),
            "priority" => Ok(SchedulingStrategy::Priority),
            "weighted-random" | "weighted" => Ok(SchedulingStrategy::WeightedRandom {
                top_k: DEFAULT_WEIGHTED_TOP_K,
            }),
            other => Err(ParseStrategyError(other.to_string())),
        }
    }
}

/// The fields of a candidate row the weighted pick needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimCandidate {
    /// Task row id.
    pub id: i64,
    /// Task priority.
    pub priority: i32,
}

/// Inverse-priority weight relative to the most urgent candidate.
///
/// The most urgent candidate (lowest priority value) weighs 1.0; each step
/// away from it weighs 1/(distance + 1). Priorities are signed, so the weight
/// is anchored to the window minimum rather than zero.
fn weight(priority: i32, min_priority: i32) -> f64 {
    let distance = i64::from(priority) - i64::from(min_priority);
    1.0 / (distance as f64 + 1.0)
}

fn total_weight(candidates: &[ClaimCandidate]) -> f64 {
    let min_priority = candidates.iter().map(|c| c.priority).min().unwrap_or(0);
    candidates
        .iter()
        .map(|c| weight(c.priority, min_priority))
        .sum()
}

/// Cumulative-weight pick over the candidate window.
///
/// `roll` must be in `[0, total_weight)`. Split out from the rng so the
/// selection is testable.
fn pick_weighted(candidates: &[ClaimCandidate], roll: f64) -> usize {
    let min_priority = candidates.iter().map(|c| c.priority).min().unwrap_or(0);

    let mut cumulative = 0.0;
    for (idx, candidate) in candidates.iter().enumerate() {
        cumulative += weight(candidate.priority, min_priority);
        if roll < cumulative {
            return idx;
        }
    }

    candidates.len() - 1
}
