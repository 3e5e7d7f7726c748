use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering as CmpOrdering,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    types::{ProviderDefinition, ProviderRole},
    usage::ProviderUsageSnapshot,
};

/// How candidate providers are ordered for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Most remaining quota first.
    #[default]
    #[serde(alias = "capacity")]
    CapacityBased,
    /// Cheapest provider first.
    #[serde(alias = "cost")]
    CostOptimized,
    /// Rotate through providers by priority.
    RoundRobin,
    /// Non-primary providers only, by priority.
    Emergency,
}

impl SelectionStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CapacityBased => "capacity_based",
            Self::CostOptimized => "cost_optimized",
            Self::RoundRobin => "round_robin",
            Self::Emergency => "emergency",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "capacity_based" | "capacity" => Ok(Self::CapacityBased),
            "cost_optimized" | "cost" => Ok(Self::CostOptimized),
            "round_robin" => Ok(Self::RoundRobin),
            "emergency" => Ok(Self::Emergency),
            other => Err(format!("unknown provider strategy: {other}")),
        }
    }
}

/// A provider that passed filtering, with the remaining capacity used for ordering.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub definition: Arc<ProviderDefinition>,
    /// Mean remaining fraction of the daily and monthly budgets in `[0, 1]`.
    pub capacity: f64,
}

impl Candidate {
    #[must_use]
    pub fn new(definition: Arc<ProviderDefinition>, usage: Option<&ProviderUsageSnapshot>) -> Self {
        let capacity = usage.map_or(1.0, |u| {
            (remaining_fraction(u.daily_used, u.daily_limit) +
                remaining_fraction(u.monthly_used, u.monthly_limit)) /
                2.0
        });
        Self { definition, capacity }
    }
}

#[allow(clippy::cast_precision_loss)]
fn remaining_fraction(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        1.0
    } else {
        (limit.saturating_sub(used) as f64 / limit as f64).clamp(0.0, 1.0)
    }
}

/// Orders candidates for one call. Round robin advances `cursor` exactly once.
#[must_use]
pub fn order_candidates(
    strategy: SelectionStrategy,
    mut candidates: Vec<Candidate>,
    cursor: &AtomicUsize,
) -> Vec<Candidate> {
    match strategy {
        SelectionStrategy::CapacityBased => {
            candidates.sort_by(|a, b| {
                desc(a.capacity, b.capacity).then_with(|| by_priority(a, b))
            });
        }
        SelectionStrategy::CostOptimized => {
            candidates.sort_by(|a, b| {
                cost_key(a)
                    .partial_cmp(&cost_key(b))
                    .unwrap_or(CmpOrdering::Equal)
                    .then_with(|| desc(a.capacity, b.capacity))
                    .then_with(|| by_priority(a, b))
            });
        }
        SelectionStrategy::RoundRobin => {
            candidates.sort_by(by_priority);
            if !candidates.is_empty() {
                let offset = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates.rotate_left(offset);
            }
        }
        SelectionStrategy::Emergency => {
            let has_backups = candidates.iter().any(|c| c.definition.role != ProviderRole::Primary);
            if has_backups {
                candidates.retain(|c| c.definition.role != ProviderRole::Primary);
            }
            candidates.sort_by(by_priority);
        }
    }
    candidates
}

/// Keeps only non-primary and emergency-only providers, unless that would leave none.
#[must_use]
pub fn narrow_for_emergency(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let is_backup =
        |c: &Candidate| c.definition.role != ProviderRole::Primary || c.definition.emergency_only;
    if candidates.iter().any(is_backup) {
        candidates.into_iter().filter(is_backup).collect()
    } else {
        candidates
    }
}

fn cost_key(candidate: &Candidate) -> f64 {
    candidate.definition.cost_weight.unwrap_or(f64::from(candidate.definition.priority))
}

fn desc(a: f64, b: f64) -> CmpOrdering {
    b.partial_cmp(&a).unwrap_or(CmpOrdering::Equal)
}

fn by_priority(a: &Candidate, b: &Candidate) -> CmpOrdering {
    a.definition
        .priority
        .cmp(&b.definition.priority)
        .then_with(|| a.definition.name.cmp(&b.definition.name))
}
