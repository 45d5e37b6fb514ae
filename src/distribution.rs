//! Work-distribution policies
//!
//! Four pure policies decide which worker receives the next task. Each is a
//! function from a [`DistributionContext`] (the task plus a snapshot of
//! available workers) to an optional [`DistributionResult`]; returning
//! `None` means the task stays pending. The engine owns policy state (the
//! round-robin cursor and the sticky-map mirror) and the fallback
//! composition between policies.
//!
//! The candidate snapshot is pre-filtered to live workers with free
//! capacity, so policies only rank, they never re-check liveness.

use crate::types::{RoutingStrategy, TaskRecord, WorkerRecord};

/// Inputs to a policy decision
pub struct DistributionContext<'a> {
    pub task: &'a TaskRecord,
    /// Available workers, sorted by id
    pub workers: &'a [WorkerRecord],
}

/// A policy's choice of worker, with a human-readable reason for the
/// assignment event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionResult {
    pub worker_id: String,
    pub reason: String,
}

/// Pick the policy for a task from its routing fields
///
/// Precedence: an explicit hint wins, then a sticky key, then required
/// skills, then the queue's configured default.
pub fn select_strategy(task: &TaskRecord, default: RoutingStrategy) -> RoutingStrategy {
    if let Some(hint) = task.routing_hint {
        return hint;
    }
    if task.sticky_key.is_some() {
        return RoutingStrategy::Sticky;
    }
    if !task.required_skills.is_empty() {
        return RoutingStrategy::SkillBased;
    }
    default
}

/// Rotate through the candidates for fairness
///
/// `cursor` carries the index of the last pick; the next pick is the
/// following candidate, wrapping around. Initialize the cursor to
/// `usize::MAX` so the first pick lands on index zero.
pub fn round_robin(ctx: &DistributionContext<'_>, cursor: &mut usize) -> Option<DistributionResult> {
    if ctx.workers.is_empty() {
        return None;
    }
    let index = cursor.wrapping_add(1) % ctx.workers.len();
    *cursor = index;
    let worker = &ctx.workers[index];
    Some(DistributionResult {
        worker_id: worker.id.clone(),
        reason: format!("round-robin pick at index {}", index),
    })
}

/// Prefer the lowest load ratio, then the most free slots, then the
/// smallest id for a stable result
pub fn load_based(ctx: &DistributionContext<'_>) -> Option<DistributionResult> {
    let worker = ctx.workers.iter().min_by(|a, b| {
        a.load_ratio()
            .partial_cmp(&b.load_ratio())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.free_slots().cmp(&a.free_slots()))
            .then_with(|| a.id.cmp(&b.id))
    })?;
    Some(DistributionResult {
        worker_id: worker.id.clone(),
        reason: format!(
            "lowest load ratio {:.2} ({} of {} slots used)",
            worker.load_ratio(),
            worker.current_load,
            worker.capacity
        ),
    })
}

/// Blend skill overlap with load headroom
///
/// Each candidate scores `0.7 * match + 0.3 * (1 - load_ratio)` where
/// `match` is the fraction of required skills the worker holds (one when
/// nothing is required). When skills are required and no candidate matches
/// any of them, the task waits rather than landing on an unskilled worker.
pub fn skill_based(ctx: &DistributionContext<'_>) -> Option<DistributionResult> {
    let required = &ctx.task.required_skills;
    let mut any_match = required.is_empty();
    let mut best: Option<(&WorkerRecord, f64, f64)> = None;

    for worker in ctx.workers {
        let matched = if required.is_empty() {
            1.0
        } else {
            let held = required
                .iter()
                .filter(|skill| worker.skills.contains(*skill))
                .count();
            held as f64 / required.len() as f64
        };
        if matched > 0.0 {
            any_match = true;
        }
        let score = 0.7 * matched + 0.3 * (1.0 - worker.load_ratio());
        let replace = match &best {
            None => true,
            Some((current, current_score, _)) => {
                score > *current_score
                    || (score == *current_score && worker.id < current.id)
            }
        };
        if replace {
            best = Some((worker, score, matched));
        }
    }

    if !required.is_empty() && !any_match {
        return None;
    }

    best.map(|(worker, score, matched)| DistributionResult {
        worker_id: worker.id.clone(),
        reason: format!(
            "skill score {:.2} (match {:.2}, load ratio {:.2})",
            score,
            matched,
            worker.load_ratio()
        ),
    })
}

/// Eligible worker currently bound to the task's sticky key, if any
///
/// The engine resolves the binding from its mirror of the sticky map and
/// falls back to [`load_based`] (rebinding the key) when the bound worker
/// is missing from the snapshot.
pub fn sticky_bound<'a>(
    ctx: &DistributionContext<'a>,
    bound_worker: &str,
) -> Option<&'a WorkerRecord> {
    ctx.workers.iter().find(|w| w.id == bound_worker)
}
