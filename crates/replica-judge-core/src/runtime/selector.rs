// crates/replica-judge-core/src/runtime/selector.rs
// ============================================================================
// Module: Resource Selector
// Description: Weighted random choice of target resources.
// Purpose: Pick the resources a grouping unit is placed on from the eligible
//          candidate set.
// Dependencies: rand
// ============================================================================

//! ## Overview
//! Candidates are ranked into tiers and drawn tier by tier until enough are
//! picked:
//! 1. positive weight, already holding a replica of a unit member
//! 2. positive weight, no replica
//! 3. zero weight, holding a replica
//! 4. zero weight, no replica
//!
//! Within a positive tier, draws are weighted random without replacement.
//! Zero-weight tiers are shuffled uniformly. A zero-weight resource is
//! therefore only chosen when fewer positive-weight candidates exist than
//! copies requested.

use rand::Rng;
use rand::distributions::Distribution;
use rand::distributions::WeightedIndex;
use rand::seq::SliceRandom;

use crate::core::RseId;

/// Resource eligible for a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Resource identifier.
    pub rse_id: RseId,
    /// Placement weight; non-positive values rank last.
    pub weight: f64,
    /// True when the resource already holds a replica of a unit member.
    pub preferred: bool,
}

/// Chooses up to `count` distinct resources from `candidates`.
pub fn select<R: Rng + ?Sized>(
    candidates: Vec<Candidate>,
    count: usize,
    rng: &mut R,
) -> Vec<RseId> {
    let mut tiers: [Vec<Candidate>; 4] = Default::default();
    for candidate in candidates {
        let positive = candidate.weight.is_finite() && candidate.weight > 0.0;
        let tier = match (positive, candidate.preferred) {
            (true, true) => 0,
            (true, false) => 1,
            (false, true) => 2,
            (false, false) => 3,
        };
        tiers[tier].push(candidate);
    }

    let mut chosen = Vec::with_capacity(count);
    for (tier_index, mut tier) in tiers.into_iter().enumerate() {
        if chosen.len() >= count {
            break;
        }
        let wanted = count - chosen.len();
        if tier_index < 2 {
            draw_weighted(&mut tier, wanted, rng, &mut chosen);
        } else {
            tier.shuffle(rng);
            chosen.extend(tier.into_iter().take(wanted).map(|candidate| candidate.rse_id));
        }
    }
    chosen
}

/// Draws `wanted` candidates proportional to weight without replacement.
fn draw_weighted<R: Rng + ?Sized>(
    pool: &mut Vec<Candidate>,
    wanted: usize,
    rng: &mut R,
    chosen: &mut Vec<RseId>,
) {
    for _ in 0 .. wanted {
        if pool.is_empty() {
            return;
        }
        let index = match WeightedIndex::new(pool.iter().map(|candidate| candidate.weight)) {
            Ok(distribution) => distribution.sample(rng),
            Err(_) => 0,
        };
        chosen.push(pool.swap_remove(index).rse_id);
    }
}
