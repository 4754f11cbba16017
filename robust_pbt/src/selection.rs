//! Ranking and exploit planning for one finished generation.

use std::cmp::Ordering;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::population::{Seed, SeedId, SeedStatus};

/// A seed slot that will be refilled by cloning `donor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub replaced: SeedId,
    pub donor: SeedId,
}

/// Outcome of the Selecting phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionPlan {
    /// Completed seeds, best first.
    pub ranked: Vec<SeedId>,
    /// Seeds carried into the next generation unchanged.
    pub survivors: Vec<SeedId>,
    /// Exploit donors (top of the ranking).
    pub donors: Vec<SeedId>,
    /// Bottom-ranked and failed seeds, each paired with a donor.
    pub replacements: Vec<Replacement>,
}

/// Too few seeds completed to run selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collapsed {
    pub completed: usize,
}

/// Fitness descending, then lowest id first.
pub fn rank(seeds: &[Seed]) -> Vec<SeedId> {
    let mut completed: Vec<&Seed> = seeds
        .iter()
        .filter(|s| s.status == SeedStatus::Completed)
        .collect();
    completed.sort_by(|a, b| compare_fitness(a, b));
    completed.into_iter().map(|s| s.id).collect()
}

fn compare_fitness(a: &Seed, b: &Seed) -> Ordering {
    let fa = a.fitness.unwrap_or(f64::NEG_INFINITY);
    let fb = b.fitness.unwrap_or(f64::NEG_INFINITY);
    fb.total_cmp(&fa).then_with(|| a.id.cmp(&b.id))
}

/// Number of seeds replaced out of `completed` survivors.
pub fn bottom_count(completed: usize, bottom_fraction: f64) -> usize {
    ((completed as f64) * bottom_fraction).floor() as usize
}

/// Number of exploit donors out of `completed` survivors, at least one.
pub fn top_count(completed: usize, top_fraction: f64) -> usize {
    (((completed as f64) * top_fraction).floor() as usize).clamp(1, completed.max(1))
}

/// Split a finished generation into survivors and replacements.
///
/// Failed seeds are always replaced. Donors are drawn uniformly from the
/// top of the ranking, so only the donor assignment depends on `rng`.
pub fn plan<R: Rng + ?Sized>(
    seeds: &[Seed],
    bottom_fraction: f64,
    top_fraction: f64,
    rng: &mut R,
) -> Result<SelectionPlan, Collapsed> {
    let ranked = rank(seeds);
    if ranked.len() < 2 {
        return Err(Collapsed { completed: ranked.len() });
    }

    let n_top = top_count(ranked.len(), top_fraction);
    let n_bottom = bottom_count(ranked.len(), bottom_fraction).min(ranked.len() - n_top);

    let donors: Vec<SeedId> = ranked[..n_top].to_vec();
    let cut = ranked.len() - n_bottom;
    let survivors: Vec<SeedId> = ranked[..cut].to_vec();

    let mut doomed: Vec<SeedId> = ranked[cut..].to_vec();
    doomed.extend(
        seeds
            .iter()
            .filter(|s| s.status != SeedStatus::Completed)
            .map(|s| s.id),
    );

    let replacements = doomed
        .into_iter()
        .map(|replaced| Replacement {
            replaced,
            donor: donors[rng.gen_range(0..donors.len())],
        })
        .collect();

    Ok(SelectionPlan {
        ranked,
        survivors,
        donors,
        replacements,
    })
}
