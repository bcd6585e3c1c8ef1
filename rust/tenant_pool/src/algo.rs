use itertools::Itertools;
use std::{cmp::Reverse, time::Duration};
use tracing::trace;

use crate::block::{BlockState, Name};

/// The maximum number of connections to open or close for a single block
/// during a rebalance.
pub const MAX_REBALANCE_OPS: usize = 5;

/// Determines the rebalance plan based on the current pool state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceOp {
    /// Open a connection on behalf of the block's waiters.
    Admit(Name),
    /// Close the least-recently-used idle connection of a block.
    CloseIdle(Name),
    /// Begin garbage collecting an unused block.
    Drain(Name),
    /// Remove a drained block, freeing its quota.
    Remove(Name),
}

/// Determines the release plan based on the current block state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOp {
    /// Hand the connection directly to the block's oldest waiter.
    HandOff,
    /// Return the connection to the block's idle set.
    Keep,
    /// Close the connection.
    Close,
}

/// The type of release to perform.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseType {
    /// A normal release
    #[default]
    Normal,
    /// A release of a poisoned, unhealthy or expired connection.
    Poison,
    /// A release of a connection belonging to a draining target or closed pool.
    Drain,
}

/// The state of a block when a connection is released to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseState {
    pub waiting: usize,
    pub live: usize,
    pub quota: usize,
    pub idle: usize,
    pub idle_cap: usize,
    /// Another block has waiters and room under its quota, but the pool is out
    /// of capacity.
    pub starving_elsewhere: bool,
    pub pool_full: bool,
}

/// A point-in-time sample of a block, taken by the balancer.
#[derive(Debug, Clone)]
pub struct BlockSample {
    pub name: Name,
    pub state: BlockState,
    pub quota: usize,
    pub live: usize,
    pub idle: usize,
    /// Idle connections past the idle timeout or their maximum lifetime.
    pub expired_idle: usize,
    pub waiting: usize,
    pub connecting: usize,
    /// Effective demand.
    pub demand: f64,
    pub oldest_wait: Duration,
    /// How long the block has had no connections, waiters or demand.
    pub quiet_for: Option<Duration>,
    pub draining_for: Option<Duration>,
    pub in_backoff: bool,
    /// The target is locked for draining by the pool.
    pub drain_locked: bool,
}

impl BlockSample {
    /// Does this block have waiters that could be served by a new connection
    /// if capacity were available?
    pub fn is_starved(&self) -> bool {
        self.waiting > self.connecting && self.live < self.quota && !self.in_backoff
    }
}

/// Timings for block garbage collection.
#[derive(Debug, Clone, Copy)]
pub struct GcPolicy {
    /// A block must be unused for this long before it starts draining.
    pub min_idle_time_for_gc: Duration,
    /// A draining block is removed after this long.
    pub grace: Duration,
}

/// The pool algorithm constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConstraints {
    /// Maximum pool size.
    pub max: usize,
    /// The smallest quota given to any block with demand, capacity permitting.
    pub min_quota: usize,
}

impl PoolConstraints {
    /// Allocate quotas for the given `(name, demand)` pairs by water-filling.
    /// The result is aligned with the input and always sums to at most `max`.
    ///
    /// Blocks without demand receive nothing. Blocks whose proportional share
    /// of the pool falls under `min_quota` are pinned to `min_quota` and the
    /// remaining capacity is split proportionally among the others. Integer
    /// remainders go to the largest fractional shares.
    pub fn allocate(&self, demands: &[(Name, f64)]) -> Vec<usize> {
        let mut quotas = vec![0; demands.len()];
        let active = demands
            .iter()
            .enumerate()
            .filter(|(_, (_, demand))| demand.is_finite() && *demand > 0.0)
            .map(|(i, _)| i)
            .collect_vec();
        if active.is_empty() || self.max == 0 {
            return quotas;
        }

        let min = self.min_quota.max(1);
        let by_demand = |&a: &usize, &b: &usize| {
            demands[b]
                .1
                .total_cmp(&demands[a].1)
                .then_with(|| demands[a].0.cmp(&demands[b].0))
        };

        // Not enough capacity for every floor: the most demanding blocks win.
        if active.len() * min >= self.max {
            let mut remaining = self.max;
            for i in active.into_iter().sorted_by(by_demand) {
                let quota = min.min(remaining);
                quotas[i] = quota;
                remaining -= quota;
                if remaining == 0 {
                    break;
                }
            }
            return quotas;
        }

        let mut pinned = vec![false; demands.len()];
        let (free, unpinned_demand) = loop {
            let pinned_count = active.iter().filter(|&&i| pinned[i]).count();
            let free = (self.max - pinned_count * min) as f64;
            let unpinned_demand: f64 = active
                .iter()
                .filter(|&&i| !pinned[i])
                .map(|&i| demands[i].1)
                .sum();
            let mut changed = false;
            for &i in &active {
                if !pinned[i] && demands[i].1 * free / unpinned_demand < min as f64 {
                    pinned[i] = true;
                    changed = true;
                }
            }
            if !changed {
                break (free, unpinned_demand);
            }
        };

        let mut assigned = 0;
        let mut remainders = vec![];
        for &i in &active {
            if pinned[i] {
                quotas[i] = min;
            } else {
                let share = demands[i].1 * free / unpinned_demand;
                quotas[i] = (share.floor() as usize).max(min);
                remainders.push((i, share - quotas[i] as f64));
            }
            assigned += quotas[i];
        }

        let leftover = self.max.saturating_sub(assigned);
        for (i, _) in remainders
            .into_iter()
            .sorted_by(|a, b| {
                b.1.total_cmp(&a.1)
                    .then_with(|| demands[a.0].0.cmp(&demands[b.0].0))
            })
            .take(leftover)
        {
            quotas[i] += 1;
        }

        if tracing::enabled!(tracing::Level::TRACE) {
            let s = demands
                .iter()
                .zip(&quotas)
                .map(|((name, demand), quota)| format!("{name}={demand:.2}->{quota}"))
                .join(" ");
            trace!("Quotas: {s}");
        }
        debug_assert!(quotas.iter().sum::<usize>() <= self.max);
        quotas
    }

    /// Plan the idle trimming, waiter admission and garbage collection work
    /// for a balancer pass.
    pub fn plan_rebalance(
        &self,
        samples: &[BlockSample],
        pool_live: usize,
        gc: &GcPolicy,
    ) -> Vec<RebalanceOp> {
        let mut ops = vec![];
        let mut idle_left = samples.iter().map(|s| s.idle).collect_vec();
        let mut live_left = samples.iter().map(|s| s.live).collect_vec();

        // Attrition: expired connections, drained targets and targets nobody
        // wants any more.
        for (i, s) in samples.iter().enumerate() {
            let close = if s.drain_locked || s.demand == 0.0 {
                s.idle
            } else {
                s.expired_idle.min(s.idle)
            }
            .min(MAX_REBALANCE_OPS);
            for _ in 0..close {
                ops.push(RebalanceOp::CloseIdle(s.name.clone()));
            }
            idle_left[i] -= close;
            live_left[i] -= close;
        }

        // Starved blocks, oldest waiter first. Use free capacity if there is
        // any, otherwise reclaim idle connections from blocks over quota.
        let mut room = self.max.saturating_sub(pool_live);
        let starved = (0..samples.len())
            .filter(|&i| samples[i].is_starved())
            .sorted_by(|&a, &b| {
                samples[b]
                    .oldest_wait
                    .cmp(&samples[a].oldest_wait)
                    .then_with(|| samples[a].name.cmp(&samples[b].name))
            });
        for i in starved {
            let s = &samples[i];
            let want = (s.waiting - s.connecting)
                .min(s.quota - s.live)
                .min(MAX_REBALANCE_OPS);
            for _ in 0..want {
                if room > 0 {
                    room -= 1;
                    ops.push(RebalanceOp::Admit(s.name.clone()));
                    continue;
                }
                let donor = (0..samples.len())
                    .filter(|&d| d != i && idle_left[d] > 0 && live_left[d] > samples[d].quota)
                    .min_by_key(|&d| (Reverse(live_left[d] - samples[d].quota), &samples[d].name));
                let Some(donor) = donor else {
                    break;
                };
                idle_left[donor] -= 1;
                live_left[donor] -= 1;
                ops.push(RebalanceOp::CloseIdle(samples[donor].name.clone()));
            }
        }

        for s in samples {
            if s.live != 0 || s.waiting != 0 {
                continue;
            }
            match s.state {
                BlockState::Draining => {
                    if s.draining_for.is_some_and(|t| t >= gc.grace) {
                        ops.push(RebalanceOp::Remove(s.name.clone()));
                    }
                }
                BlockState::Removed => {}
                _ => {
                    if s.demand == 0.0
                        && s.quiet_for.is_some_and(|t| t >= gc.min_idle_time_for_gc)
                    {
                        ops.push(RebalanceOp::Drain(s.name.clone()));
                    }
                }
            }
        }

        ops
    }

    /// Plan what happens to a connection being returned to its block.
    pub fn plan_release(&self, release_type: ReleaseType, state: &ReleaseState) -> ReleaseOp {
        if release_type != ReleaseType::Normal {
            return ReleaseOp::Close;
        }
        let over_quota = state.live > state.quota;
        if state.waiting > 0 {
            // Move capacity to a starved block rather than feeding our own
            // queue past our quota.
            if over_quota && state.starving_elsewhere {
                ReleaseOp::Close
            } else {
                ReleaseOp::HandOff
            }
        } else if over_quota && (state.starving_elsewhere || state.pool_full) {
            ReleaseOp::Close
        } else if state.idle >= state.idle_cap {
            ReleaseOp::Close
        } else {
            ReleaseOp::Keep
        }
    }
}
