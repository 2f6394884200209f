//! Hierarchical token bucket: per-queue assured and ceiling buckets plus a shared pool.
//!
//! A queue is served from its own assured bucket first. Once no queue holds an
//! assured token, the shared pool (running at `total_rate - sum(assured)`)
//! goes to the most starved queue of the best priority tier. The ceiling
//! bucket caps every dispatch regardless of where the token came from.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, trace};

use super::table::QueueTable;
use super::Selection;
use crate::config::QosConfig;
use crate::request::VolumeId;
use crate::token_bucket::TokenBucket;
use crate::volume_queue::QosParams;

/// Lowest rate a throttled queue is ever pushed down to.
pub const PROTECTIVE_MIN_RATE: f64 = 1.0;

/// Smallest wait returned when tokens are short.
const MIN_WAIT_NS: u64 = 1_000;

/// Time constant of the recent-IOPS moving average.
const RECENT_IOPS_TAU_NS: f64 = 1_000_000_000.0;

/// Assured and ceiling rates in effect for a queue at some throttle level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveRates {
    /// Assured bucket refill rate.
    pub assured: f64,
    /// Ceiling bucket refill rate.
    pub ceiling: f64,
}

/// Computes the rates a queue runs at under `level`.
///
/// `None` means no throttle was ever applied: the queue runs at its configured
/// assured rate with its ceiling at `throttle_iops`, or `total_rate` when unbounded.
///
/// With `level >= 0`, `x = floor(level)` and `frac = level - x`: priorities
/// numerically above `x` are held at their assured rate, priorities below `x`
/// get their full ceiling, and priority `x` is interpolated by `frac`. Level 10
/// releases every priority. With `level < 0` every assured rate is scaled by
/// `(10 - |x|) / 10` and the ceiling follows it.
pub fn effective_rates(params: &QosParams, total_rate: u64, level: Option<f64>) -> EffectiveRates {
    let assured = params.assured_iops as f64;
    let max = if params.is_bounded() {
        params.throttle_iops as f64
    } else {
        total_rate as f64
    }
    .max(assured);

    let Some(level) = level else {
        return EffectiveRates {
            assured,
            ceiling: max.max(PROTECTIVE_MIN_RATE),
        };
    };

    let x = level.floor();
    if level < 0.0 {
        let scale = ((10.0 - x.abs()) / 10.0).max(0.0);
        let compressed = (assured * scale).max(assured.min(PROTECTIVE_MIN_RATE));
        return EffectiveRates {
            assured: compressed,
            ceiling: compressed.max(PROTECTIVE_MIN_RATE),
        };
    }

    let frac = level - x;
    let priority = f64::from(params.priority);
    let ceiling = if level >= 10.0 || priority < x {
        max
    } else if priority > x {
        assured
    } else {
        assured + frac * (max - assured)
    };
    EffectiveRates {
        assured,
        ceiling: ceiling.max(PROTECTIVE_MIN_RATE),
    }
}

struct HtbQueue {
    rates: EffectiveRates,
    assured: TokenBucket,
    ceiling: TokenBucket,
    recent_iops: f64,
    last_dispatch_ns: u64,
}

impl HtbQueue {
    fn new(rates: EffectiveRates, wait_time_s: f64, burst: f64, now_ns: u64) -> Self {
        Self {
            rates,
            assured: TokenBucket::new(rates.assured, assured_burst(rates.assured, wait_time_s), now_ns),
            ceiling: TokenBucket::new(rates.ceiling, burst, now_ns),
            recent_iops: 0.0,
            last_dispatch_ns: now_ns,
        }
    }

    fn apply(&mut self, rates: EffectiveRates, wait_time_s: f64, now_ns: u64) {
        self.assured.modify_rate(rates.assured, now_ns);
        self.assured.set_burst(assured_burst(rates.assured, wait_time_s));
        self.ceiling.modify_rate(rates.ceiling, now_ns);
        self.rates = rates;
    }

    fn recent_iops(&self, now_ns: u64) -> f64 {
        let dt = now_ns.saturating_sub(self.last_dispatch_ns) as f64;
        self.recent_iops * (-dt / RECENT_IOPS_TAU_NS).exp()
    }

    fn charge(&mut self, now_ns: u64) {
        self.ceiling.try_consume(1.0, now_ns);
        self.recent_iops = self.recent_iops(now_ns) + 1_000_000_000.0 / RECENT_IOPS_TAU_NS;
        self.last_dispatch_ns = now_ns;
    }
}

/// Unused assured tokens are kept for `wait_time_s`; a single token is always allowed.
fn assured_burst(rate: f64, wait_time_s: f64) -> f64 {
    if rate > 0.0 {
        (rate * wait_time_s).max(1.0)
    } else {
        0.0
    }
}

struct Candidate {
    idx: usize,
    volume_id: VolumeId,
    priority: u8,
    recent_iops: f64,
}

pub(crate) struct HtbScheduler {
    queues: HashMap<VolumeId, HtbQueue>,
    pool: TokenBucket,
    cursor: usize,
    throttle_level: Option<f64>,
    wait_time_s: f64,
    burst: f64,
    idle_poll: Duration,
}

impl HtbScheduler {
    pub(crate) fn new(config: &QosConfig, now_ns: u64) -> Self {
        let burst = (config.default_burst_size as f64).max(1.0);
        Self {
            queues: HashMap::new(),
            pool: TokenBucket::new(config.total_rate as f64, burst, now_ns),
            cursor: 0,
            throttle_level: None,
            wait_time_s: config.assured_wait_time().as_secs_f64(),
            burst,
            idle_poll: config.idle_poll(),
        }
    }

    fn update_pool<T>(&mut self, table: &QueueTable<T>, now_ns: u64) {
        let spare = table.total_rate().saturating_sub(table.total_min_rate());
        self.pool.modify_rate(spare as f64, now_ns);
        debug!(pool_rate = spare, "shared pool rate updated");
    }

    pub(crate) fn on_register<T>(&mut self, table: &QueueTable<T>, volume_id: VolumeId, now_ns: u64) {
        let Some(queue) = table.get(volume_id) else {
            return;
        };
        let rates = effective_rates(&queue.params(), table.total_rate(), self.throttle_level);
        self.queues.insert(
            volume_id,
            HtbQueue::new(rates, self.wait_time_s, self.burst, now_ns),
        );
        self.update_pool(table, now_ns);
    }

    pub(crate) fn on_deregister<T>(
        &mut self,
        table: &QueueTable<T>,
        volume_id: VolumeId,
        removed_idx: usize,
        now_ns: u64,
    ) {
        self.queues.remove(&volume_id);
        if removed_idx <= self.cursor {
            self.cursor = if self.cursor == 0 {
                table.len().saturating_sub(1)
            } else {
                self.cursor - 1
            };
        }
        self.update_pool(table, now_ns);
    }

    pub(crate) fn on_modify<T>(&mut self, table: &QueueTable<T>, volume_id: VolumeId, now_ns: u64) {
        self.recompute(table, volume_id, now_ns);
        self.update_pool(table, now_ns);
    }

    pub(crate) fn on_total_rate<T>(&mut self, table: &QueueTable<T>, now_ns: u64) {
        self.recompute_all(table, now_ns);
        self.update_pool(table, now_ns);
    }

    pub(crate) fn set_throttle_level<T>(&mut self, table: &QueueTable<T>, level: f64, now_ns: u64) {
        self.throttle_level = Some(level);
        self.recompute_all(table, now_ns);
    }

    pub(crate) fn throttle_level(&self) -> Option<f64> {
        self.throttle_level
    }

    fn recompute<T>(&mut self, table: &QueueTable<T>, volume_id: VolumeId, now_ns: u64) {
        let Some(queue) = table.get(volume_id) else {
            return;
        };
        let rates = effective_rates(&queue.params(), table.total_rate(), self.throttle_level);
        if let Some(state) = self.queues.get_mut(&volume_id) {
            if state.rates != rates {
                debug!(
                    volume = %volume_id,
                    assured = rates.assured,
                    ceiling = rates.ceiling,
                    previous_ceiling = state.rates.ceiling,
                    "effective rates changed"
                );
            }
            state.apply(rates, self.wait_time_s, now_ns);
        }
    }

    fn recompute_all<T>(&mut self, table: &QueueTable<T>, now_ns: u64) {
        for &volume_id in table.order() {
            self.recompute(table, volume_id, now_ns);
        }
    }

    pub(crate) fn select<T>(&mut self, table: &QueueTable<T>, now_ns: u64) -> Selection {
        let n = table.len();
        if n == 0 {
            return Selection::Idle;
        }
        self.pool.refill(now_ns);

        let start = (self.cursor + 1) % n;
        let mut candidate: Option<Candidate> = None;
        let mut any_pending = false;

        for step in 0..n {
            let idx = (start + step) % n;
            let queue = table.at(idx);
            let volume_id = queue.volume_id();
            let state = match self.queues.get_mut(&volume_id) {
                Some(state) => state,
                None => panic!("no bucket state for registered {}", volume_id),
            };

            let expired = state.assured.refill(now_ns);
            if expired > 0.0 {
                self.pool.deposit(expired);
            }
            if !queue.has_dispatchable() {
                continue;
            }
            any_pending = true;
            if !state.ceiling.has_tokens(1.0, now_ns) {
                continue;
            }
            if state.assured.try_consume(1.0, now_ns) {
                state.charge(now_ns);
                self.cursor = idx;
                trace!(volume = %volume_id, "assured token");
                return Selection::Queue(volume_id);
            }

            let priority = queue.params().priority;
            let recent_iops = state.recent_iops(now_ns);
            let better = candidate.as_ref().map_or(true, |c| {
                priority < c.priority || (priority == c.priority && recent_iops < c.recent_iops)
            });
            if better {
                candidate = Some(Candidate {
                    idx,
                    volume_id,
                    priority,
                    recent_iops,
                });
            }
        }

        if let Some(c) = candidate {
            if self.pool.try_consume(1.0, now_ns) {
                if let Some(state) = self.queues.get_mut(&c.volume_id) {
                    state.charge(now_ns);
                }
                self.cursor = c.idx;
                trace!(volume = %c.volume_id, "pool token");
                return Selection::Queue(c.volume_id);
            }
        }

        if !any_pending {
            return Selection::Idle;
        }
        Selection::Wait(self.next_token_wait(table, now_ns))
    }

    /// Shortest time until some pending queue holds both a ceiling token and
    /// either an assured or a pool token.
    fn next_token_wait<T>(&self, table: &QueueTable<T>, now_ns: u64) -> Duration {
        let pool_wait = self.pool.time_until(1.0, now_ns);
        let mut best: Option<u64> = None;

        for queue in table.iter() {
            if !queue.has_dispatchable() {
                continue;
            }
            let Some(state) = self.queues.get(&queue.volume_id()) else {
                continue;
            };
            let Some(ceiling_wait) = state.ceiling.time_until(1.0, now_ns) else {
                continue;
            };
            let Some(source_wait) = [state.assured.time_until(1.0, now_ns), pool_wait]
                .into_iter()
                .flatten()
                .min()
            else {
                continue;
            };
            let wait = ceiling_wait.max(source_wait);
            best = Some(best.map_or(wait, |b| b.min(wait)));
        }

        match best {
            Some(ns) => Duration::from_nanos(ns.max(MIN_WAIT_NS)),
            None => self.idle_poll,
        }
    }

    #[cfg(test)]
    fn rates(&self, volume_id: VolumeId) -> Option<EffectiveRates> {
        self.queues.get(&volume_id).map(|q| q.rates)
    }
}
