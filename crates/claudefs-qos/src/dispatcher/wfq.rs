//! Weighted fair queueing: rate-reservation ring, credits, priority round robin.
//!
//! The ring holds `total_rate` slots. Each queue owns `assured_iops` of them,
//! spread evenly around the ring. Every selection consumes the slot under the
//! cursor; when its owner has work the owner is served, otherwise the slot is
//! open and goes first to queues holding credit (earned when their own slot
//! came up empty), then to priority round robin.
//!
//! A queue whose effective ceiling (throttle IOPS, scaled by the throttle
//! level) is below the node total also carries a ceiling bucket. A queue with
//! no ceiling token is passed over by every tier.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, trace};

use super::htb::effective_rates;
use super::table::QueueTable;
use super::Selection;
use crate::config::QosConfig;
use crate::error::{QosError, QosResult};
use crate::request::VolumeId;
use crate::token_bucket::TokenBucket;
use crate::volume_queue::QosParams;

/// Largest slot ring the weighted-fair dispatcher will allocate.
pub const MAX_RING_SLOTS: u64 = 1 << 24;

const NS_PER_SEC: f64 = 1_000_000_000.0;

/// Smallest wait returned while every pending queue is over its ceiling.
const MIN_WAIT_NS: u64 = 1_000;

#[derive(Debug, Clone, Copy)]
pub(crate) struct WfqTunables {
    window_ns: u64,
    behind: f64,
    ahead: f64,
    credit_divisor: u64,
    burst: f64,
    idle_poll: Duration,
}

impl WfqTunables {
    pub(crate) fn from_config(config: &QosConfig) -> Self {
        Self {
            window_ns: config.wfq_rate_window_ms.max(1) * 1_000_000,
            behind: config.wfq_behind_threshold,
            ahead: config.wfq_ahead_threshold,
            credit_divisor: config.wfq_credit_divisor.max(1),
            burst: (config.default_burst_size as f64).max(1.0),
            idle_poll: config.idle_poll(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pace {
    Behind,
    OnTrack,
    Ahead,
}

#[derive(Debug, Default)]
struct SlotOwner {
    slots: Vec<usize>,
    credits: u64,
    credit_cap: u64,
    guaranteed_served: u64,
    ceiling: Option<TokenBucket>,
}

pub(crate) struct WfqScheduler {
    tunables: WfqTunables,
    ring: Vec<Option<VolumeId>>,
    cursor: usize,
    owners: HashMap<VolumeId, SlotOwner>,
    rr_index: usize,
    rr_served: u32,
    window_start_ns: u64,
    window_served: u64,
    assured_total: u64,
    throttle_level: Option<f64>,
}

/// Claims `count` free slots spaced about `ring.len() / count` apart.
///
/// A slot already taken is resolved by probing forward to the next free one.
fn claim_slots(ring: &mut [Option<VolumeId>], volume_id: VolumeId, count: u64) -> Vec<usize> {
    let n = ring.len();
    if count == 0 || n == 0 {
        return Vec::new();
    }

    let mut slots = Vec::with_capacity(count as usize);
    for i in 0..count {
        let ideal = (u128::from(i) * n as u128 / u128::from(count)) as usize;
        let mut pos = ideal;
        let mut tried = 0;
        while ring[pos].is_some() {
            pos = (pos + 1) % n;
            tried += 1;
            assert!(tried < n, "slot ring exhausted while placing {}", volume_id);
        }
        assert!(ring[pos].is_none(), "ring slot {} double-assigned", pos);
        ring[pos] = Some(volume_id);
        slots.push(pos);
    }
    slots
}

fn revoke_slots(ring: &mut [Option<VolumeId>], volume_id: VolumeId, slots: &[usize]) {
    for &pos in slots {
        assert_eq!(
            ring[pos],
            Some(volume_id),
            "ring slot {} not owned by {}",
            pos,
            volume_id
        );
        ring[pos] = None;
    }
}

impl WfqScheduler {
    pub(crate) fn new(total_rate: u64, tunables: WfqTunables, now_ns: u64) -> Self {
        Self {
            tunables,
            ring: vec![None; total_rate.min(MAX_RING_SLOTS) as usize],
            cursor: 0,
            owners: HashMap::new(),
            rr_index: 0,
            rr_served: 0,
            window_start_ns: now_ns,
            window_served: 0,
            assured_total: 0,
            throttle_level: None,
        }
    }

    pub(crate) fn check_total_rate(&self, total_rate: u64) -> QosResult<()> {
        if total_rate > MAX_RING_SLOTS {
            return Err(QosError::InvalidConfig {
                reason: format!(
                    "total_rate {} exceeds the {} slot ring limit",
                    total_rate, MAX_RING_SLOTS
                ),
            });
        }
        Ok(())
    }

    fn credit_cap(&self, assured: u64) -> u64 {
        assured / self.tunables.credit_divisor + 1
    }

    /// Ceiling bucket for a queue whose effective ceiling is below the node
    /// total; `None` when the ring alone paces it.
    fn ceiling_for(
        &self,
        params: &QosParams,
        total_rate: u64,
        current: Option<TokenBucket>,
        now_ns: u64,
    ) -> Option<TokenBucket> {
        let rates = effective_rates(params, total_rate, self.throttle_level);
        if rates.ceiling >= total_rate as f64 {
            return None;
        }
        Some(match current {
            Some(mut bucket) => {
                bucket.modify_rate(rates.ceiling, now_ns);
                bucket
            }
            None => TokenBucket::new(rates.ceiling, self.tunables.burst, now_ns),
        })
    }

    fn refresh_ceiling<T>(&mut self, table: &QueueTable<T>, volume_id: VolumeId, now_ns: u64) {
        let Some(queue) = table.get(volume_id) else {
            return;
        };
        let current = self
            .owners
            .get_mut(&volume_id)
            .and_then(|owner| owner.ceiling.take());
        let ceiling = self.ceiling_for(&queue.params(), table.total_rate(), current, now_ns);
        if let Some(owner) = self.owners.get_mut(&volume_id) {
            owner.ceiling = ceiling;
        }
    }

    pub(crate) fn on_register<T>(&mut self, table: &QueueTable<T>, volume_id: VolumeId, now_ns: u64) {
        let Some(queue) = table.get(volume_id) else {
            return;
        };
        let params = queue.params();
        let assured = params.assured_iops;
        let slots = claim_slots(&mut self.ring, volume_id, assured);
        debug!(volume = %volume_id, slots = slots.len(), ring = self.ring.len(), "ring slots assigned");
        let owner = SlotOwner {
            slots,
            credits: 0,
            credit_cap: self.credit_cap(assured),
            guaranteed_served: 0,
            ceiling: self.ceiling_for(&params, table.total_rate(), None, now_ns),
        };
        self.assured_total += assured;
        self.owners.insert(volume_id, owner);
    }

    pub(crate) fn on_deregister(&mut self, volume_id: VolumeId, removed_idx: usize, remaining: usize) {
        if let Some(owner) = self.owners.remove(&volume_id) {
            revoke_slots(&mut self.ring, volume_id, &owner.slots);
            self.assured_total -= owner.slots.len() as u64;
        }

        if remaining == 0 {
            self.rr_index = 0;
            self.rr_served = 0;
            return;
        }
        if removed_idx < self.rr_index {
            self.rr_index -= 1;
        } else if removed_idx == self.rr_index {
            // The next registered queue slid into the cursor position.
            self.rr_served = 0;
        }
        self.rr_index %= remaining;
    }

    /// Revokes the queue's slots and claims a fresh set for its new assured rate.
    pub(crate) fn on_modify<T>(&mut self, table: &QueueTable<T>, volume_id: VolumeId, now_ns: u64) {
        let Some(queue) = table.get(volume_id) else {
            return;
        };
        let assured = queue.params().assured_iops;
        let cap = self.credit_cap(assured);

        let mut owner = self.owners.remove(&volume_id).unwrap_or_default();
        revoke_slots(&mut self.ring, volume_id, &owner.slots);
        self.assured_total -= owner.slots.len() as u64;

        owner.slots = claim_slots(&mut self.ring, volume_id, assured);
        owner.credit_cap = cap;
        owner.credits = owner.credits.min(cap);
        self.assured_total += assured;
        debug!(volume = %volume_id, slots = owner.slots.len(), "ring slots reassigned");
        self.owners.insert(volume_id, owner);
        self.refresh_ceiling(table, volume_id, now_ns);
    }

    /// Rebuilds the ring for a new total rate, re-placing queues in registration order.
    pub(crate) fn on_total_rate<T>(&mut self, table: &QueueTable<T>, now_ns: u64) {
        self.ring = vec![None; table.total_rate().min(MAX_RING_SLOTS) as usize];
        self.cursor = 0;
        for &volume_id in table.order() {
            let assured = table.get(volume_id).map_or(0, |q| q.params().assured_iops);
            let slots = claim_slots(&mut self.ring, volume_id, assured);
            if let Some(owner) = self.owners.get_mut(&volume_id) {
                owner.slots = slots;
            }
            self.refresh_ceiling(table, volume_id, now_ns);
        }
        debug!(ring = self.ring.len(), "slot ring rebuilt");
    }

    pub(crate) fn set_throttle_level<T>(&mut self, table: &QueueTable<T>, level: f64, now_ns: u64) {
        self.throttle_level = Some(level);
        for &volume_id in table.order() {
            self.refresh_ceiling(table, volume_id, now_ns);
        }
        let capped = self.owners.values().filter(|o| o.ceiling.is_some()).count();
        debug!(level, capped, "ceilings recomputed");
    }

    pub(crate) fn throttle_level(&self) -> Option<f64> {
        self.throttle_level
    }

    fn pace<T>(&mut self, table: &QueueTable<T>, now_ns: u64) -> Pace {
        if now_ns.saturating_sub(self.window_start_ns) >= self.tunables.window_ns {
            self.window_start_ns = now_ns;
            self.window_served = 0;
        }
        if self.assured_total == 0 {
            return Pace::OnTrack;
        }
        let guaranteed_waiting = table
            .iter()
            .any(|q| q.params().assured_iops > 0 && q.has_dispatchable());
        if !guaranteed_waiting {
            return Pace::OnTrack;
        }

        let elapsed_s = now_ns.saturating_sub(self.window_start_ns) as f64 / NS_PER_SEC;
        let expected = elapsed_s * self.assured_total as f64;
        let achieved = self.window_served as f64;
        if achieved < expected * self.tunables.behind {
            Pace::Behind
        } else if achieved > expected * self.tunables.ahead {
            Pace::Ahead
        } else {
            Pace::OnTrack
        }
    }

    /// Consumes up to `limit` ring slots looking for an owner with work.
    ///
    /// Owners whose slot comes up while they have nothing dispatchable earn
    /// credit. An owner over its ceiling loses the slot without earning credit.
    fn scan_ring<T>(&mut self, table: &QueueTable<T>, limit: usize, now_ns: u64) -> Option<VolumeId> {
        let n = self.ring.len();
        for _ in 0..limit {
            let slot = self.cursor;
            self.cursor = (self.cursor + 1) % n;
            let Some(owner_id) = self.ring[slot] else {
                continue;
            };
            if table.get(owner_id).is_some_and(|q| q.has_dispatchable()) {
                if self.under_ceiling(owner_id, now_ns) {
                    return Some(owner_id);
                }
                continue;
            }
            if let Some(owner) = self.owners.get_mut(&owner_id) {
                owner.credits = (owner.credits + 1).min(owner.credit_cap);
            }
        }
        None
    }

    /// Serves the dispatchable queue with the largest credit fraction.
    fn spend_credit<T>(&mut self, table: &QueueTable<T>, now_ns: u64) -> Option<VolumeId> {
        let mut best: Option<(f64, VolumeId)> = None;
        for queue in table.iter() {
            if !queue.has_dispatchable() || !self.under_ceiling(queue.volume_id(), now_ns) {
                continue;
            }
            let Some(owner) = self.owners.get(&queue.volume_id()) else {
                continue;
            };
            if owner.credits == 0 {
                continue;
            }
            let fraction = owner.credits as f64 / owner.credit_cap as f64;
            if best.map_or(true, |(b, _)| fraction > b) {
                best = Some((fraction, queue.volume_id()));
            }
        }

        let (_, volume_id) = best?;
        if let Some(owner) = self.owners.get_mut(&volume_id) {
            owner.credits -= 1;
        }
        Some(volume_id)
    }

    /// Priority round robin in registration order.
    ///
    /// The queue under the cursor keeps it for `priority_weight` consecutive
    /// dispatches; empty queues and queues over their ceiling are skipped.
    fn round_robin<T>(&mut self, table: &QueueTable<T>, now_ns: u64) -> Option<VolumeId> {
        let n = table.len();
        if n == 0 {
            return None;
        }
        self.rr_index %= n;
        if self.rr_served >= table.at(self.rr_index).params().priority_weight() {
            self.rr_index = (self.rr_index + 1) % n;
            self.rr_served = 0;
        }

        for step in 0..n {
            let idx = (self.rr_index + step) % n;
            let queue = table.at(idx);
            if !queue.has_dispatchable() || !self.under_ceiling(queue.volume_id(), now_ns) {
                continue;
            }
            if step > 0 {
                self.rr_index = idx;
                self.rr_served = 0;
            }
            self.rr_served += 1;
            return Some(queue.volume_id());
        }
        None
    }

    fn under_ceiling(&self, volume_id: VolumeId, now_ns: u64) -> bool {
        self.owners
            .get(&volume_id)
            .and_then(|owner| owner.ceiling.as_ref())
            .map_or(true, |bucket| bucket.has_tokens(1.0, now_ns))
    }

    /// Shortest wait until a queue held back by its ceiling may run again.
    fn ceiling_wait<T>(&self, table: &QueueTable<T>, now_ns: u64) -> Duration {
        table
            .iter()
            .filter(|queue| queue.has_dispatchable())
            .filter_map(|queue| {
                self.owners
                    .get(&queue.volume_id())?
                    .ceiling
                    .as_ref()?
                    .time_until(1.0, now_ns)
            })
            .min()
            .map_or(self.tunables.idle_poll, |ns| {
                Duration::from_nanos(ns.max(MIN_WAIT_NS))
            })
    }

    pub(crate) fn select<T>(&mut self, table: &QueueTable<T>, now_ns: u64) -> Selection {
        if self.ring.is_empty() || !table.any_dispatchable() {
            return Selection::Idle;
        }

        match self.pick(table, now_ns) {
            Some(volume_id) => {
                if let Some(bucket) = self
                    .owners
                    .get_mut(&volume_id)
                    .and_then(|owner| owner.ceiling.as_mut())
                {
                    bucket.try_consume(1.0, now_ns);
                }
                Selection::Queue(volume_id)
            }
            // Work is pending, so every pending queue is over its ceiling.
            None => Selection::Wait(self.ceiling_wait(table, now_ns)),
        }
    }

    fn pick<T>(&mut self, table: &QueueTable<T>, now_ns: u64) -> Option<VolumeId> {
        match self.pace(table, now_ns) {
            Pace::Ahead => {
                self.cursor = (self.cursor + 1) % self.ring.len();
            }
            pace => {
                let limit = if pace == Pace::Behind { self.ring.len() } else { 1 };
                if let Some(volume_id) = self.scan_ring(table, limit, now_ns) {
                    if let Some(owner) = self.owners.get_mut(&volume_id) {
                        owner.guaranteed_served += 1;
                    }
                    self.window_served += 1;
                    trace!(volume = %volume_id, "guaranteed slot");
                    return Some(volume_id);
                }
            }
        }

        if let Some(volume_id) = self.spend_credit(table, now_ns) {
            trace!(volume = %volume_id, "credit slot");
            return Some(volume_id);
        }
        let volume_id = self.round_robin(table, now_ns)?;
        trace!(volume = %volume_id, "priority round robin");
        Some(volume_id)
    }
}
