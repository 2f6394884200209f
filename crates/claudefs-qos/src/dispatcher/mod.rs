//! Dispatch algorithms behind a single handle.
//!
//! A [`Dispatcher`] exclusively owns the registered [`VolumeQueue`]s and one
//! scheduler variant. The queue table sits behind an `RwLock`: registration,
//! deregistration, policy and lifecycle changes take the write lock, enqueue,
//! completion and dispatch take the read lock. Scheduler state (slot ring,
//! credits, token buckets, cursors) sits behind a mutex that is always taken
//! after the table lock.

mod htb;
mod table;
mod wfq;

use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

pub use htb::{effective_rates, EffectiveRates, PROTECTIVE_MIN_RATE};
pub use wfq::MAX_RING_SLOTS;

use crate::config::{DispatchAlgorithm, QosConfig};
use crate::error::{QosError, QosResult};
use crate::request::{IoLatency, IoRequest, VolumeId};
use crate::volume_queue::{QosParams, QueueState, VolumeQueue};
use htb::HtbScheduler;
use table::QueueTable;
use wfq::{WfqScheduler, WfqTunables};

/// Lowest accepted throttle level.
pub const MIN_THROTTLE_LEVEL: f64 = -10.0;
/// Highest accepted throttle level.
pub const MAX_THROTTLE_LEVEL: f64 = 10.0;

/// Outcome of a scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Dispatch the head request of this volume.
    Queue(VolumeId),
    /// Work is pending but no tokens are available for this long.
    Wait(Duration),
    /// No registered queue has dispatchable work.
    Idle,
}

/// Outcome of [`Dispatcher::dispatch_next`].
#[derive(Debug)]
pub enum Dispatch<T> {
    /// A request moved from pending to outstanding.
    Ready(IoRequest<T>),
    /// Work is pending but rate limits hold it back for this long.
    Throttled(Duration),
    /// Nothing to dispatch.
    Idle,
}

enum Scheduler {
    WeightedFair(WfqScheduler),
    HierarchicalTokenBucket(HtbScheduler),
}

impl Scheduler {
    fn on_register<T>(&mut self, table: &QueueTable<T>, volume_id: VolumeId, now_ns: u64) {
        match self {
            Scheduler::WeightedFair(s) => s.on_register(table, volume_id, now_ns),
            Scheduler::HierarchicalTokenBucket(s) => s.on_register(table, volume_id, now_ns),
        }
    }

    fn on_deregister<T>(
        &mut self,
        table: &QueueTable<T>,
        volume_id: VolumeId,
        removed_idx: usize,
        now_ns: u64,
    ) {
        match self {
            Scheduler::WeightedFair(s) => s.on_deregister(volume_id, removed_idx, table.len()),
            Scheduler::HierarchicalTokenBucket(s) => {
                s.on_deregister(table, volume_id, removed_idx, now_ns)
            }
        }
    }

    fn on_modify<T>(&mut self, table: &QueueTable<T>, volume_id: VolumeId, now_ns: u64) {
        match self {
            Scheduler::WeightedFair(s) => s.on_modify(table, volume_id, now_ns),
            Scheduler::HierarchicalTokenBucket(s) => s.on_modify(table, volume_id, now_ns),
        }
    }

    fn check_total_rate(&self, total_rate: u64) -> QosResult<()> {
        match self {
            Scheduler::WeightedFair(s) => s.check_total_rate(total_rate),
            Scheduler::HierarchicalTokenBucket(_) => Ok(()),
        }
    }

    fn on_total_rate<T>(&mut self, table: &QueueTable<T>, now_ns: u64) {
        match self {
            Scheduler::WeightedFair(s) => s.on_total_rate(table, now_ns),
            Scheduler::HierarchicalTokenBucket(s) => s.on_total_rate(table, now_ns),
        }
    }

    fn set_throttle_level<T>(&mut self, table: &QueueTable<T>, level: f64, now_ns: u64) {
        match self {
            Scheduler::WeightedFair(s) => s.set_throttle_level(table, level, now_ns),
            Scheduler::HierarchicalTokenBucket(s) => s.set_throttle_level(table, level, now_ns),
        }
    }

    fn throttle_level(&self) -> Option<f64> {
        match self {
            Scheduler::WeightedFair(s) => s.throttle_level(),
            Scheduler::HierarchicalTokenBucket(s) => s.throttle_level(),
        }
    }

    fn select<T>(&mut self, table: &QueueTable<T>, now_ns: u64) -> Selection {
        match self {
            Scheduler::WeightedFair(s) => s.select(table, now_ns),
            Scheduler::HierarchicalTokenBucket(s) => s.select(table, now_ns),
        }
    }
}

/// The active dispatch algorithm and the queues it schedules.
pub struct Dispatcher<T> {
    algorithm: DispatchAlgorithm,
    table: RwLock<QueueTable<T>>,
    sched: Mutex<Scheduler>,
}

impl<T> Dispatcher<T> {
    /// Creates an empty dispatcher running `config.algorithm`.
    pub fn new(config: &QosConfig, now_ns: u64) -> QosResult<Self> {
        config.validate()?;
        let sched = match config.algorithm {
            DispatchAlgorithm::WeightedFair => {
                let wfq = WfqScheduler::new(
                    config.total_rate,
                    WfqTunables::from_config(config),
                    now_ns,
                );
                wfq.check_total_rate(config.total_rate)?;
                Scheduler::WeightedFair(wfq)
            }
            DispatchAlgorithm::HierarchicalTokenBucket => {
                Scheduler::HierarchicalTokenBucket(HtbScheduler::new(config, now_ns))
            }
        };
        info!(
            algorithm = %config.algorithm,
            total_rate = config.total_rate,
            "dispatcher created"
        );
        Ok(Self {
            algorithm: config.algorithm,
            table: RwLock::new(QueueTable::new(config.total_rate)),
            sched: Mutex::new(sched),
        })
    }

    /// Returns the algorithm in use.
    pub fn algorithm(&self) -> DispatchAlgorithm {
        self.algorithm
    }

    /// Admits a queue.
    ///
    /// Fails with `DuplicateVolume` or `ExceedsMinIops` without changing any
    /// state. The queue keeps its lifecycle state; callers activate it.
    pub fn register_queue(&self, queue: VolumeQueue<T>, now_ns: u64) -> QosResult<()> {
        let volume_id = queue.volume_id();
        let params = queue.params();

        let mut table = self.table.write();
        table.insert(queue)?;
        self.sched.lock().on_register(&table, volume_id, now_ns);

        info!(
            volume = %volume_id,
            assured_iops = params.assured_iops,
            throttle_iops = params.throttle_iops,
            priority = params.priority,
            committed = table.total_min_rate(),
            "queue registered"
        );
        Ok(())
    }

    /// Removes a queue and releases its reservations. The queue is returned
    /// with whatever it still holds.
    pub fn deregister_queue(&self, volume_id: VolumeId, now_ns: u64) -> QosResult<VolumeQueue<T>> {
        let mut table = self.table.write();
        let (idx, queue) = table.remove(volume_id)?;
        self.sched.lock().on_deregister(&table, volume_id, idx, now_ns);

        info!(
            volume = %volume_id,
            pending = queue.count(),
            outstanding = queue.outstanding(),
            committed = table.total_min_rate(),
            "queue deregistered"
        );
        Ok(queue)
    }

    /// Replaces a queue's policy.
    ///
    /// Admission is checked on the assured-rate delta; on failure nothing changes.
    /// Scheduler reservations are rebuilt under the same write lock.
    pub fn modify_queue_qos_params(
        &self,
        volume_id: VolumeId,
        params: QosParams,
        now_ns: u64,
    ) -> QosResult<()> {
        let mut table = self.table.write();
        let old = table.update_params(volume_id, params)?;
        self.sched.lock().on_modify(&table, volume_id, now_ns);

        info!(
            volume = %volume_id,
            old_assured = old.assured_iops,
            assured_iops = params.assured_iops,
            throttle_iops = params.throttle_iops,
            priority = params.priority,
            "queue QoS params modified"
        );
        Ok(())
    }

    /// Changes the aggregate rate. Fails with `ExceedsMinIops` below the
    /// committed assured total.
    pub fn modify_total_rate(&self, total_rate: u64, now_ns: u64) -> QosResult<()> {
        let mut table = self.table.write();
        let mut sched = self.sched.lock();
        sched.check_total_rate(total_rate)?;
        let old = table.total_rate();
        table.set_total_rate(total_rate)?;
        sched.on_total_rate(&table, now_ns);
        info!(old, total_rate, "total rate modified");
        Ok(())
    }

    /// Applies a global throttle level in `[-10, 10]`.
    pub fn set_throttle_level(&self, level: f64, now_ns: u64) -> QosResult<()> {
        if !level.is_finite() || !(MIN_THROTTLE_LEVEL..=MAX_THROTTLE_LEVEL).contains(&level) {
            return Err(QosError::InvalidThrottleLevel { level });
        }
        let table = self.table.read();
        self.sched.lock().set_throttle_level(&table, level, now_ns);
        info!(level, "throttle level set");
        Ok(())
    }

    /// Current throttle level; `None` until one has been set.
    pub fn throttle_level(&self) -> Option<f64> {
        self.sched.lock().throttle_level()
    }

    /// Picks the next queue to serve and charges it (slot, credit or token).
    ///
    /// The caller must dequeue from the returned volume;
    /// [`dispatch_next`](Self::dispatch_next) does both under one lock.
    pub fn next_queue_for_dispatch(&self, now_ns: u64) -> Selection {
        let table = self.table.read();
        let mut sched = self.sched.lock();
        sched.select(&table, now_ns)
    }

    /// Selects a queue and moves its head request to outstanding.
    ///
    /// # Panics
    ///
    /// Panics if the selected queue yields no request. Lifecycle changes and
    /// drains hold the write lock, so that can only mean a broken scheduler.
    pub fn dispatch_next(&self, now_ns: u64) -> Dispatch<T> {
        let table = self.table.read();
        let mut sched = self.sched.lock();
        match sched.select(&table, now_ns) {
            Selection::Queue(volume_id) => {
                let request = table
                    .get(volume_id)
                    .and_then(|queue| queue.dequeue(now_ns))
                    .unwrap_or_else(|| panic!("selected {} has nothing to dispatch", volume_id));
                Dispatch::Ready(request)
            }
            Selection::Wait(wait) => Dispatch::Throttled(wait),
            Selection::Idle => Dispatch::Idle,
        }
    }

    /// Appends a request to its volume's queue.
    pub fn enqueue(&self, request: IoRequest<T>, now_ns: u64) -> QosResult<()> {
        let table = self.table.read();
        table.require(request.volume_id)?.enqueue(request, now_ns)
    }

    /// Releases the outstanding slot held by a dispatched request.
    ///
    /// Fails with `VolumeNotFound` once the volume is gone, and with
    /// `StaleCompletion` if the request belongs to an earlier registration of
    /// the volume or was already completed.
    pub fn mark_io_done(&self, request: &mut IoRequest<T>, now_ns: u64) -> QosResult<IoLatency> {
        let table = self.table.read();
        table.require(request.volume_id)?.mark_done(request, now_ns)
    }

    /// Makes a registered queue dispatchable.
    pub fn activate(&self, volume_id: VolumeId) -> QosResult<()> {
        self.table.write().require(volume_id)?.activate();
        Ok(())
    }

    /// Pauses dispatching from a queue; enqueues are still accepted.
    pub fn quiesce(&self, volume_id: VolumeId) -> QosResult<()> {
        self.table.write().require(volume_id)?.quiesce();
        Ok(())
    }

    /// Quiesces every registered queue.
    pub fn quiesce_all(&self) {
        let table = self.table.write();
        for queue in table.iter() {
            queue.quiesce();
        }
        debug!(queues = table.len(), "all queues quiesced");
    }

    /// Resumes a quiesced queue. Returns false if it was not quiesced.
    pub fn resume(&self, volume_id: VolumeId) -> QosResult<bool> {
        Ok(self.table.write().require(volume_id)?.resume())
    }

    /// Stops both admission and dispatch for a queue.
    pub fn suspend(&self, volume_id: VolumeId) -> QosResult<()> {
        self.table.write().require(volume_id)?.suspend();
        Ok(())
    }

    /// Takes every pending request out of a queue.
    pub fn drain_pending(&self, volume_id: VolumeId) -> QosResult<Vec<IoRequest<T>>> {
        Ok(self.table.write().require(volume_id)?.drain_pending())
    }

    /// Pending requests of one volume.
    pub fn pending_count(&self, volume_id: VolumeId) -> QosResult<usize> {
        Ok(self.table.read().require(volume_id)?.count())
    }

    /// Outstanding requests of one volume.
    pub fn outstanding_count(&self, volume_id: VolumeId) -> QosResult<usize> {
        Ok(self.table.read().require(volume_id)?.outstanding())
    }

    /// Requests ever dispatched from one volume.
    pub fn dispatched_total(&self, volume_id: VolumeId) -> QosResult<u64> {
        Ok(self.table.read().require(volume_id)?.dispatched_total())
    }

    /// Lifecycle state of one volume.
    pub fn queue_state(&self, volume_id: VolumeId) -> QosResult<QueueState> {
        Ok(self.table.read().require(volume_id)?.state())
    }

    /// QoS policy of one volume.
    pub fn queue_params(&self, volume_id: VolumeId) -> QosResult<QosParams> {
        Ok(self.table.read().require(volume_id)?.params())
    }

    /// Pending and outstanding counts of one volume.
    pub fn queue_depth(&self, volume_id: VolumeId) -> QosResult<(usize, usize)> {
        let table = self.table.read();
        let queue = table.require(volume_id)?;
        Ok((queue.count(), queue.outstanding()))
    }

    /// Registered volumes in registration order.
    pub fn volume_ids(&self) -> Vec<VolumeId> {
        self.table.read().order().to_vec()
    }

    /// Number of registered queues.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// True if no queue is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate rate budget.
    pub fn total_rate(&self) -> u64 {
        self.table.read().total_rate()
    }

    /// Sum of assured rates of registered queues.
    pub fn total_min_rate(&self) -> u64 {
        self.table.read().total_min_rate()
    }

    /// Pending requests across all queues.
    pub fn total_pending(&self) -> usize {
        self.table.read().iter().map(|q| q.count()).sum()
    }

    /// Outstanding requests across all queues.
    pub fn total_outstanding(&self) -> usize {
        self.table.read().iter().map(|q| q.outstanding()).sum()
    }

    /// True if some queue is active with pending work.
    pub fn has_dispatchable(&self) -> bool {
        self.table.read().any_dispatchable()
    }
}
