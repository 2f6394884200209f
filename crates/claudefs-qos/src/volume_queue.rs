//! Per-volume bounded FIFO with QoS policy and lifecycle state.
//!
//! Pending requests sit behind a short-lived mutex; the pending/outstanding
//! counters and the lifecycle state are atomics so that enqueuers, the dispatch
//! loop and completion callbacks never contend on the dispatcher's queue map.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{QosError, QosResult};
use crate::request::{IoLatency, IoRequest, VolumeId};

/// Highest priority (served first for spare capacity).
pub const HIGHEST_PRIORITY: u8 = 1;
/// Lowest priority.
pub const LOWEST_PRIORITY: u8 = 10;

/// QoS policy of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosParams {
    /// Minimum guaranteed IOPS.
    pub assured_iops: u64,
    /// Maximum IOPS (0 = unbounded).
    pub throttle_iops: u64,
    /// Relative priority, 1 (highest) to 10 (lowest).
    pub priority: u8,
}

impl QosParams {
    /// Creates a new policy.
    pub fn new(assured_iops: u64, throttle_iops: u64, priority: u8) -> Self {
        Self {
            assured_iops,
            throttle_iops,
            priority,
        }
    }

    /// Checks priority range and `assured <= throttle` when throttle is bounded.
    pub fn validate(&self) -> QosResult<()> {
        if !(HIGHEST_PRIORITY..=LOWEST_PRIORITY).contains(&self.priority) {
            return Err(QosError::InvalidQosParams {
                reason: format!(
                    "priority {} outside {}..={}",
                    self.priority, HIGHEST_PRIORITY, LOWEST_PRIORITY
                ),
            });
        }
        if self.is_bounded() && self.assured_iops > self.throttle_iops {
            return Err(QosError::InvalidQosParams {
                reason: format!(
                    "assured {} IOPS exceeds throttle {} IOPS",
                    self.assured_iops, self.throttle_iops
                ),
            });
        }
        Ok(())
    }

    /// Returns true if the volume has a maximum rate.
    #[inline]
    pub fn is_bounded(&self) -> bool {
        self.throttle_iops > 0
    }

    /// Consecutive round-robin dispatches allowed for this priority.
    #[inline]
    pub fn priority_weight(&self) -> u32 {
        u32::from(LOWEST_PRIORITY + 1 - self.priority.clamp(HIGHEST_PRIORITY, LOWEST_PRIORITY))
    }
}

impl Default for QosParams {
    fn default() -> Self {
        Self {
            assured_iops: 0,
            throttle_iops: 0,
            priority: LOWEST_PRIORITY,
        }
    }
}

/// Lifecycle state of a volume queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum QueueState {
    /// Registered but not yet activated.
    Init = 0,
    /// Accepting and dispatching requests.
    Active = 1,
    /// Accepting requests but not dispatching; in-flight work completes.
    Quiesced = 2,
    /// Neither accepting nor dispatching.
    Suspended = 3,
}

impl From<u8> for QueueState {
    fn from(value: u8) -> Self {
        match value {
            1 => QueueState::Active,
            2 => QueueState::Quiesced,
            3 => QueueState::Suspended,
            _ => QueueState::Init,
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueState::Init => write!(f, "Init"),
            QueueState::Active => write!(f, "Active"),
            QueueState::Quiesced => write!(f, "Quiesced"),
            QueueState::Suspended => write!(f, "Suspended"),
        }
    }
}

/// Bounded FIFO of pending requests for one volume.
pub struct VolumeQueue<T> {
    volume_id: VolumeId,
    params: QosParams,
    capacity: usize,
    state: AtomicU8,
    pending: Mutex<VecDeque<IoRequest<T>>>,
    pending_count: AtomicUsize,
    outstanding_count: AtomicUsize,
    dispatched_total: AtomicU64,
    epoch: u64,
}

impl<T> VolumeQueue<T> {
    /// Creates a queue in the `Init` state.
    pub fn new(volume_id: VolumeId, params: QosParams, capacity: usize) -> QosResult<Self> {
        params.validate()?;
        if capacity == 0 {
            return Err(QosError::InvalidQosParams {
                reason: format!("queue capacity for {} must be non-zero", volume_id),
            });
        }
        Ok(Self {
            volume_id,
            params,
            capacity,
            state: AtomicU8::new(QueueState::Init as u8),
            pending: Mutex::new(VecDeque::new()),
            pending_count: AtomicUsize::new(0),
            outstanding_count: AtomicUsize::new(0),
            dispatched_total: AtomicU64::new(0),
            epoch: 0,
        })
    }

    /// Returns the volume this queue belongs to.
    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    /// Returns the current QoS policy.
    pub fn params(&self) -> QosParams {
        self.params
    }

    /// Returns the maximum number of pending requests.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registration epoch; 0 until a dispatcher admits the queue.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> QueueState {
        QueueState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: QueueState) -> QueueState {
        let old = QueueState::from(self.state.swap(state as u8, Ordering::AcqRel));
        if old != state {
            debug!(volume = %self.volume_id, from = %old, to = %state, "queue state change");
        }
        old
    }

    /// Marks the queue dispatchable.
    pub fn activate(&self) {
        self.set_state(QueueState::Active);
    }

    /// Stops dispatching from this queue. Outstanding requests still complete.
    pub fn quiesce(&self) {
        self.set_state(QueueState::Quiesced);
    }

    /// Returns a quiesced queue to `Active`. Returns false if it was not quiesced.
    pub fn resume(&self) -> bool {
        self.state
            .compare_exchange(
                QueueState::Quiesced as u8,
                QueueState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Stops both admission and dispatch.
    pub fn suspend(&self) {
        self.set_state(QueueState::Suspended);
    }

    /// Appends a request to the tail and stamps its enqueue time.
    pub fn enqueue(&self, mut request: IoRequest<T>, now_ns: u64) -> QosResult<()> {
        if self.state() == QueueState::Suspended {
            return Err(QosError::VolumeSuspended {
                volume_id: self.volume_id,
            });
        }

        let mut pending = self.pending.lock();
        if pending.len() >= self.capacity {
            return Err(QosError::QueueFull {
                volume_id: self.volume_id,
                capacity: self.capacity,
            });
        }
        request.enqueue_ns = now_ns;
        trace!(volume = %self.volume_id, id = request.id.0, depth = pending.len() + 1, "enqueued");
        pending.push_back(request);
        self.pending_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Pops the head request and moves it to outstanding accounting.
    ///
    /// Returns `None` if the queue is empty or not `Active`.
    pub fn dequeue(&self, now_ns: u64) -> Option<IoRequest<T>> {
        if self.state() != QueueState::Active {
            return None;
        }

        let mut request = {
            let mut pending = self.pending.lock();
            let request = pending.pop_front()?;
            self.pending_count.fetch_sub(1, Ordering::AcqRel);
            self.outstanding_count.fetch_add(1, Ordering::AcqRel);
            request
        };
        self.dispatched_total.fetch_add(1, Ordering::Relaxed);
        request.dispatch_ns = Some(now_ns);
        request.queue_epoch = Some(self.epoch);
        Some(request)
    }

    /// Releases the outstanding slot held by `request` and stamps its completion.
    ///
    /// Fails with `StaleCompletion`, leaving the counters alone, unless the
    /// request was dispatched by this queue and not completed since.
    ///
    /// # Panics
    ///
    /// Panics if a request carrying this queue's epoch finds no outstanding
    /// slot to release. The count is left at zero.
    pub fn mark_done(&self, request: &mut IoRequest<T>, now_ns: u64) -> QosResult<IoLatency> {
        if request.queue_epoch != Some(self.epoch) {
            return Err(QosError::StaleCompletion {
                volume_id: self.volume_id,
                request_id: request.id.0,
            });
        }
        let released = self
            .outstanding_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        assert!(
            released.is_ok(),
            "outstanding count underflow on {} (request {})",
            self.volume_id,
            request.id.0
        );
        request.queue_epoch = None;
        request.completion_ns = Some(now_ns);
        Ok(request.latency().unwrap_or_default())
    }

    /// Replaces the QoS policy without touching pending requests.
    pub fn modify_qos_params(&mut self, params: QosParams) -> QosResult<()> {
        params.validate()?;
        self.params = params;
        Ok(())
    }

    /// Removes and returns every pending request, oldest first.
    pub fn drain_pending(&self) -> Vec<IoRequest<T>> {
        let mut pending = self.pending.lock();
        let drained: Vec<_> = pending.drain(..).collect();
        self.pending_count.fetch_sub(drained.len(), Ordering::AcqRel);
        drained
    }

    /// Number of pending requests.
    pub fn count(&self) -> usize {
        self.pending_count.load(Ordering::Acquire)
    }

    /// Number of dispatched requests not yet marked done.
    pub fn outstanding(&self) -> usize {
        self.outstanding_count.load(Ordering::Acquire)
    }

    /// Total requests ever dispatched from this queue.
    pub fn dispatched_total(&self) -> u64 {
        self.dispatched_total.load(Ordering::Relaxed)
    }

    /// True when the queue is `Active` and has pending work.
    #[inline]
    pub fn has_dispatchable(&self) -> bool {
        self.count() > 0 && self.state() == QueueState::Active
    }

    /// True when nothing is pending or outstanding; the queue can be removed safely.
    pub fn is_drained(&self) -> bool {
        self.count() == 0 && self.outstanding() == 0
    }
}

impl<T> fmt::Debug for VolumeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeQueue")
            .field("volume_id", &self.volume_id)
            .field("params", &self.params)
            .field("capacity", &self.capacity)
            .field("state", &self.state())
            .field("pending", &self.count())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::IoRequestId;

    fn req(id: u64) -> IoRequest<u64> {
        IoRequest::new(IoRequestId(id), VolumeId(1), id)
    }

    fn active_queue(capacity: usize) -> VolumeQueue<u64> {
        let q = VolumeQueue::new(VolumeId(1), QosParams::new(10, 100, 3), capacity).unwrap();
        q.activate();
        q
    }

    #[test]
    fn test_params_validate() {
        assert!(QosParams::new(10, 100, 1).validate().is_ok());
        assert!(QosParams::new(10, 0, 10).validate().is_ok());
        assert!(QosParams::new(200, 100, 1).validate().is_err());
        assert!(QosParams::new(10, 100, 0).validate().is_err());
        assert!(QosParams::new(10, 100, 11).validate().is_err());
    }

    #[test]
    fn test_priority_weight() {
        assert_eq!(QosParams::new(0, 0, 1).priority_weight(), 10);
        assert_eq!(QosParams::new(0, 0, 5).priority_weight(), 6);
        assert_eq!(QosParams::new(0, 0, 10).priority_weight(), 1);
    }

    #[test]
    fn test_queue_state_from_u8() {
        assert_eq!(QueueState::from(0), QueueState::Init);
        assert_eq!(QueueState::from(1), QueueState::Active);
        assert_eq!(QueueState::from(2), QueueState::Quiesced);
        assert_eq!(QueueState::from(3), QueueState::Suspended);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = VolumeQueue::<u64>::new(VolumeId(1), QosParams::default(), 0);
        assert!(matches!(result, Err(QosError::InvalidQosParams { .. })));
    }

    #[test]
    fn test_fifo_order() {
        let q = active_queue(8);
        for i in 0..5 {
            q.enqueue(req(i), i * 10).unwrap();
        }
        assert_eq!(q.count(), 5);
        for i in 0..5 {
            let r = q.dequeue(100).unwrap();
            assert_eq!(r.payload, i);
            assert_eq!(r.enqueue_ns, i * 10);
            assert_eq!(r.dispatch_ns, Some(100));
        }
        assert!(q.dequeue(100).is_none());
    }

    #[test]
    fn test_enqueue_full() {
        let q = active_queue(2);
        q.enqueue(req(1), 0).unwrap();
        q.enqueue(req(2), 0).unwrap();
        let err = q.enqueue(req(3), 0).unwrap_err();
        assert!(matches!(err, QosError::QueueFull { capacity: 2, .. }));
        assert_eq!(q.count(), 2);
    }

    #[test]
    fn test_enqueue_suspended() {
        let q = active_queue(2);
        q.suspend();
        assert!(matches!(
            q.enqueue(req(1), 0),
            Err(QosError::VolumeSuspended { .. })
        ));
        assert!(q.dequeue(0).is_none());
    }

    #[test]
    fn test_init_queue_not_dispatchable() {
        let q = VolumeQueue::new(VolumeId(1), QosParams::default(), 4).unwrap();
        q.enqueue(req(1), 0).unwrap();
        assert!(!q.has_dispatchable());
        assert!(q.dequeue(0).is_none());
        q.activate();
        assert!(q.has_dispatchable());
    }

    #[test]
    fn test_outstanding_accounting() {
        let q = active_queue(4);
        q.enqueue(req(1), 0).unwrap();
        q.enqueue(req(2), 0).unwrap();

        let mut a = q.dequeue(10).unwrap();
        assert_eq!(q.outstanding(), 1);
        let mut b = q.dequeue(20).unwrap();
        assert_eq!(q.outstanding(), 2);

        let latency = q.mark_done(&mut a, 110).unwrap();
        assert_eq!(latency.wait_ns, 10);
        assert_eq!(latency.service_ns, 100);
        assert_eq!(q.outstanding(), 1);

        q.mark_done(&mut b, 30).unwrap();
        assert_eq!(q.outstanding(), 0);
        assert!(q.is_drained());
        assert_eq!(q.dispatched_total(), 2);
    }

    #[test]
    fn test_mark_done_rejects_undispatched_and_repeated() {
        let q = active_queue(4);
        let mut never_dispatched = req(1);
        assert!(matches!(
            q.mark_done(&mut never_dispatched, 0),
            Err(QosError::StaleCompletion { request_id: 1, .. })
        ));

        q.enqueue(req(2), 0).unwrap();
        let mut r = q.dequeue(5).unwrap();
        assert_eq!(r.queue_epoch, Some(q.epoch()));
        q.mark_done(&mut r, 10).unwrap();
        assert!(matches!(
            q.mark_done(&mut r, 20),
            Err(QosError::StaleCompletion { .. })
        ));
        assert_eq!(q.outstanding(), 0);
        assert_eq!(r.completion_ns, Some(10));
    }

    #[test]
    fn test_mark_done_underflow_panics_without_wrapping() {
        let q = active_queue(4);
        let mut forged = req(1);
        forged.queue_epoch = Some(q.epoch());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            q.mark_done(&mut forged, 0)
        }));
        assert!(result.is_err());
        assert_eq!(q.outstanding(), 0);
    }

    #[test]
    fn test_quiesce_blocks_dequeue_and_resume() {
        let q = active_queue(8);
        for i in 0..5 {
            q.enqueue(req(i), 0).unwrap();
        }
        q.quiesce();
        assert_eq!(q.state(), QueueState::Quiesced);
        assert!(q.dequeue(0).is_none());
        assert_eq!(q.count(), 5);

        assert!(q.resume());
        assert!(!q.resume());
        assert!(q.dequeue(0).is_some());
    }

    #[test]
    fn test_drain_pending() {
        let q = active_queue(8);
        for i in 0..5 {
            q.enqueue(req(i), 0).unwrap();
        }
        q.quiesce();
        let drained = q.drain_pending();
        assert_eq!(drained.len(), 5);
        assert_eq!(drained[0].payload, 0);
        assert_eq!(q.count(), 0);
        assert!(q.is_drained());
    }

    #[test]
    fn test_modify_qos_params_keeps_pending() {
        let mut q = active_queue(8);
        q.enqueue(req(1), 0).unwrap();
        q.modify_qos_params(QosParams::new(50, 0, 1)).unwrap();
        assert_eq!(q.params().assured_iops, 50);
        assert_eq!(q.count(), 1);
        assert!(q.modify_qos_params(QosParams::new(50, 10, 1)).is_err());
        assert_eq!(q.params().assured_iops, 50);
    }
}
