//! I/O tickets flowing through the QoS layer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Identifier of a volume registered with the QoS layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub u64);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vol-{}", self.0)
    }
}

/// Unique, monotonically assigned request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IoRequestId(pub u64);

/// Atomic counter for generating unique I/O request IDs.
#[derive(Debug)]
pub struct IoRequestIdGen {
    next: AtomicU64,
}

impl IoRequestIdGen {
    /// Create a new ID generator starting from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Generate the next unique request ID.
    pub fn next_id(&self) -> IoRequestId {
        IoRequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IoRequestIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// An I/O request waiting for, or holding, a dispatch slot.
///
/// The payload is opaque to the QoS layer and handed unchanged to the
/// [`IoProcessor`](crate::controller::IoProcessor).
#[derive(Debug, Clone)]
pub struct IoRequest<T> {
    /// Unique request identifier.
    pub id: IoRequestId,
    /// Volume the request is charged against.
    pub volume_id: VolumeId,
    /// Opaque payload for the execution layer.
    pub payload: T,
    /// Nanosecond timestamp when the request was enqueued.
    pub enqueue_ns: u64,
    /// Nanosecond timestamp when the request was dispatched.
    pub dispatch_ns: Option<u64>,
    /// Nanosecond timestamp when the request was marked done.
    pub completion_ns: Option<u64>,
    /// Registration epoch of the queue holding its outstanding slot; set on
    /// dispatch, cleared on completion.
    pub queue_epoch: Option<u64>,
}

impl<T> IoRequest<T> {
    /// Creates a request that has not been enqueued yet.
    pub fn new(id: IoRequestId, volume_id: VolumeId, payload: T) -> Self {
        Self {
            id,
            volume_id,
            payload,
            enqueue_ns: 0,
            dispatch_ns: None,
            completion_ns: None,
            queue_epoch: None,
        }
    }

    /// Returns wait/service/total latency once the request is complete.
    pub fn latency(&self) -> Option<IoLatency> {
        let dispatch = self.dispatch_ns?;
        let done = self.completion_ns?;
        Some(IoLatency {
            wait_ns: dispatch.saturating_sub(self.enqueue_ns),
            service_ns: done.saturating_sub(dispatch),
            total_ns: done.saturating_sub(self.enqueue_ns),
        })
    }
}

/// Latency breakdown of a completed request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoLatency {
    /// Time spent queued: dispatch - enqueue.
    pub wait_ns: u64,
    /// Time spent executing: done - dispatch.
    pub service_ns: u64,
    /// End to end: done - enqueue.
    pub total_ns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_id_display() {
        assert_eq!(format!("{}", VolumeId(42)), "vol-42");
    }

    #[test]
    fn test_id_gen_monotonic() {
        let ids = IoRequestIdGen::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_eq!(a, IoRequestId(1));
        assert!(b > a);
    }

    #[test]
    fn test_latency_requires_completion() {
        let mut req = IoRequest::new(IoRequestId(1), VolumeId(1), ());
        req.enqueue_ns = 100;
        assert!(req.latency().is_none());
        req.dispatch_ns = Some(250);
        assert!(req.latency().is_none());
        req.completion_ns = Some(1_000);

        let latency = req.latency().unwrap();
        assert_eq!(latency.wait_ns, 150);
        assert_eq!(latency.service_ns, 750);
        assert_eq!(latency.total_ns, 900);
    }
}
