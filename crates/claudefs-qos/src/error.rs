//! Error types for the QoS subsystem.

use thiserror::Error;

use crate::request::VolumeId;

/// Result type alias for QoS operations.
pub type QosResult<T> = Result<T, QosError>;

/// Error variants for QoS admission and dispatch operations.
#[derive(Debug, Error)]
pub enum QosError {
    /// Wraps standard I/O errors (worker pool or dispatch thread creation).
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The volume is already registered.
    #[error("Duplicate volume: {volume_id} is already registered")]
    DuplicateVolume {
        /// The volume that was registered twice.
        volume_id: VolumeId,
    },

    /// The volume is not registered.
    #[error("Volume not found: {volume_id}")]
    VolumeNotFound {
        /// The volume that was not found.
        volume_id: VolumeId,
    },

    /// The volume's pending queue is at capacity.
    #[error("Queue full: volume {volume_id} already holds {capacity} pending requests")]
    QueueFull {
        /// The volume whose queue is full.
        volume_id: VolumeId,
        /// The queue capacity.
        capacity: usize,
    },

    /// A completion does not match an outstanding request of the volume's
    /// current queue: it was already completed, never dispatched, or
    /// dispatched before the volume was re-registered.
    #[error("Stale completion: request {request_id} holds no outstanding slot on {volume_id}")]
    StaleCompletion {
        /// The volume named by the request.
        volume_id: VolumeId,
        /// The request being completed.
        request_id: u64,
    },

    /// The volume is suspended and does not accept new requests.
    #[error("Volume suspended: {volume_id}")]
    VolumeSuspended {
        /// The suspended volume.
        volume_id: VolumeId,
    },

    /// Admitting the request would push assured commitments above the total rate.
    #[error("Exceeds min IOPS: requested {requested} assured IOPS with {committed} committed, total rate {total_rate}")]
    ExceedsMinIops {
        /// Assured IOPS the operation asked for (or the new total rate).
        requested: u64,
        /// Assured IOPS already committed to other volumes.
        committed: u64,
        /// The dispatcher's aggregate rate.
        total_rate: u64,
    },

    /// The QoS parameters are inconsistent.
    #[error("Invalid QoS parameters: {reason}")]
    InvalidQosParams {
        /// Description of the problem.
        reason: String,
    },

    /// The throttle level is outside [-10, 10].
    #[error("Invalid throttle level: {level} (expected -10.0..=10.0)")]
    InvalidThrottleLevel {
        /// The rejected level.
        level: f64,
    },

    /// Invalid controller configuration.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },

    /// The dispatch loop is already running.
    #[error("Scheduler already running")]
    SchedulerRunning,

    /// The controller has been stopped.
    #[error("QoS controller is shutting down")]
    ShuttingDown,
}
