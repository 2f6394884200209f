#![warn(missing_docs)]

//! ClaudeFS QoS subsystem: per-volume admission and dispatch, WFQ and HTB schedulers
//!
//! This crate sits between the client-facing request path and the storage
//! pipeline of a node. Requests are queued per volume and released so that
//! every volume gets at least its assured IOPS, no volume exceeds its
//! throttle IOPS, and spare capacity is shared by priority.

pub mod clock;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod request;
pub mod stats;
pub mod token_bucket;
pub mod volume_queue;

pub use clock::QosClock;
pub use config::{DispatchAlgorithm, QosConfig, VolumeConfig};
pub use controller::{InFlightIo, IoProcessor, QosController};
pub use dispatcher::{
    effective_rates, Dispatch, Dispatcher, EffectiveRates, Selection, MAX_THROTTLE_LEVEL,
    MIN_THROTTLE_LEVEL,
};
pub use error::{QosError, QosResult};
pub use request::{IoLatency, IoRequest, IoRequestId, IoRequestIdGen, VolumeId};
pub use stats::{
    Metric, MetricType, MetricValue, NoopStatsSink, QosMetrics, RejectReason, StatsSink,
    VolumeStats,
};
pub use token_bucket::TokenBucket;
pub use volume_queue::{QosParams, QueueState, VolumeQueue, HIGHEST_PRIORITY, LOWEST_PRIORITY};
