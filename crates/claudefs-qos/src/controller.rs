//! QoS controller: admission front end, dispatch loop and worker pool.
//!
//! Callers register volumes and enqueue requests; a dedicated dispatch thread
//! asks the [`Dispatcher`] for the next request and hands it to a tokio
//! blocking pool, where the injected [`IoProcessor`] starts it. The request
//! travels as an [`InFlightIo`], which keeps its outstanding slot until the
//! processor calls [`InFlightIo::complete`] or drops it. Completion releases
//! the slot and reports latency to the [`StatsSink`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, error, info, trace, warn};

use crate::clock::QosClock;
use crate::config::QosConfig;
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::error::{QosError, QosResult};
use crate::request::{IoLatency, IoRequest, IoRequestIdGen, VolumeId};
use crate::stats::{RejectReason, StatsSink};
use crate::volume_queue::{QosParams, QueueState, VolumeQueue};

/// How long `stop` waits for in-flight requests before abandoning the pool.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Executes admitted requests.
///
/// Called on a worker thread once the dispatcher releases a request. The
/// request may outlive the call: a processor that hands it to an async
/// device keeps the [`InFlightIo`] and completes it later.
pub trait IoProcessor<T: Send + 'static>: Send + Sync + 'static {
    /// Starts the I/O held by `io`.
    fn process_io(&self, io: InFlightIo<T>);
}

/// Plain closures run synchronously and complete the request on return.
impl<T, F> IoProcessor<T> for F
where
    T: Send + 'static,
    F: Fn(&IoRequest<T>) + Send + Sync + 'static,
{
    fn process_io(&self, io: InFlightIo<T>) {
        self(io.request());
        let _ = io.complete();
    }
}

/// A request handed to an [`IoProcessor`], holding its outstanding slot.
///
/// Dropping it without calling [`complete`](Self::complete), including while
/// unwinding, completes the request and logs a warning.
pub struct InFlightIo<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    request: Option<IoRequest<T>>,
    inline: bool,
}

impl<T: Send + 'static> InFlightIo<T> {
    fn new(inner: Arc<Inner<T>>, request: IoRequest<T>, inline: bool) -> Self {
        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            inner,
            request: Some(request),
            inline,
        }
    }

    /// The request being executed.
    pub fn request(&self) -> &IoRequest<T> {
        match &self.request {
            Some(request) => request,
            None => unreachable!("request taken before the handle was dropped"),
        }
    }

    /// Mutable access to the request payload, e.g. to fill a read buffer.
    pub fn payload_mut(&mut self) -> &mut T {
        match &mut self.request {
            Some(request) => &mut request.payload,
            None => unreachable!("request taken before the handle was dropped"),
        }
    }

    /// Marks the request done, records its latency and frees its slot.
    pub fn complete(mut self) -> QosResult<IoLatency> {
        match self.request.take() {
            Some(mut request) => self.finish(&mut request),
            None => unreachable!("request taken before the handle was dropped"),
        }
    }

    fn finish(&self, request: &mut IoRequest<T>) -> QosResult<IoLatency> {
        let result = if self.inline {
            Ok(self.inner.complete_inline(request))
        } else {
            self.inner.complete(request)
        };
        if let Err(e) = &result {
            warn!(volume = %request.volume_id, id = request.id.0, error = %e, "completion not recorded");
        }
        result
    }
}

impl<T: Send + 'static> Drop for InFlightIo<T> {
    fn drop(&mut self) {
        if let Some(mut request) = self.request.take() {
            warn!(volume = %request.volume_id, id = request.id.0, "request dropped before completion");
            let _ = self.finish(&mut request);
        }
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.inner.signal.notify();
    }
}

/// Generation counter plus condvar; the dispatch loop parks on it.
///
/// A waiter records the generation before looking for work, so a notify that
/// lands between the check and the park is not lost.
struct WorkSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WorkSignal {
    fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    fn wait_since(&self, seen: u64, timeout: Duration) {
        let mut generation = self.generation.lock();
        if *generation != seen {
            return;
        }
        self.cond.wait_for(&mut generation, timeout);
    }
}

struct Inner<T: Send + 'static> {
    config: QosConfig,
    dispatcher: Dispatcher<T>,
    processor: Arc<dyn IoProcessor<T>>,
    stats: Arc<dyn StatsSink>,
    clock: QosClock,
    ids: IoRequestIdGen,
    in_flight: AtomicUsize,
    shutdown: AtomicBool,
    signal: WorkSignal,
}

impl<T: Send + 'static> Inner<T> {
    fn record_depth(&self, volume_id: VolumeId) {
        if let Ok((pending, outstanding)) = self.dispatcher.queue_depth(volume_id) {
            self.stats.record_queue_depth(volume_id, pending, outstanding);
        }
    }

    fn complete(&self, request: &mut IoRequest<T>) -> QosResult<IoLatency> {
        let latency = self.dispatcher.mark_io_done(request, self.clock.now_ns())?;
        self.stats.record_latency(request.volume_id, &latency);
        self.record_depth(request.volume_id);
        trace!(
            volume = %request.volume_id,
            id = request.id.0,
            wait_ns = latency.wait_ns,
            service_ns = latency.service_ns,
            "request done"
        );
        Ok(latency)
    }

    fn complete_inline(&self, request: &mut IoRequest<T>) -> IoLatency {
        request.completion_ns = Some(self.clock.now_ns());
        let latency = request.latency().unwrap_or_default();
        self.stats.record_latency(request.volume_id, &latency);
        latency
    }
}

fn dispatch_loop<T: Send + 'static>(inner: Arc<Inner<T>>, workers: Handle) {
    info!(algorithm = %inner.dispatcher.algorithm(), "dispatch loop started");
    let cap = inner.config.max_outstanding_ios;
    let idle_wait = inner.config.idle_wait();

    while !inner.shutdown.load(Ordering::Acquire) {
        let seen = inner.signal.generation();

        if cap > 0 && inner.in_flight.load(Ordering::Acquire) >= cap {
            inner.signal.wait_since(seen, idle_wait);
            continue;
        }

        match inner.dispatcher.dispatch_next(inner.clock.now_ns()) {
            Dispatch::Ready(request) => {
                inner.record_depth(request.volume_id);
                trace!(volume = %request.volume_id, id = request.id.0, "dispatched");
                let io = InFlightIo::new(Arc::clone(&inner), request, false);
                let processor = Arc::clone(&inner.processor);
                workers.spawn_blocking(move || processor.process_io(io));
            }
            Dispatch::Throttled(wait) => inner.signal.wait_since(seen, wait.min(idle_wait)),
            Dispatch::Idle => inner.signal.wait_since(seen, idle_wait),
        }
    }
    info!("dispatch loop stopped");
}

/// Per-node QoS front end.
///
/// Owns the dispatcher, the dispatch thread and the worker runtime. Dropping
/// the controller stops it.
pub struct QosController<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    runtime: Mutex<Option<Runtime>>,
    dispatch_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> QosController<T> {
    /// Builds the dispatcher and the worker runtime. The dispatch loop is not
    /// started until [`run_scheduler`](Self::run_scheduler).
    pub fn new(
        config: QosConfig,
        processor: Arc<dyn IoProcessor<T>>,
        stats: Arc<dyn StatsSink>,
    ) -> QosResult<Self> {
        let clock = QosClock::new();
        let dispatcher = Dispatcher::new(&config, clock.now_ns())?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.worker_threads)
            .thread_name("cfs-qos-worker")
            .enable_all()
            .build()?;

        if config.bypass_dispatcher {
            warn!("dispatcher bypass enabled: requests run inline with no QoS guarantees");
        }
        info!(
            algorithm = %config.algorithm,
            total_rate = config.total_rate,
            workers = config.worker_threads,
            max_outstanding = config.max_outstanding_ios,
            "QoS controller created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                dispatcher,
                processor,
                stats,
                clock,
                ids: IoRequestIdGen::new(),
                in_flight: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                signal: WorkSignal::new(),
            }),
            runtime: Mutex::new(Some(runtime)),
            dispatch_thread: Mutex::new(None),
        })
    }

    /// Returns the configuration the controller was built with.
    pub fn config(&self) -> &QosConfig {
        &self.inner.config
    }

    /// Returns the dispatcher for introspection.
    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.inner.dispatcher
    }

    /// Nanoseconds on the controller's clock.
    pub fn now_ns(&self) -> u64 {
        self.inner.clock.now_ns()
    }

    /// Creates a request with a fresh id.
    pub fn new_request(&self, volume_id: VolumeId, payload: T) -> IoRequest<T> {
        IoRequest::new(self.inner.ids.next_id(), volume_id, payload)
    }

    /// Registers and activates a volume.
    ///
    /// `capacity` defaults to `default_queue_capacity`.
    pub fn register_volume(
        &self,
        volume_id: VolumeId,
        params: QosParams,
        capacity: Option<usize>,
    ) -> QosResult<()> {
        let capacity = capacity.unwrap_or(self.inner.config.default_queue_capacity);
        let queue = VolumeQueue::new(volume_id, params, capacity)?;
        self.inner.dispatcher.register_queue(queue, self.now_ns())?;
        self.inner.dispatcher.activate(volume_id)?;
        self.inner.signal.notify();
        Ok(())
    }

    /// Removes a volume.
    ///
    /// Callers should quiesce and drain first. Requests still pending are
    /// discarded and handed back; requests still outstanding finish but their
    /// completions are no longer accounted.
    pub fn deregister_volume(&self, volume_id: VolumeId) -> QosResult<Vec<IoRequest<T>>> {
        let queue = self.inner.dispatcher.deregister_queue(volume_id, self.now_ns())?;
        let discarded = queue.drain_pending();
        if !discarded.is_empty() {
            warn!(volume = %volume_id, discarded = discarded.len(), "deregistered volume with pending requests");
        }
        if queue.outstanding() > 0 {
            warn!(volume = %volume_id, outstanding = queue.outstanding(), "deregistered volume with outstanding requests");
        }
        Ok(discarded)
    }

    /// Changes a volume's QoS policy.
    pub fn modify_volume_qos_params(&self, volume_id: VolumeId, params: QosParams) -> QosResult<()> {
        self.inner
            .dispatcher
            .modify_queue_qos_params(volume_id, params, self.now_ns())?;
        self.inner.signal.notify();
        Ok(())
    }

    /// Admits a request.
    ///
    /// In bypass mode the request is started right here, in the caller's
    /// thread, with no queueing, rate limiting or priority at all.
    pub fn enqueue_io(&self, request: IoRequest<T>) -> QosResult<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(QosError::ShuttingDown);
        }
        if self.inner.config.bypass_dispatcher {
            return self.execute_inline(request);
        }

        let volume_id = request.volume_id;
        match self.inner.dispatcher.enqueue(request, self.now_ns()) {
            Ok(()) => {
                self.inner.signal.notify();
                Ok(())
            }
            Err(e) => {
                if let Some(reason) = reject_reason(&e) {
                    self.inner.stats.record_rejection(volume_id, reason);
                }
                debug!(volume = %volume_id, error = %e, "enqueue rejected");
                Err(e)
            }
        }
    }

    fn execute_inline(&self, mut request: IoRequest<T>) -> QosResult<()> {
        let volume_id = request.volume_id;
        if let Err(e) = self.inner.dispatcher.pending_count(volume_id) {
            self.inner
                .stats
                .record_rejection(volume_id, RejectReason::UnknownVolume);
            return Err(e);
        }

        let now = self.now_ns();
        request.enqueue_ns = now;
        request.dispatch_ns = Some(now);
        let io = InFlightIo::new(Arc::clone(&self.inner), request, true);
        self.inner.processor.process_io(io);
        Ok(())
    }

    /// Releases the outstanding slot of a dispatched request and records its
    /// latency.
    ///
    /// Requests handed to the processor complete through their
    /// [`InFlightIo`]; this is for requests taken straight from
    /// [`dispatcher`](Self::dispatcher).
    pub fn mark_io_done(&self, request: &mut IoRequest<T>) -> QosResult<IoLatency> {
        let latency = self.inner.complete(request)?;
        self.inner.signal.notify();
        Ok(latency)
    }

    /// Starts the dispatch loop on its own thread.
    pub fn run_scheduler(&self) -> QosResult<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(QosError::ShuttingDown);
        }
        let mut slot = self.dispatch_thread.lock();
        if slot.is_some() {
            return Err(QosError::SchedulerRunning);
        }
        let workers = self
            .runtime
            .lock()
            .as_ref()
            .map(|rt| rt.handle().clone())
            .ok_or(QosError::ShuttingDown)?;

        let inner = Arc::clone(&self.inner);
        let thread = std::thread::Builder::new()
            .name("cfs-qos-dispatch".to_string())
            .spawn(move || dispatch_loop(inner, workers))?;
        *slot = Some(thread);
        Ok(())
    }

    /// True while the dispatch loop runs.
    pub fn is_running(&self) -> bool {
        self.dispatch_thread.lock().is_some() && !self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stops the dispatch loop, waits briefly for in-flight requests, then
    /// shuts the worker pool down. Pending requests stay queued. Idempotent.
    pub fn stop(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.signal.notify();

        let thread = self.dispatch_thread.lock().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("dispatch thread panicked");
            }
        }

        let deadline = Instant::now() + STOP_GRACE;
        loop {
            let seen = self.inner.signal.generation();
            let in_flight = self.inner.in_flight.load(Ordering::Acquire);
            if in_flight == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(in_flight, "stopping with requests still executing");
                break;
            }
            self.inner.signal.wait_since(seen, deadline - now);
        }

        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        info!("QoS controller stopped");
    }

    /// Pauses dispatching from a volume. Outstanding requests still complete.
    pub fn quiesce(&self, volume_id: VolumeId) -> QosResult<()> {
        self.inner.dispatcher.quiesce(volume_id)
    }

    /// Pauses dispatching from every volume.
    pub fn quiesce_all(&self) {
        self.inner.dispatcher.quiesce_all();
    }

    /// Resumes a quiesced volume. Returns false if it was not quiesced.
    pub fn resume(&self, volume_id: VolumeId) -> QosResult<bool> {
        let resumed = self.inner.dispatcher.resume(volume_id)?;
        if resumed {
            self.inner.signal.notify();
        }
        Ok(resumed)
    }

    /// Rejects new requests for a volume and stops dispatching from it.
    pub fn suspend(&self, volume_id: VolumeId) -> QosResult<()> {
        self.inner.dispatcher.suspend(volume_id)
    }

    /// Takes every pending request out of a volume's queue.
    pub fn drain_volume(&self, volume_id: VolumeId) -> QosResult<Vec<IoRequest<T>>> {
        let drained = self.inner.dispatcher.drain_pending(volume_id)?;
        self.inner.record_depth(volume_id);
        Ok(drained)
    }

    /// True if the volume has nothing pending and nothing outstanding.
    pub fn is_drained(&self, volume_id: VolumeId) -> QosResult<bool> {
        let (pending, outstanding) = self.inner.dispatcher.queue_depth(volume_id)?;
        Ok(pending == 0 && outstanding == 0)
    }

    /// Applies a global throttle level in `[-10, 10]`.
    pub fn set_throttle_level(&self, level: f64) -> QosResult<()> {
        self.inner.dispatcher.set_throttle_level(level, self.now_ns())?;
        self.inner.signal.notify();
        Ok(())
    }

    /// Current throttle level; `None` until one has been set.
    pub fn throttle_level(&self) -> Option<f64> {
        self.inner.dispatcher.throttle_level()
    }

    /// Changes the node's aggregate rate.
    pub fn modify_total_rate(&self, total_rate: u64) -> QosResult<()> {
        self.inner
            .dispatcher
            .modify_total_rate(total_rate, self.now_ns())?;
        self.inner.signal.notify();
        Ok(())
    }

    /// Pending requests of a volume.
    pub fn pending_count(&self, volume_id: VolumeId) -> QosResult<usize> {
        self.inner.dispatcher.pending_count(volume_id)
    }

    /// Outstanding requests of a volume.
    pub fn outstanding_count(&self, volume_id: VolumeId) -> QosResult<usize> {
        self.inner.dispatcher.outstanding_count(volume_id)
    }

    /// `(pending, outstanding)` of a volume, read together.
    pub fn queue_depth(&self, volume_id: VolumeId) -> QosResult<(usize, usize)> {
        self.inner.dispatcher.queue_depth(volume_id)
    }

    /// Requests handed to the processor and not yet completed.
    pub fn total_outstanding(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Lifecycle state of a volume.
    pub fn queue_state(&self, volume_id: VolumeId) -> QosResult<QueueState> {
        self.inner.dispatcher.queue_state(volume_id)
    }

    /// Registered volumes in registration order.
    pub fn volume_ids(&self) -> Vec<VolumeId> {
        self.inner.dispatcher.volume_ids()
    }
}

impl<T: Send + 'static> Drop for QosController<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reject_reason(err: &QosError) -> Option<RejectReason> {
    match err {
        QosError::QueueFull { .. } => Some(RejectReason::QueueFull),
        QosError::VolumeSuspended { .. } => Some(RejectReason::Suspended),
        QosError::VolumeNotFound { .. } => Some(RejectReason::UnknownVolume),
        _ => None,
    }
}
