//! Property-based tests for claudefs-qos using proptest.
//!
//! These exercise the admission, accounting and throttle invariants of both
//! dispatch algorithms under arbitrary operation sequences.

use claudefs_qos::{
    effective_rates, Dispatch, DispatchAlgorithm, Dispatcher, IoRequest, IoRequestId, QosConfig,
    QosError, QosParams, VolumeId, VolumeQueue,
};
use proptest::prelude::*;
use std::collections::HashMap;

const MS: u64 = 1_000_000;
const TOTAL_RATE: u64 = 1_000;

#[derive(Debug, Clone)]
enum AdminOp {
    Register(u64, u64),
    Modify(u64, u64),
    Deregister(u64),
}

#[derive(Debug, Clone)]
enum IoOp {
    Enqueue(u64),
    Dispatch,
    Complete(usize),
}

fn any_algorithm() -> impl Strategy<Value = DispatchAlgorithm> {
    prop_oneof![
        Just(DispatchAlgorithm::WeightedFair),
        Just(DispatchAlgorithm::HierarchicalTokenBucket)
    ]
}

fn any_admin_op() -> impl Strategy<Value = AdminOp> {
    prop_oneof![
        (0u64..6, 0u64..600).prop_map(|(id, assured)| AdminOp::Register(id, assured)),
        (0u64..6, 0u64..600).prop_map(|(id, assured)| AdminOp::Modify(id, assured)),
        (0u64..6).prop_map(AdminOp::Deregister),
    ]
}

fn any_io_op() -> impl Strategy<Value = IoOp> {
    prop_oneof![
        (0u64..3).prop_map(IoOp::Enqueue),
        Just(IoOp::Dispatch),
        (0usize..16).prop_map(IoOp::Complete),
    ]
}

fn any_params() -> impl Strategy<Value = QosParams> {
    (0u64..500, 0u64..500, any::<bool>(), 1u8..=10).prop_map(|(assured, extra, bounded, priority)| {
        let throttle = if bounded { assured + extra.max(1) } else { 0 };
        QosParams::new(assured, throttle, priority)
    })
}

fn dispatcher(algorithm: DispatchAlgorithm) -> Dispatcher<u64> {
    Dispatcher::new(&QosConfig::new(algorithm, TOTAL_RATE), 0).unwrap()
}

fn add(d: &Dispatcher<u64>, id: u64, assured: u64) -> Result<(), QosError> {
    let queue = VolumeQueue::new(VolumeId(id), QosParams::new(assured, 0, 1 + (id % 10) as u8), 1024)?;
    d.register_queue(queue, 0)?;
    d.activate(VolumeId(id))
}

fn committed(d: &Dispatcher<u64>) -> u64 {
    d.volume_ids()
        .into_iter()
        .map(|id| d.queue_params(id).unwrap().assured_iops)
        .sum()
}

/// Dispatches until idle, advancing simulated time when throttled.
fn drain_in_order(d: &Dispatcher<u64>, mut now: u64) -> Vec<IoRequest<u64>> {
    let mut out = Vec::new();
    for _ in 0..100_000 {
        now += MS;
        match d.dispatch_next(now) {
            Dispatch::Ready(r) => out.push(r),
            Dispatch::Throttled(_) => {}
            Dispatch::Idle => break,
        }
    }
    out
}

proptest! {
    /// Sum of assured rates never exceeds the total, and rejected operations change nothing.
    #[test]
    fn prop_admission_invariant(
        algorithm in any_algorithm(),
        ops in proptest::collection::vec(any_admin_op(), 1..40),
    ) {
        let d = dispatcher(algorithm);
        for op in ops {
            let before = d.total_min_rate();
            let result = match op {
                AdminOp::Register(id, assured) => add(&d, id, assured),
                AdminOp::Modify(id, assured) => {
                    d.modify_queue_qos_params(VolumeId(id), QosParams::new(assured, 0, 1), 0)
                }
                AdminOp::Deregister(id) => d.deregister_queue(VolumeId(id), 0).map(|_| ()),
            };
            if let Err(QosError::ExceedsMinIops { .. }) = result {
                prop_assert_eq!(d.total_min_rate(), before);
            }
            prop_assert!(d.total_min_rate() <= TOTAL_RATE);
            prop_assert_eq!(d.total_min_rate(), committed(&d));
        }
    }

    /// Requests leave each volume in the order they were enqueued.
    #[test]
    fn prop_fifo_within_queue(
        algorithm in any_algorithm(),
        volumes in proptest::collection::vec(0u64..3, 1..120),
    ) {
        let d = dispatcher(algorithm);
        for id in 0..3 {
            add(&d, id, 100).unwrap();
        }
        for (seq, volume) in volumes.iter().enumerate() {
            d.enqueue(IoRequest::new(IoRequestId(seq as u64), VolumeId(*volume), seq as u64), 0)
                .unwrap();
        }

        let dispatched = drain_in_order(&d, 0);
        prop_assert_eq!(dispatched.len(), volumes.len());

        let mut per_volume: HashMap<VolumeId, Vec<u64>> = HashMap::new();
        for r in dispatched {
            per_volume.entry(r.volume_id).or_default().push(r.payload);
        }
        for payloads in per_volume.values() {
            prop_assert!(payloads.windows(2).all(|w| w[0] < w[1]));
        }
    }

    /// Outstanding counts move by exactly one per dispatch and per completion.
    #[test]
    fn prop_outstanding_accounting(
        algorithm in any_algorithm(),
        ops in proptest::collection::vec(any_io_op(), 1..200),
    ) {
        let d = dispatcher(algorithm);
        for id in 0..3 {
            add(&d, id, 200).unwrap();
        }

        let mut in_flight: Vec<IoRequest<u64>> = Vec::new();
        let mut expected: HashMap<VolumeId, usize> = HashMap::new();
        let mut now = 0;
        let mut seq = 0;

        for op in ops {
            now += MS;
            match op {
                IoOp::Enqueue(id) => {
                    seq += 1;
                    d.enqueue(IoRequest::new(IoRequestId(seq), VolumeId(id), seq), now).unwrap();
                }
                IoOp::Dispatch => {
                    if let Dispatch::Ready(r) = d.dispatch_next(now) {
                        *expected.entry(r.volume_id).or_default() += 1;
                        in_flight.push(r);
                    }
                }
                IoOp::Complete(idx) => {
                    if !in_flight.is_empty() {
                        let mut r = in_flight.swap_remove(idx % in_flight.len());
                        let latency = d.mark_io_done(&mut r, now).unwrap();
                        prop_assert_eq!(latency.total_ns, latency.wait_ns + latency.service_ns);
                        *expected.entry(r.volume_id).or_default() -= 1;
                    }
                }
            }
            for id in 0..3 {
                let volume_id = VolumeId(id);
                prop_assert_eq!(
                    d.outstanding_count(volume_id).unwrap(),
                    expected.get(&volume_id).copied().unwrap_or(0)
                );
            }
        }
        prop_assert_eq!(d.total_outstanding(), in_flight.len());
    }

    /// A lower throttle level never raises a queue's assured or ceiling rate.
    #[test]
    fn prop_throttle_monotonic(
        params in any_params(),
        a in -10.0f64..=10.0,
        b in -10.0f64..=10.0,
    ) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let low = effective_rates(&params, TOTAL_RATE, Some(lo));
        let high = effective_rates(&params, TOTAL_RATE, Some(hi));
        let unthrottled = effective_rates(&params, TOTAL_RATE, None);

        prop_assert!(low.ceiling <= high.ceiling + 1e-9);
        prop_assert!(low.assured <= high.assured + 1e-9);
        prop_assert!(high.ceiling <= unthrottled.ceiling + 1e-9);
        prop_assert!(low.ceiling > 0.0);
    }

    /// Registering then deregistering an empty queue leaves scheduling unchanged.
    #[test]
    fn prop_register_round_trip(
        algorithm in any_algorithm(),
        base in proptest::collection::vec(0u64..200, 1..4),
        extra in 0u64..200,
    ) {
        let with_round_trip = dispatcher(algorithm);
        let untouched = dispatcher(algorithm);
        for (id, assured) in base.iter().enumerate() {
            add(&with_round_trip, id as u64, *assured).unwrap();
            add(&untouched, id as u64, *assured).unwrap();
        }

        let before = with_round_trip.total_min_rate();
        add(&with_round_trip, 99, extra).unwrap();
        let queue = with_round_trip.deregister_queue(VolumeId(99), 0).unwrap();
        prop_assert!(queue.is_drained());
        prop_assert_eq!(with_round_trip.total_min_rate(), before);
        prop_assert_eq!(with_round_trip.volume_ids(), untouched.volume_ids());

        for d in [&with_round_trip, &untouched] {
            for id in 0..base.len() as u64 {
                for i in 0..20 {
                    d.enqueue(IoRequest::new(IoRequestId(i), VolumeId(id), i), 0).unwrap();
                }
            }
        }
        let order = |d: &Dispatcher<u64>| -> Vec<VolumeId> {
            drain_in_order(d, 0).into_iter().map(|r| r.volume_id).collect()
        };
        prop_assert_eq!(order(&with_round_trip), order(&untouched));
    }
}
