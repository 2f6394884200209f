//! Registered queues plus the admission-control ledger.
//!
//! Guarded by the dispatcher's `RwLock`: registration, deregistration and
//! policy changes take the write lock, everything on the I/O path takes the
//! read lock.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{QosError, QosResult};
use crate::request::VolumeId;
use crate::volume_queue::{QosParams, VolumeQueue};

pub(crate) struct QueueTable<T> {
    total_rate: u64,
    total_min_rate: u64,
    order: Vec<VolumeId>,
    queues: HashMap<VolumeId, VolumeQueue<T>>,
    last_epoch: u64,
}

impl<T> QueueTable<T> {
    pub(crate) fn new(total_rate: u64) -> Self {
        Self {
            total_rate,
            total_min_rate: 0,
            order: Vec::new(),
            queues: HashMap::new(),
            last_epoch: 0,
        }
    }

    pub(crate) fn total_rate(&self) -> u64 {
        self.total_rate
    }

    /// Sum of assured IOPS of all registered queues.
    pub(crate) fn total_min_rate(&self) -> u64 {
        self.total_min_rate
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    /// Volume ids in registration order.
    pub(crate) fn order(&self) -> &[VolumeId] {
        &self.order
    }

    pub(crate) fn get(&self, volume_id: VolumeId) -> Option<&VolumeQueue<T>> {
        self.queues.get(&volume_id)
    }

    pub(crate) fn require(&self, volume_id: VolumeId) -> QosResult<&VolumeQueue<T>> {
        self.queues
            .get(&volume_id)
            .ok_or(QosError::VolumeNotFound { volume_id })
    }

    /// Queue at registration position `idx`.
    pub(crate) fn at(&self, idx: usize) -> &VolumeQueue<T> {
        let volume_id = self.order[idx];
        match self.queues.get(&volume_id) {
            Some(queue) => queue,
            None => panic!("queue table order references unknown {}", volume_id),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &VolumeQueue<T>> {
        self.order.iter().filter_map(|id| self.queues.get(id))
    }

    pub(crate) fn any_dispatchable(&self) -> bool {
        self.queues.values().any(|q| q.has_dispatchable())
    }

    /// Rejects if `committed - released + additional` would exceed the total rate.
    pub(crate) fn check_admission(&self, additional: u64, released: u64) -> QosResult<()> {
        let committed = self.total_min_rate.saturating_sub(released);
        if committed.saturating_add(additional) > self.total_rate {
            warn!(
                requested = additional,
                committed,
                total_rate = self.total_rate,
                "assured IOPS admission rejected"
            );
            return Err(QosError::ExceedsMinIops {
                requested: additional,
                committed,
                total_rate: self.total_rate,
            });
        }
        Ok(())
    }

    /// Checks a new queue against duplicates and admission without inserting it.
    pub(crate) fn check_insert(&self, queue: &VolumeQueue<T>) -> QosResult<()> {
        let volume_id = queue.volume_id();
        if self.queues.contains_key(&volume_id) {
            return Err(QosError::DuplicateVolume { volume_id });
        }
        self.check_admission(queue.params().assured_iops, 0)
    }

    /// Admits a queue and stamps it with a fresh registration epoch, so
    /// completions of requests dispatched by an earlier registration of the
    /// same volume are told apart.
    pub(crate) fn insert(&mut self, mut queue: VolumeQueue<T>) -> QosResult<()> {
        self.check_insert(&queue)?;
        self.last_epoch += 1;
        queue.set_epoch(self.last_epoch);
        let volume_id = queue.volume_id();
        self.total_min_rate += queue.params().assured_iops;
        self.order.push(volume_id);
        self.queues.insert(volume_id, queue);
        Ok(())
    }

    /// Removes a queue, returning it with its former registration position.
    pub(crate) fn remove(&mut self, volume_id: VolumeId) -> QosResult<(usize, VolumeQueue<T>)> {
        let queue = self
            .queues
            .remove(&volume_id)
            .ok_or(QosError::VolumeNotFound { volume_id })?;
        let idx = self
            .order
            .iter()
            .position(|id| *id == volume_id)
            .unwrap_or_else(|| panic!("{} missing from registration order", volume_id));
        self.order.remove(idx);
        self.total_min_rate -= queue.params().assured_iops;
        Ok((idx, queue))
    }

    /// Validates and applies new params; returns the previous ones.
    ///
    /// Admission uses the delta against the queue's current assured rate, so
    /// nothing changes when the new total would exceed the budget.
    pub(crate) fn update_params(
        &mut self,
        volume_id: VolumeId,
        params: QosParams,
    ) -> QosResult<QosParams> {
        params.validate()?;
        let old = self.require(volume_id)?.params();
        self.check_admission(params.assured_iops, old.assured_iops)?;

        let queue = self
            .queues
            .get_mut(&volume_id)
            .ok_or(QosError::VolumeNotFound { volume_id })?;
        queue.modify_qos_params(params)?;
        self.total_min_rate = self.total_min_rate - old.assured_iops + params.assured_iops;
        Ok(old)
    }

    pub(crate) fn set_total_rate(&mut self, total_rate: u64) -> QosResult<()> {
        if total_rate < self.total_min_rate || total_rate == 0 {
            warn!(
                total_rate,
                committed = self.total_min_rate,
                "total rate change rejected"
            );
            return Err(QosError::ExceedsMinIops {
                requested: total_rate,
                committed: self.total_min_rate,
                total_rate: self.total_rate,
            });
        }
        self.total_rate = total_rate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(id: u64, assured: u64) -> VolumeQueue<()> {
        VolumeQueue::new(VolumeId(id), QosParams::new(assured, 0, 5), 16).unwrap()
    }

    #[test]
    fn test_insert_and_admission() {
        let mut table = QueueTable::new(1000);
        table.insert(queue(3, 600)).unwrap();
        let err = table.insert(queue(4, 500)).unwrap_err();
        assert!(matches!(
            err,
            QosError::ExceedsMinIops {
                requested: 500,
                committed: 600,
                total_rate: 1000
            }
        ));
        table.insert(queue(4, 300)).unwrap();
        assert_eq!(table.total_min_rate(), 900);
        assert_eq!(table.order(), &[VolumeId(3), VolumeId(4)]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut table = QueueTable::new(1000);
        table.insert(queue(1, 10)).unwrap();
        assert!(matches!(
            table.insert(queue(1, 10)),
            Err(QosError::DuplicateVolume { .. })
        ));
        assert_eq!(table.total_min_rate(), 10);
    }

    #[test]
    fn test_remove_restores_ledger() {
        let mut table = QueueTable::new(1000);
        table.insert(queue(1, 100)).unwrap();
        table.insert(queue(2, 200)).unwrap();
        let (idx, removed) = table.remove(VolumeId(1)).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(removed.volume_id(), VolumeId(1));
        assert_eq!(table.total_min_rate(), 200);
        assert_eq!(table.len(), 1);
        assert!(matches!(
            table.remove(VolumeId(1)),
            Err(QosError::VolumeNotFound { .. })
        ));
    }

    #[test]
    fn test_update_params_uses_delta() {
        let mut table = QueueTable::new(1000);
        table.insert(queue(1, 600)).unwrap();
        table.insert(queue(2, 300)).unwrap();

        table
            .update_params(VolumeId(1), QosParams::new(700, 0, 1))
            .unwrap();
        assert_eq!(table.total_min_rate(), 1000);

        let err = table
            .update_params(VolumeId(2), QosParams::new(301, 0, 1))
            .unwrap_err();
        assert!(matches!(err, QosError::ExceedsMinIops { .. }));
        assert_eq!(table.total_min_rate(), 1000);
        assert_eq!(table.get(VolumeId(2)).unwrap().params().assured_iops, 300);
    }

    #[test]
    fn test_set_total_rate() {
        let mut table = QueueTable::new(1000);
        table.insert(queue(1, 600)).unwrap();
        assert!(table.set_total_rate(500).is_err());
        assert_eq!(table.total_rate(), 1000);
        table.set_total_rate(600).unwrap();
        assert_eq!(table.total_rate(), 600);
    }

    #[test]
    fn test_insert_assigns_fresh_epoch() {
        let mut table = QueueTable::new(1000);
        table.insert(queue(1, 100)).unwrap();
        let first = table.get(VolumeId(1)).unwrap().epoch();
        table.insert(queue(2, 100)).unwrap();
        table.remove(VolumeId(1)).unwrap();
        table.insert(queue(1, 100)).unwrap();
        let second = table.get(VolumeId(1)).unwrap().epoch();
        assert!(first > 0);
        assert!(second > first);
        assert_ne!(second, table.get(VolumeId(2)).unwrap().epoch());
    }
}
