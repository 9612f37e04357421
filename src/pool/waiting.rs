use std::collections::BTreeMap;

use tokio::sync::oneshot;

use crate::error::SqlPipesError;
use crate::pipe::PipeLease;
use crate::transaction::Transaction;
use crate::types::Role;

pub(crate) type LeaseSender = oneshot::Sender<Result<PipeLease, SqlPipesError>>;
pub(crate) type LeaseReceiver = oneshot::Receiver<Result<PipeLease, SqlPipesError>>;

/// What a queued request is waiting for.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WaitTag {
    Role(Role),
    Transaction(Transaction),
}

struct Waiter {
    tag: WaitTag,
    sender: LeaseSender,
}

/// Bounded set of acquisition requests, ordered by request id.
pub(crate) struct WaitingList {
    capacity: usize,
    next_id: u64,
    entries: BTreeMap<u64, Waiter>,
}

impl WaitingList {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: 0,
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue a request, or fail with a capacity error when the list is full.
    pub(crate) fn push(&mut self, tag: WaitTag) -> Result<(u64, LeaseReceiver), SqlPipesError> {
        if self.entries.len() >= self.capacity {
            return Err(SqlPipesError::Capacity(self.capacity));
        }
        self.next_id += 1;
        let (sender, receiver) = oneshot::channel();
        self.entries.insert(self.next_id, Waiter { tag, sender });
        Ok((self.next_id, receiver))
    }

    /// Whether any request with `tag` is still queued.
    pub(crate) fn is_queued(&self, tag: &WaitTag) -> bool {
        self.entries.values().any(|waiter| waiter.tag == *tag)
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Ids and tags in request order.
    pub(crate) fn snapshot(&self) -> Vec<(u64, WaitTag)> {
        self.entries
            .iter()
            .map(|(id, waiter)| (*id, waiter.tag.clone()))
            .collect()
    }

    /// Remove a request. Returns its sender so the caller can settle it.
    pub(crate) fn remove(&mut self, id: u64) -> Option<LeaseSender> {
        self.entries.remove(&id).map(|waiter| waiter.sender)
    }

    pub(crate) fn drain(&mut self) -> Vec<LeaseSender> {
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|waiter| waiter.sender)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_and_ordered() {
        let mut list = WaitingList::new(2);
        let (first, _rx1) = list.push(WaitTag::Role(Role::Read)).unwrap();
        let (second, _rx2) = list.push(WaitTag::Role(Role::Write)).unwrap();
        assert!(first < second);
        assert!(matches!(
            list.push(WaitTag::Role(Role::Read)),
            Err(SqlPipesError::Capacity(2))
        ));

        assert!(list.is_queued(&WaitTag::Role(Role::Write)));
        let order: Vec<u64> = list.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![first, second]);

        assert!(list.remove(first).is_some());
        assert!(list.remove(first).is_none());
        assert!(list.push(WaitTag::Role(Role::Read)).is_ok());
        assert!(!list.is_queued(&WaitTag::Role(Role::Read)));
        assert_eq!(list.drain().len(), 2);
        assert!(list.is_empty());
    }
}
