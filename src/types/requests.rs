/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Client requests and the ledger transactions they turn into once batched.

use std::collections::{HashMap, HashSet};

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::hash_of,
    data_types::{CryptoHash, InstanceId, LedgerId, PpSeqNo, SeqNo},
};

/// A client request, already authenticated and propagated by an outer layer.
///
/// Requests are referred to in Pre-Prepares by their [`digest`](Self::digest) only, so every node
/// must hold the full request before it can apply a batch that contains it.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Request {
    /// Ledger the request writes to.
    pub ledger_id: LedgerId,

    /// Client-chosen number that distinguishes otherwise identical requests.
    pub req_id: u64,

    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(ledger_id: LedgerId, req_id: u64, payload: Vec<u8>) -> Self {
        Self {
            ledger_id,
            req_id,
            payload,
        }
    }

    /// SHA256 hash of the Borsh serialization of this request.
    pub fn digest(&self) -> CryptoHash {
        hash_of(self)
    }
}

/// An entry of a [ledger](crate::ledger::Ledger).
///
/// The leaf hashed into the ledger's merkle tree is the transaction's `payload`. `seq_no` is `None`
/// while the transaction is speculative and is set once the transaction is committed.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    pub payload: Vec<u8>,
    pub seq_no: Option<SeqNo>,
}

impl Transaction {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            seq_no: None,
        }
    }
}

impl From<&Request> for Transaction {
    fn from(request: &Request) -> Self {
        Transaction::new(request.payload.clone())
    }
}

/// The requests a node knows about, kept until every instance has ordered them.
///
/// The digests of requests the master instance ordered are remembered for longer, so that a request
/// submitted again after it was ordered is not ordered twice. They are forgotten only when
/// [`prune_ordered`](Self::prune_ordered) is called, which the node does as the master instance's
/// checkpoints become stable.
pub struct RequestStore {
    instance_count: usize,
    requests: HashMap<CryptoHash, (Request, HashSet<InstanceId>)>,
    // Digest of every request the master instance ordered, with the batch it was ordered in.
    ordered: HashMap<CryptoHash, PpSeqNo>,
}

impl RequestStore {
    pub(crate) fn new(instance_count: usize) -> Self {
        Self {
            instance_count,
            requests: HashMap::new(),
            ordered: HashMap::new(),
        }
    }

    /// Store `request`. Returns its digest, or `None` if it is already stored or was already
    /// ordered by the master instance.
    pub(crate) fn insert(&mut self, request: Request) -> Option<CryptoHash> {
        let digest = request.digest();
        if self.requests.contains_key(&digest) || self.ordered.contains_key(&digest) {
            return None;
        }
        self.requests.insert(digest, (request, HashSet::new()));
        Some(digest)
    }

    pub fn get(&self, digest: &CryptoHash) -> Option<&Request> {
        self.requests.get(digest).map(|(request, _)| request)
    }

    pub fn contains(&self, digest: &CryptoHash) -> bool {
        self.requests.contains_key(digest)
    }

    /// Whether the master instance ordered the request with `digest`, as far as the store remembers.
    pub fn is_ordered(&self, digest: &CryptoHash) -> bool {
        self.ordered.contains_key(digest)
    }

    /// Record that `inst_id` ordered the request with `digest` in batch `pp_seq_no`, dropping the
    /// request once every instance has.
    pub(crate) fn mark_ordered(
        &mut self,
        digest: &CryptoHash,
        inst_id: InstanceId,
        pp_seq_no: PpSeqNo,
    ) {
        if inst_id.is_master() {
            self.ordered.insert(*digest, pp_seq_no);
        }
        let done = match self.requests.get_mut(digest) {
            Some((_, ordered_by)) => {
                ordered_by.insert(inst_id);
                ordered_by.len() >= self.instance_count
            }
            None => false,
        };
        if done {
            self.requests.remove(digest);
        }
    }

    /// Drop the request with `digest`, which no instance will order.
    pub(crate) fn remove(&mut self, digest: &CryptoHash) {
        self.requests.remove(digest);
    }

    /// Forget the digests of requests the master instance ordered in batches up to `pp_seq_no`.
    pub(crate) fn prune_ordered(&mut self, pp_seq_no: PpSeqNo) {
        self.ordered.retain(|_, ordered_in| *ordered_in > pp_seq_no);
    }

    /// Number of requests not yet ordered by every instance.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Number of ordered requests whose digests are remembered.
    pub fn ordered_len(&self) -> usize {
        self.ordered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_dropped_once_every_instance_ordered_them() {
        let mut store = RequestStore::new(2);
        let request = Request::new(LedgerId::new(1), 0, b"payload".to_vec());
        let digest = store.insert(request.clone()).unwrap();
        assert!(store.insert(request).is_none());

        store.mark_ordered(&digest, InstanceId::MASTER, PpSeqNo::new(1));
        store.mark_ordered(&digest, InstanceId::MASTER, PpSeqNo::new(1));
        assert!(store.contains(&digest));

        store.mark_ordered(&digest, InstanceId::new(1), PpSeqNo::new(1));
        assert!(!store.contains(&digest));
        assert!(store.is_empty());
    }

    #[test]
    fn ordered_requests_are_not_stored_again_until_pruned() {
        let mut store = RequestStore::new(2);
        let first = Request::new(LedgerId::new(1), 0, b"first".to_vec());
        let second = Request::new(LedgerId::new(1), 1, b"second".to_vec());
        for (request, pp_seq_no) in [(&first, 3), (&second, 4)] {
            let digest = store.insert(request.clone()).unwrap();
            store.mark_ordered(&digest, InstanceId::MASTER, PpSeqNo::new(pp_seq_no));
            store.mark_ordered(&digest, InstanceId::new(1), PpSeqNo::new(pp_seq_no));
        }
        assert!(store.is_empty());
        assert!(store.insert(first.clone()).is_none());
        assert!(store.insert(second.clone()).is_none());

        store.prune_ordered(PpSeqNo::new(3));
        assert_eq!(store.ordered_len(), 1);
        assert!(!store.is_ordered(&first.digest()));
        assert!(store.insert(first).is_some());
        assert!(store.insert(second).is_none());
    }

    #[test]
    fn backups_do_not_mark_requests_as_ordered() {
        let mut store = RequestStore::new(2);
        let request = Request::new(LedgerId::new(1), 0, b"payload".to_vec());
        let digest = store.insert(request).unwrap();

        store.mark_ordered(&digest, InstanceId::new(1), PpSeqNo::new(1));
        assert!(!store.is_ordered(&digest));
        store.remove(&digest);
        assert!(store.is_empty());
    }
}
