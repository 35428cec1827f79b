/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Append-only, merkle-hashed ledger with a speculative ("uncommitted") overlay.
//!
//! A [`Ledger`] holds two merkle trees over the same [`HashArena`](merkle::HashArena):
//! 1. The **committed tree**, which covers exactly the transactions durably stored in the ledger's
//!    [`TxnStore`].
//! 2. The optional **uncommitted tree**, which covers the committed transactions followed by the
//!    speculative transactions applied by batches that were pre-prepared but not yet ordered. It is
//!    `None` whenever there are no speculative transactions.
//!
//! The uncommitted transactions form a queue that is consumed from both ends:
//! - Ordered batches [`commit`](Ledger::commit_txns) transactions from the **front**, oldest first.
//! - View changes and rejected batches [`discard`](Ledger::discard_txns) transactions from the
//!   **back**, newest first.
//!
//! At all times, `uncommitted_size() == size() + uncommitted_txns().len()`.

pub mod merkle;

pub mod pluggables;

use std::collections::{BTreeMap, VecDeque};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    data_types::{CryptoHash, LedgerId, SeqNo, SeqNoRange},
    requests::Transaction,
};

use self::{
    merkle::{CompactMerkleTree, HashArena},
    pluggables::TxnStore,
};

/// Arena size above which a ledger with live speculative content compacts its arena anyway.
const ARENA_COMPACTION_THRESHOLD: usize = 1 << 16;

/// Size and root hash of a ledger's committed tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct LedgerSummary {
    pub ledger_id: LedgerId,
    pub size: u64,
    pub root_hash: CryptoHash,
}

pub struct Ledger<S: TxnStore> {
    ledger_id: LedgerId,
    store: S,
    arena: HashArena,
    tree: CompactMerkleTree,
    uncommitted_txns: VecDeque<Transaction>,
    uncommitted_tree: Option<CompactMerkleTree>,
    uncommitted_root_hash: Option<CryptoHash>,
    // Root of the uncommitted tree at the end of every non-empty `append_txns` call, keyed by the
    // uncommitted size it had then. Entries at or below the committed size are dropped on commit.
    appended_roots: BTreeMap<u64, CryptoHash>,
}

impl<S: TxnStore> Ledger<S> {
    /// Open the ledger stored in `store`, rebuilding its committed tree from the stored records.
    pub fn new(ledger_id: LedgerId, store: S) -> Result<Ledger<S>, LedgerError> {
        let mut arena = HashArena::new();
        let mut tree = CompactMerkleTree::empty();
        for seq_no in 1..=store.size() {
            let record = store
                .get(SeqNo::new(seq_no))
                .ok_or(LedgerError::MissingRecord {
                    ledger_id,
                    seq_no: SeqNo::new(seq_no),
                })?;
            tree = arena.append(tree, &record);
        }

        Ok(Ledger {
            ledger_id,
            store,
            arena,
            tree,
            uncommitted_txns: VecDeque::new(),
            uncommitted_tree: None,
            uncommitted_root_hash: None,
            appended_roots: BTreeMap::new(),
        })
    }

    pub fn ledger_id(&self) -> LedgerId {
        self.ledger_id
    }

    /// Number of committed transactions.
    pub fn size(&self) -> u64 {
        self.tree.size()
    }

    /// Root hash of the committed tree.
    pub fn root_hash(&self) -> CryptoHash {
        self.arena.root(&self.tree)
    }

    /// Number of committed transactions plus the number of speculative transactions.
    pub fn uncommitted_size(&self) -> u64 {
        self.size() + self.uncommitted_txns.len() as u64
    }

    /// Root hash of the uncommitted tree, or `None` if there are no speculative transactions.
    pub fn uncommitted_root_hash(&self) -> Option<CryptoHash> {
        self.uncommitted_root_hash
    }

    /// The speculative transactions, oldest first.
    pub fn uncommitted_txns(&self) -> impl Iterator<Item = &Transaction> {
        self.uncommitted_txns.iter()
    }

    /// Get the committed transaction at `seq_no`.
    pub fn get(&self, seq_no: SeqNo) -> Option<Transaction> {
        self.store.get(seq_no).map(|payload| Transaction {
            payload,
            seq_no: Some(seq_no),
        })
    }

    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary {
            ledger_id: self.ledger_id,
            size: self.size(),
            root_hash: self.root_hash(),
        }
    }

    /// Speculatively apply `txns` on top of the uncommitted tree (or the committed tree, if there are
    /// no speculative transactions yet). Nothing is written to the store.
    ///
    /// Returns the range of sequence numbers the transactions would occupy if committed, along with
    /// the transactions themselves. Appending nothing returns a range whose two bounds are both the
    /// current uncommitted size.
    pub fn append_txns(&mut self, txns: Vec<Transaction>) -> (SeqNoRange, Vec<Transaction>) {
        let uncommitted_size = self.uncommitted_size();
        if txns.is_empty() {
            return (SeqNoRange::new(uncommitted_size, uncommitted_size), txns);
        }

        let base = self.uncommitted_tree.unwrap_or(self.tree);
        let tree = self
            .arena
            .extend(base, txns.iter().map(|txn| txn.payload.as_slice()));
        let root = self.arena.root(&tree);

        self.uncommitted_tree = Some(tree);
        self.uncommitted_root_hash = Some(root);
        self.uncommitted_txns.extend(txns.iter().cloned());
        self.appended_roots.insert(tree.size(), root);

        let range = SeqNoRange::new(uncommitted_size + 1, uncommitted_size + txns.len() as u64);
        (range, txns)
    }

    /// Durably commit the `count` oldest speculative transactions.
    ///
    /// Each committed transaction is assigned the next sequence number of the store. The uncommitted
    /// tree is left as it is unless no speculative transactions remain, in which case it is cleared.
    pub fn commit_txns(
        &mut self,
        count: usize,
    ) -> Result<(SeqNoRange, Vec<Transaction>), LedgerError> {
        if count > self.uncommitted_txns.len() {
            return Err(LedgerError::NotEnoughUncommittedTxns {
                ledger_id: self.ledger_id,
                requested: count,
                available: self.uncommitted_txns.len(),
            });
        }

        // A transaction leaves the queue only once it is in the store, so that a failed write loses
        // nothing.
        let committed_size = self.size();
        let mut committed = Vec::with_capacity(count);
        while committed.len() < count {
            let Some(mut txn) = self.uncommitted_txns.pop_front() else {
                break;
            };
            match self.append_durably(&txn.payload) {
                Ok(seq_no) => {
                    txn.seq_no = Some(seq_no);
                    committed.push(txn);
                }
                Err(err) => {
                    self.uncommitted_txns.push_front(txn);
                    return Err(err);
                }
            }
        }

        if self.uncommitted_txns.is_empty() {
            self.clear_uncommitted();
        } else {
            let size = self.size();
            self.appended_roots.retain(|uncommitted_size, _| *uncommitted_size > size);
            if self.arena.len() > ARENA_COMPACTION_THRESHOLD {
                self.compact();
            }
        }

        let range = SeqNoRange::new(committed_size + 1, committed_size + count as u64);
        Ok((range, committed))
    }

    /// Durably append `txns` without going through the uncommitted overlay. Used when catching up on
    /// transactions that were ordered without this node.
    ///
    /// Any speculative transactions are kept, and re-applied on top of the new committed tree.
    pub fn append_committed_txns(
        &mut self,
        txns: Vec<Transaction>,
    ) -> Result<(SeqNoRange, Vec<Transaction>), LedgerError> {
        let committed_size = self.size();
        let mut committed = Vec::with_capacity(txns.len());
        for mut txn in txns {
            txn.seq_no = Some(self.append_durably(&txn.payload)?);
            committed.push(txn);
        }

        self.appended_roots.clear();
        if self.uncommitted_txns.is_empty() {
            self.compact();
        } else {
            let tree = self.arena.extend(
                self.tree,
                self.uncommitted_txns.iter().map(|txn| txn.payload.as_slice()),
            );
            self.uncommitted_tree = Some(tree);
            self.uncommitted_root_hash = Some(self.arena.root(&tree));
        }

        let range = SeqNoRange::new(committed_size + 1, committed_size + committed.len() as u64);
        Ok((range, committed))
    }

    /// Remove the `count` newest speculative transactions and rebuild the uncommitted tree from the
    /// committed tree and the transactions that remain.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Inconsistency`] if the rebuilt root differs from the root the ledger had when it
    /// last had this uncommitted size. This means the ledger's in-memory state is corrupt, and the
    /// node must stop.
    pub fn discard_txns(&mut self, count: usize) -> Result<(), LedgerError> {
        if count == 0 {
            return Ok(());
        }
        if count > self.uncommitted_txns.len() {
            return Err(LedgerError::NotEnoughUncommittedTxns {
                ledger_id: self.ledger_id,
                requested: count,
                available: self.uncommitted_txns.len(),
            });
        }

        let old_root = self.uncommitted_root_hash;
        let remaining = self.uncommitted_txns.len() - count;
        self.uncommitted_txns.truncate(remaining);

        if self.uncommitted_txns.is_empty() {
            self.clear_uncommitted();
            log::debug!(
                "Discarded {} txns from ledger {}; no uncommitted txns remain",
                count,
                self.ledger_id
            );
            return Ok(());
        }

        let tree = self.arena.extend(
            self.tree,
            self.uncommitted_txns.iter().map(|txn| txn.payload.as_slice()),
        );
        let root = self.arena.root(&tree);

        let uncommitted_size = tree.size();
        self.appended_roots.split_off(&(uncommitted_size + 1));
        if let Some(expected) = self.appended_roots.get(&uncommitted_size) {
            if *expected != root {
                log::error!(
                    "Ledger {} is inconsistent: rebuilt root {:?} at uncommitted size {} does not match {:?}",
                    self.ledger_id,
                    root,
                    uncommitted_size,
                    expected
                );
                return Err(LedgerError::Inconsistency {
                    ledger_id: self.ledger_id,
                    expected: *expected,
                    actual: root,
                });
            }
        }

        self.uncommitted_tree = Some(tree);
        self.uncommitted_root_hash = Some(root);
        log::debug!(
            "Discarded {} txns from ledger {} and root hash {:?}; new root hash is {:?}",
            count,
            self.ledger_id,
            old_root,
            root
        );

        if self.arena.len() > ARENA_COMPACTION_THRESHOLD {
            self.compact();
        }
        Ok(())
    }

    /// Drop all speculative transactions. Calling this when there are none does nothing.
    pub fn reset_uncommitted(&mut self) {
        self.uncommitted_txns.clear();
        self.clear_uncommitted();
    }

    /// Tear the ledger down, handing back its store.
    pub fn into_store(self) -> S {
        self.store
    }

    fn append_durably(&mut self, payload: &[u8]) -> Result<SeqNo, LedgerError> {
        let expected = SeqNo::new(self.size() + 1);
        let seq_no = self.store.append(payload.to_vec());
        if seq_no != expected {
            return Err(LedgerError::StoreSequenceMismatch {
                ledger_id: self.ledger_id,
                expected,
                actual: seq_no,
            });
        }
        self.tree = self.arena.append(self.tree, payload);
        Ok(seq_no)
    }

    fn clear_uncommitted(&mut self) {
        self.uncommitted_tree = None;
        self.uncommitted_root_hash = None;
        self.appended_roots.clear();
        self.compact();
    }

    fn compact(&mut self) {
        match self.uncommitted_tree.as_mut() {
            Some(uncommitted_tree) => self.arena.retain(&mut [&mut self.tree, uncommitted_tree]),
            None => self.arena.retain(&mut [&mut self.tree]),
        }
    }
}

#[derive(Debug)]
pub enum LedgerError {
    /// The store reports `size` records but has nothing under `seq_no`.
    MissingRecord { ledger_id: LedgerId, seq_no: SeqNo },

    /// More transactions were to be committed or discarded than are uncommitted.
    NotEnoughUncommittedTxns {
        ledger_id: LedgerId,
        requested: usize,
        available: usize,
    },

    /// The store assigned a sequence number other than the next one.
    StoreSequenceMismatch {
        ledger_id: LedgerId,
        expected: SeqNo,
        actual: SeqNo,
    },

    /// A rebuilt uncommitted root does not match the root recorded for the same uncommitted size.
    Inconsistency {
        ledger_id: LedgerId,
        expected: CryptoHash,
        actual: CryptoHash,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct VecStore(Vec<Vec<u8>>);

    impl TxnStore for VecStore {
        fn append(&mut self, record: Vec<u8>) -> SeqNo {
            self.0.push(record);
            SeqNo::new(self.0.len() as u64)
        }

        fn get(&self, seq_no: SeqNo) -> Option<Vec<u8>> {
            let idx = (seq_no.int() as usize).checked_sub(1)?;
            self.0.get(idx).cloned()
        }

        fn size(&self) -> u64 {
            self.0.len() as u64
        }
    }

    // Numbers its records one too high from the `skip_at`-th record on.
    struct SkippingStore {
        records: VecStore,
        skip_at: u64,
    }

    impl TxnStore for SkippingStore {
        fn append(&mut self, record: Vec<u8>) -> SeqNo {
            let seq_no = self.records.append(record);
            if seq_no.int() >= self.skip_at {
                SeqNo::new(seq_no.int() + 1)
            } else {
                seq_no
            }
        }

        fn get(&self, seq_no: SeqNo) -> Option<Vec<u8>> {
            self.records.get(seq_no)
        }

        fn size(&self) -> u64 {
            self.records.size()
        }
    }

    fn txns(from: u64, count: u64) -> Vec<Transaction> {
        (from..from + count)
            .map(|i| Transaction::new(format!("txn {}", i).into_bytes()))
            .collect()
    }

    fn ledger() -> Ledger<VecStore> {
        Ledger::new(LedgerId::new(1), VecStore::default()).unwrap()
    }

    #[test]
    fn append_reports_ranges_and_sizes() {
        let mut ledger = ledger();
        assert_eq!(ledger.uncommitted_root_hash(), None);

        let (range, _) = ledger.append_txns(txns(0, 3));
        assert_eq!(range, SeqNoRange::new(1, 3));
        let (range, _) = ledger.append_txns(txns(3, 2));
        assert_eq!(range, SeqNoRange::new(4, 5));
        assert_eq!(ledger.uncommitted_size(), 5);
        assert_eq!(ledger.size(), 0);

        // Empty append is anchored at the uncommitted size.
        let (range, appended) = ledger.append_txns(Vec::new());
        assert_eq!(range, SeqNoRange::new(5, 5));
        assert!(appended.is_empty());
        assert_eq!(ledger.uncommitted_size(), 5);
    }

    #[test]
    fn failed_commit_keeps_unwritten_txns_queued() {
        let store = SkippingStore {
            records: VecStore::default(),
            skip_at: 3,
        };
        let mut ledger = Ledger::new(LedgerId::new(1), store).unwrap();
        let appended = txns(0, 4);
        ledger.append_txns(appended.clone());
        let uncommitted_root = ledger.uncommitted_root_hash();

        assert!(matches!(
            ledger.commit_txns(4),
            Err(LedgerError::StoreSequenceMismatch { .. })
        ));
        assert_eq!(ledger.size(), 2);
        assert_eq!(ledger.uncommitted_size(), 4);
        assert_eq!(ledger.uncommitted_root_hash(), uncommitted_root);
        let queued: Vec<&[u8]> = ledger
            .uncommitted_txns()
            .map(|txn| txn.payload.as_slice())
            .collect();
        assert_eq!(queued, vec![appended[2].payload.as_slice(), appended[3].payload.as_slice()]);
    }

    #[test]
    fn discarding_what_was_appended_restores_the_root() {
        let mut ledger = ledger();
        ledger.append_txns(txns(0, 4));
        ledger.commit_txns(4).unwrap();
        ledger.append_txns(txns(4, 3));
        let root_before = ledger.uncommitted_root_hash();
        let size_before = ledger.uncommitted_size();

        ledger.append_txns(txns(7, 5));
        assert_ne!(ledger.uncommitted_root_hash(), root_before);
        ledger.discard_txns(5).unwrap();

        assert_eq!(ledger.uncommitted_root_hash(), root_before);
        assert_eq!(ledger.uncommitted_size(), size_before);

        // Discarding everything clears the uncommitted tree.
        ledger.discard_txns(3).unwrap();
        assert_eq!(ledger.uncommitted_root_hash(), None);
        assert_eq!(ledger.uncommitted_size(), ledger.size());

        // Discarding nothing does nothing.
        ledger.discard_txns(0).unwrap();
        assert_eq!(ledger.uncommitted_size(), 4);
    }

    #[test]
    fn reset_uncommitted_is_idempotent() {
        let mut ledger = ledger();
        ledger.append_txns(txns(0, 2));
        ledger.commit_txns(1).unwrap();
        ledger.append_txns(txns(2, 6));

        ledger.reset_uncommitted();
        assert_eq!(ledger.uncommitted_root_hash(), None);
        assert_eq!(ledger.uncommitted_size(), 1);
        assert_eq!(ledger.uncommitted_txns().count(), 0);

        ledger.reset_uncommitted();
        assert_eq!(ledger.uncommitted_root_hash(), None);
        assert_eq!(ledger.uncommitted_size(), 1);
        assert_eq!(ledger.size(), 1);
    }

    #[test]
    fn consecutive_commits_take_from_the_front() {
        let mut ledger = ledger();
        let appended = txns(0, 7);
        ledger.append_txns(appended.clone());

        let (first, committed) = ledger.commit_txns(3).unwrap();
        assert_eq!(first, SeqNoRange::new(1, 3));
        assert_eq!(committed[0].payload, appended[0].payload);
        assert_eq!(committed[2].seq_no, Some(SeqNo::new(3)));
        // The uncommitted tree still exists and still covers everything.
        assert!(ledger.uncommitted_root_hash().is_some());

        let (second, committed) = ledger.commit_txns(4).unwrap();
        assert_eq!(second, SeqNoRange::new(4, 7));
        assert_eq!(committed[3].payload, appended[6].payload);
        assert_eq!(ledger.uncommitted_root_hash(), None);
        assert_eq!(ledger.size(), 7);

        // Zero-count commit is anchored after the committed size.
        let (empty, _) = ledger.commit_txns(0).unwrap();
        assert_eq!(empty, SeqNoRange::new(8, 7));

        assert!(matches!(
            ledger.commit_txns(1),
            Err(LedgerError::NotEnoughUncommittedTxns { requested: 1, available: 0, .. })
        ));
    }

    #[test]
    fn committed_root_is_independent_of_speculative_history() {
        let mut incremental = ledger();
        incremental.append_txns(txns(0, 3));
        incremental.append_txns(txns(100, 4));
        incremental.discard_txns(4).unwrap();
        incremental.append_txns(txns(3, 5));
        incremental.commit_txns(8).unwrap();

        let mut direct = ledger();
        direct.append_committed_txns(txns(0, 8)).unwrap();

        assert_eq!(incremental.root_hash(), direct.root_hash());
        assert_eq!(incremental.size(), direct.size());

        // The uncommitted root before commit equals the committed root after it.
        let mut speculative = ledger();
        speculative.append_txns(txns(0, 8));
        assert_eq!(speculative.uncommitted_root_hash(), Some(direct.root_hash()));
    }

    #[test]
    fn committed_catch_up_rebases_speculative_txns() {
        let mut ledger = ledger();
        ledger.append_txns(txns(10, 2));
        ledger.append_committed_txns(txns(0, 3)).unwrap();
        assert_eq!(ledger.size(), 3);
        assert_eq!(ledger.uncommitted_size(), 5);

        let mut expected = self::ledger();
        expected.append_committed_txns(txns(0, 3)).unwrap();
        expected.append_txns(txns(10, 2));
        assert_eq!(ledger.uncommitted_root_hash(), expected.uncommitted_root_hash());
    }

    #[test]
    fn reopening_a_store_recovers_the_committed_tree() {
        let mut ledger = ledger();
        ledger.append_txns(txns(0, 5));
        ledger.commit_txns(5).unwrap();
        ledger.append_txns(txns(5, 1));
        let root = ledger.root_hash();

        let reopened = Ledger::new(LedgerId::new(1), ledger.into_store()).unwrap();
        assert_eq!(reopened.size(), 5);
        assert_eq!(reopened.root_hash(), root);
        assert_eq!(reopened.uncommitted_root_hash(), None);
        assert_eq!(
            reopened.get(SeqNo::new(2)).map(|txn| txn.payload),
            Some(b"txn 1".to_vec())
        );
    }
}
