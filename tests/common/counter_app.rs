//! [`CounterApp`], a simple implementation of [`App`] used in all of the integration tests.
//!
//! The state of every ledger is the number of transactions applied to it. Requests with an empty
//! payload are invalid.

use std::collections::{BTreeMap, VecDeque};

use borsh::BorshSerialize;
use rbft_rs::{
    app::App,
    types::{
        crypto_primitives::{CryptoHasher, Digest},
        data_types::{CryptoHash, LedgerId},
        requests::{Request, Transaction},
    },
};

#[derive(Default)]
pub(crate) struct CounterApp {
    committed: BTreeMap<LedgerId, u64>,
    // Sizes of the batches applied but not yet committed, oldest first.
    applied: BTreeMap<LedgerId, VecDeque<u64>>,
}

impl CounterApp {
    pub(crate) fn new() -> CounterApp {
        CounterApp::default()
    }

    /// Number of transactions committed to `ledger_id`.
    pub(crate) fn committed(&self, ledger_id: LedgerId) -> u64 {
        self.committed.get(&ledger_id).copied().unwrap_or(0)
    }

    /// Number of batches applied to `ledger_id` that are neither committed nor discarded.
    pub(crate) fn speculative_batches(&self, ledger_id: LedgerId) -> usize {
        self.applied.get(&ledger_id).map_or(0, VecDeque::len)
    }

    fn state_root(&self, ledger_id: LedgerId) -> CryptoHash {
        let applied: u64 = self.applied.get(&ledger_id).map_or(0, |sizes| sizes.iter().sum());
        let count = self.committed(ledger_id) + applied;
        let mut hasher = CryptoHasher::new();
        hasher.update((ledger_id.int(), count).try_to_vec().unwrap());
        CryptoHash::new(hasher.finalize().into())
    }
}

impl App for CounterApp {
    fn validate_request(&mut self, request: &Request) -> bool {
        !request.payload.is_empty()
    }

    fn apply_batch(&mut self, ledger_id: LedgerId, txns: &[Transaction]) -> CryptoHash {
        self.applied
            .entry(ledger_id)
            .or_default()
            .push_back(txns.len() as u64);
        self.state_root(ledger_id)
    }

    fn discard_batches(&mut self, ledger_id: LedgerId, count: usize) {
        let applied = self.applied.entry(ledger_id).or_default();
        for _ in 0..count {
            applied.pop_back();
        }
    }

    fn commit_batches(&mut self, ledger_id: LedgerId, count: usize) {
        let applied = self.applied.entry(ledger_id).or_default();
        let committed: u64 = (0..count).filter_map(|_| applied.pop_front()).sum();
        *self.committed.entry(ledger_id).or_default() += committed;
    }
}
