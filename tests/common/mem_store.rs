//! A simple, volatile, in-memory implementation of [`TxnStore`].

use std::sync::{Arc, Mutex};

use rbft_rs::{ledger::pluggables::TxnStore, types::data_types::SeqNo};

/// An in-memory implementation of [`TxnStore`]. Clones share the same records, so a test can keep a
/// handle on a store after handing it to a ledger.
#[derive(Clone)]
pub(crate) struct MemStore(Arc<Mutex<Vec<Vec<u8>>>>);

impl MemStore {
    /// Create a new, empty `MemStore`.
    pub(crate) fn new() -> MemStore {
        MemStore(Arc::new(Mutex::new(Vec::new())))
    }

    pub(crate) fn records(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }
}

impl TxnStore for MemStore {
    fn append(&mut self, record: Vec<u8>) -> SeqNo {
        let mut records = self.0.lock().unwrap();
        records.push(record);
        SeqNo::new(records.len() as u64)
    }

    fn get(&self, seq_no: SeqNo) -> Option<Vec<u8>> {
        let idx = seq_no.int().checked_sub(1)?;
        self.0.lock().unwrap().get(idx as usize).cloned()
    }

    fn size(&self) -> u64 {
        self.0.lock().unwrap().len() as u64
    }
}
