/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable persistence for [ledgers](super::Ledger).

use crate::types::data_types::SeqNo;

/// Durable, append-only storage of committed transaction records.
///
/// Records are the leaf bytes of the ledger's merkle tree (the transactions' payloads). The store
/// assigns 1-based, gapless sequence numbers in append order; a [`Ledger`](super::Ledger) rebuilds
/// its committed merkle tree on startup by reading records `1..=size()` back in order.
pub trait TxnStore: Send {
    /// Append `record` and return the sequence number it was stored under.
    fn append(&mut self, record: Vec<u8>) -> SeqNo;

    /// Get the record stored under `seq_no`, if any.
    fn get(&self, seq_no: SeqNo) -> Option<Vec<u8>>;

    /// Number of records stored.
    fn size(&self) -> u64;
}
