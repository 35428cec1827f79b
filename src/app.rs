/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`App`] trait: the application state machine whose transactions the ledgers record.

use crate::types::{
    data_types::{CryptoHash, LedgerId},
    requests::{Request, Transaction},
};

/// Methods that a type needs to implement to serve as a deterministic state transition function
/// behind the ledgers.
///
/// Every replica asks the `App` to validate requests, but only the master instance applies batches
/// to it. Batches are applied speculatively when they are
/// pre-prepared, then either committed (once ordered) or discarded (when a view change unwinds the
/// batches that were not ordered in time, or when a Pre-Prepare is rejected after application).
/// Batches are always committed oldest first and discarded newest first, per ledger, mirroring the
/// [ledger's](crate::ledger::Ledger) uncommitted queue.
///
/// Besides implementing the functions specified in the trait, implementors are additionally
/// expected to be *deterministic*: every node must compute the same state root for the same
/// sequence of batches.
pub trait App: Send {
    /// Called by the node when `request` is submitted, by a backup before it accepts a Pre-Prepare
    /// that refers to `request`, and by a primary before it batches `request`. Invalid requests are
    /// turned away at submission, and cause the whole Pre-Prepare to be rejected.
    fn validate_request(&mut self, request: &Request) -> bool;

    /// Speculatively apply a batch of `txns` to the state of `ledger_id`.
    ///
    /// # Return value
    ///
    /// The state root after applying the batch on top of every previously applied, not yet
    /// discarded batch.
    fn apply_batch(&mut self, ledger_id: LedgerId, txns: &[Transaction]) -> CryptoHash;

    /// Unwind the `count` most recently applied batches of `ledger_id`.
    fn discard_batches(&mut self, ledger_id: LedgerId, count: usize);

    /// Make the `count` oldest speculatively applied batches of `ledger_id` permanent.
    fn commit_batches(&mut self, ledger_id: LedgerId, count: usize);
}
