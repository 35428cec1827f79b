/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    ledger::LedgerSummary,
    types::data_types::{InstanceId, PpSeqNo, ViewNumber},
};

/// Broadcast by a node that is changing to view `view_no`, reporting what it has ordered so far.
///
/// A node re-broadcasts this message every time its [`OrderedState`] changes while it is still
/// changing views, and only the latest report from each sender is taken into account.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ViewChangeDone {
    pub view_no: ViewNumber,
    pub state: OrderedState,
}

/// Everything a node has durably agreed on: the last ordered sequence number of every instance,
/// and the size and root of every ledger's committed tree.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct OrderedState {
    /// One entry per instance, in instance order.
    pub last_ordered: Vec<(InstanceId, PpSeqNo)>,

    /// One entry per ledger, in ledger id order.
    pub ledgers: Vec<LedgerSummary>,
}

impl OrderedState {
    /// Get the last ordered sequence number of `inst_id`.
    pub fn last_ordered_of(&self, inst_id: InstanceId) -> Option<PpSeqNo> {
        self.last_ordered
            .iter()
            .find(|(id, _)| *id == inst_id)
            .map(|(_, pp_seq_no)| *pp_seq_no)
    }
}
