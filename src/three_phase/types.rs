/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types specific to the three-phase protocol.

use crate::types::data_types::{LedgerId, PpSeqNo, ViewNumber};

/// `(view_no, pp_seq_no)` pair that identifies a batch within an instance.
pub type ThreePhaseKey = (ViewNumber, PpSeqNo);

/// Why a message was rejected.
///
/// Rejections are the normal response to late, early, duplicated or faulty messages: they are
/// reported through [`RejectMessageEvent`](crate::events::RejectMessageEvent)s and never surface as
/// errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The message is for a view other than the current one, or for an unknown instance.
    WrongView,
    /// The sender is not a member of the pool.
    NotInPool,
    /// A Pre-Prepare from a node that is not the primary of the instance.
    NotFromPrimary,
    /// A Prepare from the primary, whose Pre-Prepare already counts as its Prepare.
    PrepareFromPrimary,
    /// A Pre-Prepare received while this node is changing views.
    ViewChangeInProgress,
    /// The sequence number is at or below the low watermark, or above the high watermark.
    OutsideWatermarks,
    /// A message this node already has, or a vote from a sender that already voted.
    Duplicate,
    /// A message about batches this node has moved past.
    Stale,
    /// The Pre-Prepare's digest does not match its contents.
    WrongDigest,
    /// The batch writes to a ledger this node does not maintain.
    UnknownLedger,
    /// A batched request was rejected by the application, or writes to another ledger than its batch.
    InvalidRequest,
    /// The state or transaction root obtained by applying the batch differs from the primary's.
    RootMismatch,
    /// There is no room left to buffer a Commit that arrived before this node prepared.
    BufferFull,
    /// A checkpoint whose window is not `chk_freq` batches wide.
    InvalidCheckpoint,
}

/// A batch that the master instance applied speculatively, and that has not been ordered yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppliedBatch {
    pub ledger_id: LedgerId,
    pub txn_count: usize,
}
