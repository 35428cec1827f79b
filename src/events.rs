/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events that a [`Node`](crate::node::Node) emits for event handling and
//! logging.
//!
//! An event for a given action indicates that the action has been completed. Events are published
//! by the sub-protocols as they happen, and handed to the registered handlers in publication order at
//! the end of every [`Node::poll`](crate::node::Node::poll).

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::{
    checkpoints::messages::Checkpoint,
    three_phase::{
        messages::{Commit, Ordered, PrePrepare, Prepare},
        types::RejectReason,
    },
    types::{
        crypto_primitives::VerifyingKey,
        data_types::{InstanceId, LedgerId, PpSeqNo, SeqNoRange, ViewNumber},
    },
    view_change::messages::OrderedState,
};

pub enum Event {
    // Events that change the ledgers.
    CommitTxns(CommitTxnsEvent),
    DiscardTxns(DiscardTxnsEvent),
    // Three-phase protocol events.
    Propose(ProposeEvent),
    ReceivePrePrepare(ReceivePrePrepareEvent),
    Prepare(PrepareEvent),
    Commit(CommitEvent),
    Order(OrderEvent),
    RejectMessage(RejectMessageEvent),
    // Checkpoint events.
    SendCheckpoint(SendCheckpointEvent),
    StableCheckpoint(StableCheckpointEvent),
    // Monitoring and view change events.
    MasterDegraded(MasterDegradedEvent),
    StartViewChange(StartViewChangeEvent),
    ViewChangeTimeout(ViewChangeTimeoutEvent),
    CompleteViewChange(CompleteViewChangeEvent),
    CatchupNeeded(CatchupNeededEvent),
}

impl Event {
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            // The receiving end lives as long as the node that owns every publisher.
            let _ = event_publisher.send(self);
        }
    }
}

/// The master instance ordered a batch, and its transactions were committed to `ledger_id`.
pub struct CommitTxnsEvent {
    pub timestamp: SystemTime,
    pub ledger_id: LedgerId,
    pub range: SeqNoRange,
}

/// Speculative transactions were discarded from `ledger_id`, either because a view change unwound
/// batches that were not ordered, or because a Pre-Prepare was rejected after being applied.
pub struct DiscardTxnsEvent {
    pub timestamp: SystemTime,
    pub ledger_id: LedgerId,
    pub count: usize,
}

/// This node, as the primary of an instance, broadcasted a Pre-Prepare.
pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub pre_prepare: PrePrepare,
}

/// This node accepted a Pre-Prepare from the primary of an instance.
pub struct ReceivePrePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub pre_prepare: PrePrepare,
}

/// This node broadcasted a Prepare.
pub struct PrepareEvent {
    pub timestamp: SystemTime,
    pub prepare: Prepare,
}

/// This node collected a quorum of Prepares and broadcasted a Commit.
pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub commit: Commit,
}

/// An instance ordered a batch.
pub struct OrderEvent {
    pub timestamp: SystemTime,
    pub ordered: Ordered,
}

/// A message was rejected. Rejections are never fatal: the message is dropped and no vote is cast.
pub struct RejectMessageEvent {
    pub timestamp: SystemTime,
    pub origin: VerifyingKey,
    pub inst_id: InstanceId,
    pub view_no: ViewNumber,
    pub pp_seq_no: PpSeqNo,
    pub reason: RejectReason,
}

/// This node ordered a full checkpoint window and broadcasted its checkpoint.
pub struct SendCheckpointEvent {
    pub timestamp: SystemTime,
    pub checkpoint: Checkpoint,
}

/// A checkpoint became stable, and everything up to its end was garbage collected.
pub struct StableCheckpointEvent {
    pub timestamp: SystemTime,
    pub checkpoint: Checkpoint,
}

/// The degradation detector found the master instance to be degraded.
pub struct MasterDegradedEvent {
    pub timestamp: SystemTime,
    pub view_no: ViewNumber,
}

/// This node started (or joined, or escalated) a view change to `target`.
pub struct StartViewChangeEvent {
    pub timestamp: SystemTime,
    pub view_no: ViewNumber,
    pub target: ViewNumber,
}

/// A view change to `target` did not complete in time, and this node re-broadcasted its report.
pub struct ViewChangeTimeoutEvent {
    pub timestamp: SystemTime,
    pub target: ViewNumber,
    pub retries: u32,
}

/// A quorum agreed on `state`, and this node moved to `view_no`.
pub struct CompleteViewChangeEvent {
    pub timestamp: SystemTime,
    pub view_no: ViewNumber,
    pub state: OrderedState,
}

/// This node completed a view change but its own ordered state differs from the agreed one, so it
/// must catch up through an outer layer.
pub struct CatchupNeededEvent {
    pub timestamp: SystemTime,
    pub view_no: ViewNumber,
    pub own: OrderedState,
    pub agreed: OrderedState,
}
