/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumeration of every message variant nodes exchange.

use borsh::{BorshDeserialize, BorshSerialize};

pub use crate::{
    checkpoints::messages::Checkpoint,
    three_phase::messages::{Commit, PrePrepare, Prepare, ThreePhaseMessage},
    view_change::messages::ViewChangeDone,
};

/// All message variants.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    /// See: [`ThreePhaseMessage`].
    ThreePhaseMessage(ThreePhaseMessage),

    /// See: [`Checkpoint`].
    Checkpoint(Checkpoint),

    /// See: [`ViewChangeDone`].
    ViewChangeDone(ViewChangeDone),
}

impl From<ThreePhaseMessage> for Message {
    fn from(value: ThreePhaseMessage) -> Self {
        Message::ThreePhaseMessage(value)
    }
}

impl From<PrePrepare> for Message {
    fn from(value: PrePrepare) -> Self {
        Message::ThreePhaseMessage(ThreePhaseMessage::PrePrepare(value))
    }
}

impl From<Prepare> for Message {
    fn from(value: Prepare) -> Self {
        Message::ThreePhaseMessage(ThreePhaseMessage::Prepare(value))
    }
}

impl From<Commit> for Message {
    fn from(value: Commit) -> Self {
        Message::ThreePhaseMessage(ThreePhaseMessage::Commit(value))
    }
}

impl From<Checkpoint> for Message {
    fn from(value: Checkpoint) -> Self {
        Message::Checkpoint(value)
    }
}

impl From<ViewChangeDone> for Message {
    fn from(value: ViewChangeDone) -> Self {
        Message::ViewChangeDone(value)
    }
}
