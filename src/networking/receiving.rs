/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Buffering of received messages that cannot be processed yet.

use std::collections::{BTreeMap, VecDeque};

use crate::{
    three_phase::messages::ThreePhaseMessage,
    types::{crypto_primitives::VerifyingKey, data_types::ViewNumber},
};

/// Message buffer for [`ThreePhaseMessage`]s from views this node has not entered yet.
///
/// A node that completes a view change later than its peers receives Pre-Prepares, Prepares and
/// Commits for the new view before it is in it. These are kept here and replayed once the view
/// change completes.
///
/// ## Buffer management
///
/// The buffer holds at most `capacity` messages. If it is full, inserting a message removes a
/// message from the highest buffered view to make space, unless the new message's view is itself
/// the highest, in which case the new message is dropped.
pub(crate) struct FutureViewBuffer {
    capacity: usize,
    buffer: BTreeMap<ViewNumber, VecDeque<(VerifyingKey, ThreePhaseMessage)>>,
    len: usize,
}

impl FutureViewBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffer: BTreeMap::new(),
            len: 0,
        }
    }

    /// Try inserting the message into the buffer. Returns whether the message was inserted.
    pub(crate) fn insert(&mut self, msg: ThreePhaseMessage, sender: VerifyingKey) -> bool {
        if self.len >= self.capacity {
            let Some(mut highest) = self.buffer.last_entry() else {
                return false;
            };
            if msg.view_no() >= *highest.key() {
                return false;
            }
            highest.get_mut().pop_back();
            if highest.get().is_empty() {
                highest.remove();
            }
            self.len -= 1;
        }

        self.buffer
            .entry(msg.view_no())
            .or_default()
            .push_back((sender, msg));
        self.len += 1;
        true
    }

    /// Remove and return every message for `view_no`, in the order they were received. Messages for
    /// lower views are dropped.
    pub(crate) fn take(&mut self, view_no: ViewNumber) -> VecDeque<(VerifyingKey, ThreePhaseMessage)> {
        self.buffer = self.buffer.split_off(&view_no);
        let msgs = self.buffer.remove(&view_no).unwrap_or_default();
        self.len = self.buffer.values().map(VecDeque::len).sum();
        msgs
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}
