/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`CheckpointTracker`] type, which groups the batches an instance orders into checkpoint
//! windows and detects when a window becomes stable.

use std::collections::BTreeMap;

use crate::{
    three_phase::types::RejectReason,
    types::{
        collectors::VoteCollector,
        crypto_primitives::VerifyingKey,
        data_types::{CryptoHash, InstanceId, PpSeqNo, ViewNumber},
    },
};

use super::messages::Checkpoint;

/// Inclusive `(seq_no_start, seq_no_end)` pair identifying a checkpoint window.
type WindowRange = (PpSeqNo, PpSeqNo);

/// Checkpoint state of one instance of one node.
///
/// ## Windows
///
/// A window is anchored at the first batch ordered after the last stable checkpoint or the last
/// view change, whichever is more recent, and closes once `chk_freq` batches have been ordered in
/// it. On closing a window the tracker produces this node's [`Checkpoint`] for it, which counts as
/// this node's vote for the window.
///
/// ## Stability
///
/// A window becomes stable once a strong quorum of nodes, this node included, voted for the same
/// digest. Only windows this node has itself closed can become stable.
pub struct CheckpointTracker {
    inst_id: InstanceId,
    me: VerifyingKey,
    chk_freq: u64,
    quorum: usize,
    view_no: ViewNumber,
    window_start: Option<PpSeqNo>,
    window_digests: Vec<CryptoHash>,
    own_checkpoints: BTreeMap<WindowRange, Checkpoint>,
    votes: BTreeMap<WindowRange, VoteCollector<CryptoHash>>,
    stable_checkpoint: Option<Checkpoint>,
}

impl CheckpointTracker {
    pub fn new(inst_id: InstanceId, me: VerifyingKey, chk_freq: u64, quorum: usize) -> Self {
        Self {
            inst_id,
            me,
            chk_freq,
            quorum,
            view_no: ViewNumber::init(),
            window_start: None,
            window_digests: Vec::new(),
            own_checkpoints: BTreeMap::new(),
            votes: BTreeMap::new(),
            stable_checkpoint: None,
        }
    }

    /// Record that the batch `pp_seq_no` with `digest` was ordered. Batches must be recorded in
    /// order.
    ///
    /// Returns this node's checkpoint if the batch closed a window.
    pub fn on_batch_ordered(&mut self, pp_seq_no: PpSeqNo, digest: CryptoHash) -> Option<Checkpoint> {
        let start = *self.window_start.get_or_insert(pp_seq_no);
        self.window_digests.push(digest);
        if (self.window_digests.len() as u64) < self.chk_freq {
            return None;
        }

        let checkpoint = Checkpoint {
            inst_id: self.inst_id,
            view_no: self.view_no,
            seq_no_start: start,
            seq_no_end: pp_seq_no,
            digest: Checkpoint::window_digest(self.inst_id, start, pp_seq_no, &self.window_digests),
        };
        self.window_start = None;
        self.window_digests.clear();

        let range = (checkpoint.seq_no_start, checkpoint.seq_no_end);
        self.votes
            .entry(range)
            .or_default()
            .collect(self.me, checkpoint.digest);
        self.own_checkpoints.insert(range, checkpoint.clone());
        Some(checkpoint)
    }

    /// Record `origin`'s vote for `checkpoint`.
    pub fn on_receive_checkpoint(
        &mut self,
        origin: VerifyingKey,
        checkpoint: &Checkpoint,
    ) -> Result<(), RejectReason> {
        if checkpoint.inst_id != self.inst_id || checkpoint.view_no != self.view_no {
            return Err(RejectReason::WrongView);
        }
        if checkpoint.seq_no_end < checkpoint.seq_no_start
            || checkpoint.seq_no_end - checkpoint.seq_no_start + 1 != self.chk_freq
        {
            return Err(RejectReason::InvalidCheckpoint);
        }
        if checkpoint.seq_no_end <= self.stable_seq_no() {
            return Err(RejectReason::Stale);
        }

        let counted = self
            .votes
            .entry((checkpoint.seq_no_start, checkpoint.seq_no_end))
            .or_default()
            .collect(origin, checkpoint.digest);
        if counted {
            Ok(())
        } else {
            Err(RejectReason::Duplicate)
        }
    }

    /// Check whether any window this node closed has collected a quorum, and if so, make the most
    /// recent such window the stable checkpoint and forget every window up to it.
    pub fn try_stabilize(&mut self) -> Option<Checkpoint> {
        let stable = self
            .own_checkpoints
            .iter()
            .rev()
            .find(|(range, own)| {
                self.votes
                    .get(*range)
                    .is_some_and(|votes| votes.count(&own.digest) >= self.quorum)
            })
            .map(|(_, own)| own.clone())?;

        let end = stable.seq_no_end;
        self.own_checkpoints.retain(|(_, range_end), _| *range_end > end);
        self.votes.retain(|(_, range_end), _| *range_end > end);
        self.stable_checkpoint = Some(stable.clone());
        Some(stable)
    }

    /// Forget every vote and the open window, and start counting anew in `view_no`. The stable
    /// checkpoint is kept.
    pub fn reset(&mut self, view_no: ViewNumber) {
        self.view_no = view_no;
        self.window_start = None;
        self.window_digests.clear();
        self.own_checkpoints.clear();
        self.votes.clear();
    }

    /// The most recent stable checkpoint, if any.
    pub fn stable_checkpoint(&self) -> Option<&Checkpoint> {
        self.stable_checkpoint.as_ref()
    }

    /// End of the most recent stable checkpoint, or 0 if there is none.
    pub fn stable_seq_no(&self) -> PpSeqNo {
        self.stable_checkpoint
            .as_ref()
            .map_or(PpSeqNo::new(0), |checkpoint| checkpoint.seq_no_end)
    }

    /// Number of batches ordered in the open window.
    pub fn open_window_len(&self) -> usize {
        self.window_digests.len()
    }

    /// Number of windows for which votes are held.
    pub fn pending_windows(&self) -> usize {
        self.votes.len()
    }
}
