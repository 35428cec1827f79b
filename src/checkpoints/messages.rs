/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    crypto_primitives::hash_of,
    data_types::{CryptoHash, InstanceId, PpSeqNo, ViewNumber},
};

/// A replica's claim that it ordered the batches `seq_no_start..=seq_no_end` of an instance, and
/// that their combined digest is `digest`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Checkpoint {
    pub inst_id: InstanceId,
    pub view_no: ViewNumber,
    pub seq_no_start: PpSeqNo,
    pub seq_no_end: PpSeqNo,
    pub digest: CryptoHash,
}

impl Checkpoint {
    /// Digest of a window of ordered batches, given the batches' digests in order.
    pub fn window_digest(
        inst_id: InstanceId,
        seq_no_start: PpSeqNo,
        seq_no_end: PpSeqNo,
        batch_digests: &[CryptoHash],
    ) -> CryptoHash {
        hash_of(&(inst_id, seq_no_start, seq_no_end, batch_digests.to_vec()))
    }
}
