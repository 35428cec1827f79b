/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged by replicas of the same instance in the three-phase protocol, and the
//! [`Ordered`] record they produce.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    crypto_primitives::hash_of,
    data_types::{CryptoHash, InstanceId, LedgerId, PpSeqNo, ViewNumber},
};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ThreePhaseMessage {
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
}

impl ThreePhaseMessage {
    pub fn inst_id(&self) -> InstanceId {
        match self {
            ThreePhaseMessage::PrePrepare(msg) => msg.inst_id,
            ThreePhaseMessage::Prepare(msg) => msg.inst_id,
            ThreePhaseMessage::Commit(msg) => msg.inst_id,
        }
    }

    pub fn view_no(&self) -> ViewNumber {
        match self {
            ThreePhaseMessage::PrePrepare(msg) => msg.view_no,
            ThreePhaseMessage::Prepare(msg) => msg.view_no,
            ThreePhaseMessage::Commit(msg) => msg.view_no,
        }
    }

    pub fn pp_seq_no(&self) -> PpSeqNo {
        match self {
            ThreePhaseMessage::PrePrepare(msg) => msg.pp_seq_no,
            ThreePhaseMessage::Prepare(msg) => msg.pp_seq_no,
            ThreePhaseMessage::Commit(msg) => msg.pp_seq_no,
        }
    }
}

/// Sent by the primary of an instance to propose the next batch of requests.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrePrepare {
    pub inst_id: InstanceId,
    pub view_no: ViewNumber,
    pub pp_seq_no: PpSeqNo,
    /// Seconds since the Unix Epoch, as read by the primary when it created the batch.
    pub pp_time: u64,
    /// Digests of the batched requests, in batch order.
    pub req_idr: Vec<CryptoHash>,
    pub digest: CryptoHash,
    pub ledger_id: LedgerId,
    pub state_root_hash: CryptoHash,
    pub txn_root_hash: CryptoHash,
}

impl PrePrepare {
    /// Compute the digest of a batch: the hash of its time and request digests.
    pub fn batch_digest(pp_time: u64, req_idr: &[CryptoHash]) -> CryptoHash {
        hash_of(&(pp_time, req_idr.to_vec()))
    }

    pub(crate) fn prepare_ballot(&self) -> PrepareBallot {
        PrepareBallot {
            digest: self.digest,
            state_root_hash: self.state_root_hash,
            txn_root_hash: self.txn_root_hash,
        }
    }
}

/// Sent by backups that accepted a Pre-Prepare.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Prepare {
    pub inst_id: InstanceId,
    pub view_no: ViewNumber,
    pub pp_seq_no: PpSeqNo,
    pub digest: CryptoHash,
    pub state_root_hash: CryptoHash,
    pub txn_root_hash: CryptoHash,
}

impl Prepare {
    pub(crate) fn ballot(&self) -> PrepareBallot {
        PrepareBallot {
            digest: self.digest,
            state_root_hash: self.state_root_hash,
            txn_root_hash: self.txn_root_hash,
        }
    }
}

/// Sent by replicas that collected a quorum of matching Prepares.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub inst_id: InstanceId,
    pub view_no: ViewNumber,
    pub pp_seq_no: PpSeqNo,
    pub digest: CryptoHash,
}

/// What a Prepare vote is cast for. Prepares only count towards each other if they agree on the
/// digest and on both roots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PrepareBallot {
    pub(crate) digest: CryptoHash,
    pub(crate) state_root_hash: CryptoHash,
    pub(crate) txn_root_hash: CryptoHash,
}

/// A batch that an instance has finished agreeing on.
///
/// Ordered records of the master instance are the output of the protocol: by the time one is
/// emitted, its transactions have been committed to the ledger. Records of backup instances only
/// feed the [monitor](crate::monitor).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Ordered {
    pub inst_id: InstanceId,
    pub view_no: ViewNumber,
    pub req_idr: Vec<CryptoHash>,
    pub pp_seq_no: PpSeqNo,
    pub pp_time: u64,
    pub ledger_id: LedgerId,
    pub state_root_hash: CryptoHash,
    pub txn_root_hash: CryptoHash,
}

impl From<&PrePrepare> for Ordered {
    fn from(pre_prepare: &PrePrepare) -> Self {
        Ordered {
            inst_id: pre_prepare.inst_id,
            view_no: pre_prepare.view_no,
            req_idr: pre_prepare.req_idr.clone(),
            pp_seq_no: pre_prepare.pp_seq_no,
            pp_time: pre_prepare.pp_time,
            ledger_id: pre_prepare.ledger_id,
            state_root_hash: pre_prepare.state_root_hash,
            txn_root_hash: pre_prepare.txn_root_hash,
        }
    }
}
