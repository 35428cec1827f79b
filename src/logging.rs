/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the node's
//! [configuration](crate::config::Configuration).
//!
//! Events are logged using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ReceivePrePrepare](crate::events::ReceivePrePrepareEvent) is printed:
//!
//! ```text
//! ReceivePrePrepare, 1701329264, Id5u7f6, 0, 3, 17, fNGCJyk
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the public address of the
//!   origin of the Pre-Prepare.
//! - The fourth, fifth and sixth values are its instance id, view number, and sequence number.
//! - The seventh value is the first seven characters of the Base64 encoding of the batch digest.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;
use std::time::SystemTime;

use crate::{
    checkpoints::messages::Checkpoint,
    events::*,
    types::data_types::{InstanceId, PpSeqNo},
};

// Names of each event in PascalCase for printing:
pub const COMMIT_TXNS: &str = "CommitTxns";
pub const DISCARD_TXNS: &str = "DiscardTxns";

pub const PROPOSE: &str = "Propose";
pub const RECEIVE_PRE_PREPARE: &str = "ReceivePrePrepare";
pub const PREPARE: &str = "Prepare";
pub const COMMIT: &str = "Commit";
pub const ORDER: &str = "Order";
pub const REJECT_MESSAGE: &str = "RejectMessage";

pub const SEND_CHECKPOINT: &str = "SendCheckpoint";
pub const STABLE_CHECKPOINT: &str = "StableCheckpoint";

pub const MASTER_DEGRADED: &str = "MasterDegraded";
pub const START_VIEW_CHANGE: &str = "StartViewChange";
pub const VIEW_CHANGE_TIMEOUT: &str = "ViewChangeTimeout";
pub const COMPLETE_VIEW_CHANGE: &str = "CompleteViewChange";
pub const CATCHUP_NEEDED: &str = "CatchupNeeded";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for CommitTxnsEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_txns_event: &CommitTxnsEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT_TXNS,
                secs_since_unix_epoch(commit_txns_event.timestamp),
                commit_txns_event.ledger_id,
                commit_txns_event.range.start,
                commit_txns_event.range.end
            )
        };
        Box::new(logger)
    }
}

impl Logger for DiscardTxnsEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |discard_txns_event: &DiscardTxnsEvent| {
            log::info!(
                "{}, {}, {}, {}",
                DISCARD_TXNS,
                secs_since_unix_epoch(discard_txns_event.timestamp),
                discard_txns_event.ledger_id,
                discard_txns_event.count
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(propose_event.timestamp),
                propose_event.pre_prepare.inst_id,
                propose_event.pre_prepare.view_no,
                propose_event.pre_prepare.pp_seq_no,
                first_seven_base64_chars(&propose_event.pre_prepare.digest.bytes()),
                propose_event.pre_prepare.req_idr.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceivePrePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_pre_prepare_event: &ReceivePrePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                RECEIVE_PRE_PREPARE,
                secs_since_unix_epoch(receive_pre_prepare_event.timestamp),
                first_seven_base64_chars(&receive_pre_prepare_event.origin.to_bytes()),
                receive_pre_prepare_event.pre_prepare.inst_id,
                receive_pre_prepare_event.pre_prepare.view_no,
                receive_pre_prepare_event.pre_prepare.pp_seq_no,
                first_seven_base64_chars(&receive_pre_prepare_event.pre_prepare.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for PrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |prepare_event: &PrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                PREPARE,
                secs_since_unix_epoch(prepare_event.timestamp),
                prepare_event.prepare.inst_id,
                prepare_event.prepare.view_no,
                prepare_event.prepare.pp_seq_no,
                first_seven_base64_chars(&prepare_event.prepare.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_event: &CommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                COMMIT,
                secs_since_unix_epoch(commit_event.timestamp),
                commit_event.commit.inst_id,
                commit_event.commit.view_no,
                commit_event.commit.pp_seq_no,
                first_seven_base64_chars(&commit_event.commit.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for OrderEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |order_event: &OrderEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {}",
                ORDER,
                secs_since_unix_epoch(order_event.timestamp),
                order_event.ordered.inst_id,
                order_event.ordered.view_no,
                order_event.ordered.pp_seq_no,
                order_event.ordered.ledger_id,
                order_event.ordered.req_idr.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for RejectMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reject_message_event: &RejectMessageEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}, {:?}",
                REJECT_MESSAGE,
                secs_since_unix_epoch(reject_message_event.timestamp),
                first_seven_base64_chars(&reject_message_event.origin.to_bytes()),
                reject_message_event.inst_id,
                reject_message_event.view_no,
                reject_message_event.pp_seq_no,
                reject_message_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for SendCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |send_checkpoint_event: &SendCheckpointEvent| {
            log::info!(
                "{}, {}, {}",
                SEND_CHECKPOINT,
                secs_since_unix_epoch(send_checkpoint_event.timestamp),
                checkpoint_info(&send_checkpoint_event.checkpoint)
            )
        };
        Box::new(logger)
    }
}

impl Logger for StableCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |stable_checkpoint_event: &StableCheckpointEvent| {
            log::info!(
                "{}, {}, {}",
                STABLE_CHECKPOINT,
                secs_since_unix_epoch(stable_checkpoint_event.timestamp),
                checkpoint_info(&stable_checkpoint_event.checkpoint)
            )
        };
        Box::new(logger)
    }
}

impl Logger for MasterDegradedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |master_degraded_event: &MasterDegradedEvent| {
            log::info!(
                "{}, {}, {}",
                MASTER_DEGRADED,
                secs_since_unix_epoch(master_degraded_event.timestamp),
                master_degraded_event.view_no
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_view_change_event: &StartViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_VIEW_CHANGE,
                secs_since_unix_epoch(start_view_change_event.timestamp),
                start_view_change_event.view_no,
                start_view_change_event.target
            )
        };
        Box::new(logger)
    }
}

impl Logger for ViewChangeTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |view_change_timeout_event: &ViewChangeTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}",
                VIEW_CHANGE_TIMEOUT,
                secs_since_unix_epoch(view_change_timeout_event.timestamp),
                view_change_timeout_event.target,
                view_change_timeout_event.retries
            )
        };
        Box::new(logger)
    }
}

impl Logger for CompleteViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |complete_view_change_event: &CompleteViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COMPLETE_VIEW_CHANGE,
                secs_since_unix_epoch(complete_view_change_event.timestamp),
                complete_view_change_event.view_no,
                last_ordered_info(&complete_view_change_event.state.last_ordered)
            )
        };
        Box::new(logger)
    }
}

impl Logger for CatchupNeededEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |catchup_needed_event: &CatchupNeededEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}",
                CATCHUP_NEEDED,
                secs_since_unix_epoch(catchup_needed_event.timestamp),
                catchup_needed_event.view_no,
                last_ordered_info(&catchup_needed_event.own.last_ordered),
                last_ordered_info(&catchup_needed_event.agreed.last_ordered)
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

fn checkpoint_info(checkpoint: &Checkpoint) -> String {
    format!(
        "{}, {}, {}, {}, {}",
        checkpoint.inst_id,
        checkpoint.view_no,
        checkpoint.seq_no_start,
        checkpoint.seq_no_end,
        first_seven_base64_chars(&checkpoint.digest.bytes())
    )
}

// Instances are listed as "inst:pp_seq_no" pairs separated by spaces, to keep the line a valid CSV.
fn last_ordered_info(last_ordered: &[(InstanceId, PpSeqNo)]) -> String {
    last_ordered
        .iter()
        .map(|(inst_id, pp_seq_no)| format!("{}:{}", inst_id, pp_seq_no))
        .collect::<Vec<_>>()
        .join(" ")
}
