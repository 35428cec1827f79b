/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! RBFT-rs is a Rust Programming Language implementation of the ordering core of Redundant BFT. It
//! offers:
//! 1. Three-phase agreement (Pre-Prepare, Prepare, Commit) on batches of requests, run by `f + 1`
//!    parallel [instances](three_phase) of which only the master's output is applied,
//! 2. [Checkpoints](checkpoints) that garbage collect protocol state every `chk_freq` batches,
//! 3. A [throughput monitor](monitor) that compares the master against the backups and triggers a
//!    [view change](view_change) when the master is degraded,
//! 4. Merkle-tree [ledgers](ledger) with a speculative, uncommitted overlay,
//! 5. And a small API: an [app::App] for the state machine behind the ledgers, pluggable
//!    peer-to-peer [networking], and pluggable ledger [persistence](ledger::pluggables).
//!
//! Start from [node], which shows how to build and poll a [`Node`](node::Node).

pub mod app;

pub mod checkpoints;

pub mod config;

pub(crate) mod event_bus;

pub mod events;

pub mod ledger;

pub mod logging;

pub mod monitor;

pub mod networking;

pub mod node;

pub mod three_phase;

pub mod types;

pub mod view_change;
