/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The view change protocol, which replaces the primaries of every instance at once.
//!
//! # State machine
//!
//! A node is either *stable* in view `v`, or *changing* to a target view above `v`:
//!
//! ```text
//! Stable(v) --[master degraded, or explicit trigger]--> ViewChanging(v + 1)
//! ViewChanging(t) --[strong quorum reports the same ordered state for a view u above the current one]--> Stable(u)
//! ViewChanging(t) --[timed out view_change_max_retries times, t backed by another node]--> ViewChanging(t + 1)
//! ```
//!
//! A node whose target no other node backs keeps re-broadcasting for that target instead of moving
//! on alone.
//!
//! While changing views, replicas stop accepting new Pre-Prepares but keep preparing and committing
//! the ones they already accepted, and the node re-broadcasts its [`ViewChangeDone`](messages::ViewChangeDone)
//! whenever it orders more.
//!
//! # Completion
//!
//! On completion, every replica drops its three-phase bookkeeping and checkpoint votes, unwinds
//! the batches it applied but did not order, and resumes numbering after the agreed last ordered
//! batch under the primary of the new view. Ordered batches and committed ledger content are never
//! touched. A node whose own state differs from the agreed one completes anyway, and reports that it
//! needs to catch up.
//!
//! # Joining
//!
//! A node that sees `f + 1` other nodes changing to views above its own joins them, since at least
//! one of them is honest.

pub mod implementation;

pub mod messages;
