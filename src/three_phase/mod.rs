/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The three-phase agreement protocol run by every instance.
//!
//! # Phases
//!
//! For every batch, the primary of an instance broadcasts a [`PrePrepare`](messages::PrePrepare).
//! Replicas that accept it broadcast a [`Prepare`](messages::Prepare), and once a replica holds the
//! Pre-Prepare together with a strong quorum of matching Prepares (the Pre-Prepare counting as the
//! primary's Prepare), the batch is *prepared* and the replica broadcasts a
//! [`Commit`](messages::Commit). A prepared batch with a strong quorum of matching Commits is
//! *ordered*, strictly in sequence number order, producing an [`Ordered`](messages::Ordered) record.
//!
//! # Speculative application
//!
//! In the master instance, batches are applied to the ledgers and the [`App`](crate::app::App) as
//! soon as they are proposed or accepted, and the resulting roots are bound into the Pre-Prepare and
//! the Prepare votes. The node commits the batch once it is ordered. Batches that are not ordered by
//! the time a view change completes are rolled back.
//!
//! # Watermarks
//!
//! Replicas only handle sequence numbers in the window `(h, H]`, where `h` is the end of the last
//! stable [checkpoint](crate::checkpoints) and `H = h + log_size`. A primary that reaches `H` stops
//! proposing until a checkpoint becomes stable.

pub mod implementation;

pub mod messages;

pub mod types;
