/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Checkpoints: agreement on windows of ordered batches, used to garbage collect three-phase
//! bookkeeping and to advance the watermarks.
//!
//! Every `chk_freq` ordered batches, each replica broadcasts a [`Checkpoint`](messages::Checkpoint)
//! over the digests of the batches in the window. Once a strong quorum agrees on a window, the window
//! is *stable*: the [replica](crate::three_phase::implementation::Replica) drops everything it keeps
//! about batches up to the window's end, and its low watermark moves up to that end.

pub mod implementation;

pub mod messages;
