/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of the three-phase protocol for one instance.
//!
//! Main type: [`Replica`].

use std::{
    collections::{BTreeMap, BTreeSet, HashSet, VecDeque},
    sync::mpsc::Sender,
    time::SystemTime,
};

use crate::{
    app::App,
    checkpoints::{implementation::CheckpointTracker, messages::Checkpoint},
    events::{
        CommitEvent, DiscardTxnsEvent, Event, OrderEvent, PrepareEvent, ProposeEvent,
        ReceivePrePrepareEvent, RejectMessageEvent, SendCheckpointEvent, StableCheckpointEvent,
    },
    ledger::{pluggables::TxnStore, Ledger, LedgerError},
    networking::{network::Network, sending::SenderHandle},
    types::{
        collectors::VoteCollector,
        crypto_primitives::VerifyingKey,
        data_types::{CryptoHash, InstanceId, LedgerId, PpSeqNo, ViewNumber},
        pool::Quorums,
        requests::{Request, RequestStore, Transaction},
    },
};

use super::{
    messages::{Commit, Ordered, PrePrepare, Prepare, PrepareBallot, ThreePhaseMessage},
    types::{AppliedBatch, RejectReason, ThreePhaseKey},
};

/// Immutable parameters of a [`Replica`], shared by all instances of a node.
#[derive(Clone)]
pub struct ReplicaConfiguration {
    pub me: VerifyingKey,
    pub quorums: Quorums,
    /// Number of nodes in the pool. Bounds the Commits buffered per batch.
    pub pool_size: usize,
    pub max_batch_size: usize,
    pub chk_freq: u64,
    pub log_size: u64,
}

/// Collaborators that a [`Replica`] borrows from its node for the duration of one call.
pub(crate) struct ExecutionContext<'a, S: TxnStore, A: App> {
    pub(crate) ledgers: &'a mut BTreeMap<LedgerId, Ledger<S>>,
    pub(crate) app: &'a mut A,
    pub(crate) requests: &'a RequestStore,
}

/// The participant of one node in one instance of the three-phase protocol.
///
/// # Usage
///
/// `Replica` is meant to be used in an "event-oriented" fashion. Its node calls:
/// 1. [`on_receive_msg`](Self::on_receive_msg) when a [`ThreePhaseMessage`] for the replica's
///    instance and current view is received.
/// 2. [`on_receive_checkpoint`](Self::on_receive_checkpoint) when a [`Checkpoint`] is received.
/// 3. [`send_batches`](Self::send_batches) on every tick, so that a primary proposes whatever
///    requests are queued.
/// 4. [`freeze`](Self::freeze) and [`complete_view_change`](Self::complete_view_change) at the start
///    and end of a view change.
///
/// Batches the replica orders are queued up until the node collects them with
/// [`take_ordered`](Self::take_ordered).
///
/// # Master instance
///
/// Only the replica of the master instance applies batches to the ledgers and the [`App`]: when it
/// proposes a batch, and when it accepts a batch from the primary. Replicas of backup instances
/// agree on batches with zeroed roots, purely to measure throughput.
pub struct Replica<N: Network> {
    config: ReplicaConfiguration,
    inst_id: InstanceId,
    view_no: ViewNumber,
    primary: VerifyingKey,
    frozen: bool,
    // Highest sequence number proposed (as primary) or accepted (as backup) in this view.
    last_pp_seq_no: PpSeqNo,
    last_ordered: PpSeqNo,
    low_watermark: PpSeqNo,
    request_queue: VecDeque<CryptoHash>,
    // Queued requests that are part of a batch that was proposed or accepted, but not yet ordered.
    in_flight: HashSet<CryptoHash>,
    sent_pre_prepares: BTreeMap<ThreePhaseKey, PrePrepare>,
    pre_prepares: BTreeMap<ThreePhaseKey, PrePrepare>,
    pre_prepares_pending_requests: BTreeMap<ThreePhaseKey, (VerifyingKey, PrePrepare)>,
    pre_prepares_out_of_order: BTreeMap<ThreePhaseKey, (VerifyingKey, PrePrepare)>,
    prepares: BTreeMap<ThreePhaseKey, VoteCollector<PrepareBallot>>,
    prepared: BTreeSet<ThreePhaseKey>,
    commits: BTreeMap<ThreePhaseKey, VoteCollector<CryptoHash>>,
    commits_waiting_for_prepare: BTreeMap<ThreePhaseKey, Vec<(VerifyingKey, Commit)>>,
    batches: BTreeMap<ThreePhaseKey, AppliedBatch>,
    ordered: BTreeSet<ThreePhaseKey>,
    ordered_outbox: Vec<Ordered>,
    // Requests dropped from the queue as invalid, not yet collected by the node.
    dropped_outbox: Vec<CryptoHash>,
    checkpoints: CheckpointTracker,
    sender: SenderHandle<N>,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network> Replica<N> {
    pub(crate) fn new(
        config: ReplicaConfiguration,
        inst_id: InstanceId,
        primary: VerifyingKey,
        sender: SenderHandle<N>,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let checkpoints = CheckpointTracker::new(
            inst_id,
            config.me,
            config.chk_freq,
            config.quorums.strong,
        );
        Self {
            config,
            inst_id,
            view_no: ViewNumber::init(),
            primary,
            frozen: false,
            last_pp_seq_no: PpSeqNo::new(0),
            last_ordered: PpSeqNo::new(0),
            low_watermark: PpSeqNo::new(0),
            request_queue: VecDeque::new(),
            in_flight: HashSet::new(),
            sent_pre_prepares: BTreeMap::new(),
            pre_prepares: BTreeMap::new(),
            pre_prepares_pending_requests: BTreeMap::new(),
            pre_prepares_out_of_order: BTreeMap::new(),
            prepares: BTreeMap::new(),
            prepared: BTreeSet::new(),
            commits: BTreeMap::new(),
            commits_waiting_for_prepare: BTreeMap::new(),
            batches: BTreeMap::new(),
            ordered: BTreeSet::new(),
            ordered_outbox: Vec::new(),
            dropped_outbox: Vec::new(),
            checkpoints,
            sender,
            event_publisher,
        }
    }

    /// Queue the request with `digest` for batching. Requests stay queued until this instance
    /// orders them.
    pub(crate) fn enqueue_request(&mut self, digest: CryptoHash) {
        if !self.request_queue.contains(&digest) {
            self.request_queue.push_back(digest);
        }
    }

    /// Stop batching the request with `digest`, unless it is part of a batch in flight.
    pub(crate) fn forget_request(&mut self, digest: &CryptoHash) {
        if !self.in_flight.contains(digest) {
            self.request_queue.retain(|queued| queued != digest);
        }
    }

    /// If this replica is the primary and is not frozen, propose batches out of the queued requests
    /// until either the queue or the watermark window is exhausted.
    pub(crate) fn send_batches<S: TxnStore, A: App>(
        &mut self,
        ctx: &mut ExecutionContext<S, A>,
    ) -> Result<(), ReplicaError> {
        if !self.is_primary() || self.frozen {
            return Ok(());
        }

        while self.last_pp_seq_no + 1 <= self.high_watermark() {
            let Some((ledger_id, requests)) = self.next_batch(ctx) else {
                break;
            };
            if !self.propose(ledger_id, requests, ctx)? {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn on_receive_msg<S: TxnStore, A: App>(
        &mut self,
        msg: ThreePhaseMessage,
        origin: &VerifyingKey,
        ctx: &mut ExecutionContext<S, A>,
    ) -> Result<(), ReplicaError> {
        match msg {
            ThreePhaseMessage::PrePrepare(pre_prepare) => {
                self.on_receive_pre_prepare(pre_prepare, origin, ctx)
            }
            ThreePhaseMessage::Prepare(prepare) => self.on_receive_prepare(prepare, origin, ctx),
            ThreePhaseMessage::Commit(commit) => self.on_receive_commit(commit, origin, ctx),
        }
    }

    /// Record `origin`'s checkpoint vote, garbage collecting if a checkpoint became stable.
    pub(crate) fn on_receive_checkpoint(&mut self, checkpoint: Checkpoint, origin: &VerifyingKey) {
        if !self.within_watermarks(checkpoint.seq_no_end) {
            return self.reject(
                origin,
                checkpoint.view_no,
                checkpoint.seq_no_end,
                RejectReason::OutsideWatermarks,
            );
        }
        match self.checkpoints.on_receive_checkpoint(*origin, &checkpoint) {
            Ok(()) => self.try_stabilize(),
            Err(reason) => self.reject(origin, checkpoint.view_no, checkpoint.seq_no_end, reason),
        }
    }

    /// Accept the Pre-Prepares that were waiting for requests that have now arrived.
    pub(crate) fn retry_pending_pre_prepares<S: TxnStore, A: App>(
        &mut self,
        ctx: &mut ExecutionContext<S, A>,
    ) -> Result<(), ReplicaError> {
        let ready: Vec<ThreePhaseKey> = self
            .pre_prepares_pending_requests
            .iter()
            .filter(|(_, (_, pre_prepare))| {
                pre_prepare
                    .req_idr
                    .iter()
                    .all(|digest| ctx.requests.contains(digest))
            })
            .map(|(key, _)| *key)
            .collect();

        for key in ready {
            if let Some((origin, pre_prepare)) = self.pre_prepares_pending_requests.remove(&key) {
                if pre_prepare.pp_seq_no == self.last_pp_seq_no + 1 {
                    self.accept_pre_prepare(pre_prepare, &origin, ctx)?;
                }
            }
        }
        self.process_out_of_order(ctx)
    }

    /// Stop issuing and accepting Pre-Prepares until the view change completes. Batches already
    /// accepted keep going through Prepare and Commit.
    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Move to `view_no` after a view change.
    ///
    /// 1. Roll back the speculative application of every batch that was not ordered.
    /// 2. Drop every three-phase message and checkpoint vote.
    /// 3. Resume numbering after `agreed_last_ordered`, or after this replica's own last ordered
    ///    batch if it got further than the quorum.
    pub(crate) fn complete_view_change<S: TxnStore, A: App>(
        &mut self,
        view_no: ViewNumber,
        primary: VerifyingKey,
        agreed_last_ordered: PpSeqNo,
        ctx: &mut ExecutionContext<S, A>,
    ) -> Result<(), ReplicaError> {
        // 1. Unwind newest first, per ledger.
        let mut unordered: BTreeMap<LedgerId, (usize, usize)> = BTreeMap::new();
        for batch in self.batches.values() {
            let (txn_count, batch_count) = unordered.entry(batch.ledger_id).or_default();
            *txn_count += batch.txn_count;
            *batch_count += 1;
        }
        for (ledger_id, (txn_count, batch_count)) in unordered {
            self.unapply(ledger_id, txn_count, batch_count, ctx)?;
        }

        // 2. Clear.
        self.sent_pre_prepares.clear();
        self.pre_prepares.clear();
        self.pre_prepares_pending_requests.clear();
        self.pre_prepares_out_of_order.clear();
        self.prepares.clear();
        self.prepared.clear();
        self.commits.clear();
        self.commits_waiting_for_prepare.clear();
        self.batches.clear();
        self.ordered.clear();
        self.in_flight.clear();
        self.checkpoints.reset(view_no);

        // 3. Resume.
        let resume_from = self.last_ordered.max(agreed_last_ordered);
        self.view_no = view_no;
        self.primary = primary;
        self.frozen = false;
        self.last_pp_seq_no = resume_from;
        self.last_ordered = resume_from;
        self.low_watermark = self.low_watermark.max(resume_from);
        Ok(())
    }

    /// Collect the batches ordered since the last call, in order.
    pub(crate) fn take_ordered(&mut self) -> Vec<Ordered> {
        std::mem::take(&mut self.ordered_outbox)
    }

    /// Collect the requests dropped as invalid since the last call.
    pub(crate) fn take_dropped(&mut self) -> Vec<CryptoHash> {
        std::mem::take(&mut self.dropped_outbox)
    }

    pub fn inst_id(&self) -> InstanceId {
        self.inst_id
    }

    pub fn view_no(&self) -> ViewNumber {
        self.view_no
    }

    pub fn primary(&self) -> VerifyingKey {
        self.primary
    }

    pub fn is_primary(&self) -> bool {
        self.primary == self.config.me
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Sequence number of the last batch this replica ordered.
    pub fn last_ordered(&self) -> PpSeqNo {
        self.last_ordered
    }

    /// Sequence number of the last batch this replica proposed or accepted.
    pub fn last_pp_seq_no(&self) -> PpSeqNo {
        self.last_pp_seq_no
    }

    /// The `(h, H]` window of sequence numbers this replica currently accepts.
    pub fn watermarks(&self) -> (PpSeqNo, PpSeqNo) {
        (self.low_watermark, self.high_watermark())
    }

    pub fn checkpoints(&self) -> &CheckpointTracker {
        &self.checkpoints
    }

    pub fn stable_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.stable_checkpoint()
    }

    /// Requests queued and not yet ordered by this instance.
    pub fn request_queue(&self) -> &VecDeque<CryptoHash> {
        &self.request_queue
    }

    pub fn sent_pre_prepares(&self) -> &BTreeMap<ThreePhaseKey, PrePrepare> {
        &self.sent_pre_prepares
    }

    pub fn pre_prepares(&self) -> &BTreeMap<ThreePhaseKey, PrePrepare> {
        &self.pre_prepares
    }

    pub fn pre_prepares_pending_requests(&self) -> impl ExactSizeIterator<Item = &ThreePhaseKey> {
        self.pre_prepares_pending_requests.keys()
    }

    pub fn pre_prepares_out_of_order(&self) -> impl ExactSizeIterator<Item = &ThreePhaseKey> {
        self.pre_prepares_out_of_order.keys()
    }

    /// Batches for which Prepares have been received.
    pub fn prepares(&self) -> impl ExactSizeIterator<Item = &ThreePhaseKey> {
        self.prepares.keys()
    }

    /// Batches for which Commits have been counted.
    pub fn commits(&self) -> impl ExactSizeIterator<Item = &ThreePhaseKey> {
        self.commits.keys()
    }

    pub fn commits_waiting_for_prepare(&self) -> impl ExactSizeIterator<Item = &ThreePhaseKey> {
        self.commits_waiting_for_prepare.keys()
    }

    /// Batches this replica applied speculatively and has not ordered yet.
    pub fn batches(&self) -> &BTreeMap<ThreePhaseKey, AppliedBatch> {
        &self.batches
    }

    /// Ordered batches that have not been garbage collected yet.
    pub fn ordered(&self) -> &BTreeSet<ThreePhaseKey> {
        &self.ordered
    }

    /// Number of requests referred to by the Pre-Prepares this replica holds.
    pub fn request_count(&self) -> usize {
        self.sent_pre_prepares
            .values()
            .chain(self.pre_prepares.values())
            .map(|pre_prepare| pre_prepare.req_idr.len())
            .sum()
    }

    fn high_watermark(&self) -> PpSeqNo {
        self.low_watermark + self.config.log_size
    }

    fn within_watermarks(&self, pp_seq_no: PpSeqNo) -> bool {
        pp_seq_no > self.low_watermark && pp_seq_no <= self.high_watermark()
    }

    fn quorum(&self) -> usize {
        self.config.quorums.strong
    }

    /// Pick the next batch to propose: the oldest requests that are not in flight, up to
    /// `max_batch_size`, all writing to the same ledger as the oldest one. Invalid requests are
    /// dropped from the queue.
    fn next_batch<S: TxnStore, A: App>(
        &mut self,
        ctx: &mut ExecutionContext<S, A>,
    ) -> Option<(LedgerId, Vec<Request>)> {
        let mut ledger_id = None;
        let mut batch = Vec::new();
        let mut invalid = Vec::new();

        for digest in self.request_queue.iter() {
            if batch.len() >= self.config.max_batch_size {
                break;
            }
            if self.in_flight.contains(digest) {
                continue;
            }
            let Some(request) = ctx.requests.get(digest) else {
                continue;
            };
            if ledger_id.is_some_and(|id| id != request.ledger_id) {
                continue;
            }
            if !ctx.app.validate_request(request)
                || (self.inst_id.is_master() && !ctx.ledgers.contains_key(&request.ledger_id))
            {
                invalid.push(*digest);
                continue;
            }
            ledger_id = Some(request.ledger_id);
            batch.push(request.clone());
        }

        if !invalid.is_empty() {
            self.request_queue.retain(|digest| !invalid.contains(digest));
            self.dropped_outbox.extend(invalid);
        }
        ledger_id.map(|ledger_id| (ledger_id, batch))
    }

    /// Propose `requests` as the next batch. Returns whether a Pre-Prepare was sent.
    fn propose<S: TxnStore, A: App>(
        &mut self,
        ledger_id: LedgerId,
        requests: Vec<Request>,
        ctx: &mut ExecutionContext<S, A>,
    ) -> Result<bool, ReplicaError> {
        let pp_seq_no = self.last_pp_seq_no + 1;
        let key = (self.view_no, pp_seq_no);
        let pp_time = secs_since_unix_epoch();
        let req_idr: Vec<CryptoHash> = requests.iter().map(Request::digest).collect();

        let (state_root_hash, txn_root_hash) = if self.inst_id.is_master() {
            let Some(roots) = apply(ledger_id, &requests, ctx) else {
                return Ok(false);
            };
            self.batches.insert(
                key,
                AppliedBatch {
                    ledger_id,
                    txn_count: requests.len(),
                },
            );
            roots
        } else {
            (CryptoHash::zero(), CryptoHash::zero())
        };

        let pre_prepare = PrePrepare {
            inst_id: self.inst_id,
            view_no: self.view_no,
            pp_seq_no,
            pp_time,
            digest: PrePrepare::batch_digest(pp_time, &req_idr),
            req_idr,
            ledger_id,
            state_root_hash,
            txn_root_hash,
        };

        self.last_pp_seq_no = pp_seq_no;
        self.in_flight.extend(pre_prepare.req_idr.iter().copied());
        self.prepares
            .entry(key)
            .or_default()
            .collect(self.config.me, pre_prepare.prepare_ballot());
        self.sent_pre_prepares.insert(key, pre_prepare.clone());
        self.sender.broadcast(pre_prepare.clone());

        Event::Propose(ProposeEvent {
            timestamp: SystemTime::now(),
            pre_prepare,
        })
        .publish(&self.event_publisher);

        self.try_prepare(key)?;
        Ok(true)
    }

    fn on_receive_pre_prepare<S: TxnStore, A: App>(
        &mut self,
        pre_prepare: PrePrepare,
        origin: &VerifyingKey,
        ctx: &mut ExecutionContext<S, A>,
    ) -> Result<(), ReplicaError> {
        let key = (pre_prepare.view_no, pre_prepare.pp_seq_no);

        // 1. Check that the Pre-Prepare is from the right primary, at the right time.
        let rejection = if pre_prepare.view_no != self.view_no {
            Some(RejectReason::WrongView)
        } else if *origin != self.primary || self.is_primary() {
            Some(RejectReason::NotFromPrimary)
        } else if self.frozen {
            Some(RejectReason::ViewChangeInProgress)
        } else if !self.within_watermarks(pre_prepare.pp_seq_no) {
            Some(RejectReason::OutsideWatermarks)
        } else if pre_prepare.pp_seq_no <= self.last_pp_seq_no
            || self.pre_prepares_pending_requests.contains_key(&key)
            || self.pre_prepares_out_of_order.contains_key(&key)
        {
            Some(RejectReason::Duplicate)
        } else if PrePrepare::batch_digest(pre_prepare.pp_time, &pre_prepare.req_idr)
            != pre_prepare.digest
        {
            Some(RejectReason::WrongDigest)
        } else {
            None
        };
        if let Some(reason) = rejection {
            self.reject(origin, pre_prepare.view_no, pre_prepare.pp_seq_no, reason);
            return Ok(());
        }

        // 2. Hold on to Pre-Prepares that skip ahead until their predecessors are accepted.
        if pre_prepare.pp_seq_no > self.last_pp_seq_no + 1 {
            self.pre_prepares_out_of_order
                .insert(key, (*origin, pre_prepare));
            return Ok(());
        }

        // 3. Accept, or wait for the requests it refers to.
        self.process_pre_prepare(pre_prepare, origin, ctx)?;

        // 4. Its successors may now be acceptable.
        self.process_out_of_order(ctx)
    }

    /// Process the Pre-Prepare that carries the next expected sequence number.
    fn process_pre_prepare<S: TxnStore, A: App>(
        &mut self,
        pre_prepare: PrePrepare,
        origin: &VerifyingKey,
        ctx: &mut ExecutionContext<S, A>,
    ) -> Result<(), ReplicaError> {
        let all_known = pre_prepare
            .req_idr
            .iter()
            .all(|digest| ctx.requests.contains(digest));
        if !all_known {
            let key = (pre_prepare.view_no, pre_prepare.pp_seq_no);
            self.pre_prepares_pending_requests
                .insert(key, (*origin, pre_prepare));
            return Ok(());
        }
        self.accept_pre_prepare(pre_prepare, origin, ctx)
    }

    fn process_out_of_order<S: TxnStore, A: App>(
        &mut self,
        ctx: &mut ExecutionContext<S, A>,
    ) -> Result<(), ReplicaError> {
        loop {
            let next = (self.view_no, self.last_pp_seq_no + 1);
            let Some((origin, pre_prepare)) = self.pre_prepares_out_of_order.remove(&next) else {
                return Ok(());
            };
            self.process_pre_prepare(pre_prepare, &origin, ctx)?;
            if self.last_pp_seq_no < next.1 {
                return Ok(());
            }
        }
    }

    /// Validate and apply a Pre-Prepare whose requests are all known, then vote for it.
    fn accept_pre_prepare<S: TxnStore, A: App>(
        &mut self,
        pre_prepare: PrePrepare,
        origin: &VerifyingKey,
        ctx: &mut ExecutionContext<S, A>,
    ) -> Result<(), ReplicaError> {
        let key = (pre_prepare.view_no, pre_prepare.pp_seq_no);
        let requests: Vec<Request> = pre_prepare
            .req_idr
            .iter()
            .filter_map(|digest| ctx.requests.get(digest).cloned())
            .collect();

        // 1. Validate the requests.
        let valid = requests.len() == pre_prepare.req_idr.len()
            && requests.iter().all(|request| {
                request.ledger_id == pre_prepare.ledger_id && ctx.app.validate_request(request)
            });
        if !valid {
            self.reject(origin, key.0, key.1, RejectReason::InvalidRequest);
            return Ok(());
        }

        // 2. Apply the batch and check that this node arrives at the same roots as the primary.
        if self.inst_id.is_master() {
            match apply(pre_prepare.ledger_id, &requests, ctx) {
                None => {
                    self.reject(origin, key.0, key.1, RejectReason::UnknownLedger);
                    return Ok(());
                }
                Some(roots) if roots != (pre_prepare.state_root_hash, pre_prepare.txn_root_hash) => {
                    self.unapply(pre_prepare.ledger_id, requests.len(), 1, ctx)?;
                    self.reject(origin, key.0, key.1, RejectReason::RootMismatch);
                    return Ok(());
                }
                Some(_) => {
                    self.batches.insert(
                        key,
                        AppliedBatch {
                            ledger_id: pre_prepare.ledger_id,
                            txn_count: requests.len(),
                        },
                    );
                }
            }
        }

        // 3. Count the Pre-Prepare as the primary's Prepare, and add our own.
        let prepare = Prepare {
            inst_id: self.inst_id,
            view_no: pre_prepare.view_no,
            pp_seq_no: pre_prepare.pp_seq_no,
            digest: pre_prepare.digest,
            state_root_hash: pre_prepare.state_root_hash,
            txn_root_hash: pre_prepare.txn_root_hash,
        };
        let prepares = self.prepares.entry(key).or_default();
        prepares.collect(*origin, pre_prepare.prepare_ballot());
        prepares.collect(self.config.me, prepare.ballot());

        self.last_pp_seq_no = pre_prepare.pp_seq_no;
        self.in_flight.extend(pre_prepare.req_idr.iter().copied());
        self.pre_prepares.insert(key, pre_prepare.clone());
        Event::ReceivePrePrepare(ReceivePrePrepareEvent {
            timestamp: SystemTime::now(),
            origin: *origin,
            pre_prepare,
        })
        .publish(&self.event_publisher);

        // 4. Broadcast the Prepare.
        self.sender.broadcast(prepare.clone());
        Event::Prepare(PrepareEvent {
            timestamp: SystemTime::now(),
            prepare,
        })
        .publish(&self.event_publisher);

        self.try_prepare(key)
    }

    fn on_receive_prepare<S: TxnStore, A: App>(
        &mut self,
        prepare: Prepare,
        origin: &VerifyingKey,
        _ctx: &mut ExecutionContext<S, A>,
    ) -> Result<(), ReplicaError> {
        let key = (prepare.view_no, prepare.pp_seq_no);
        let rejection = if prepare.view_no != self.view_no {
            Some(RejectReason::WrongView)
        } else if *origin == self.primary {
            Some(RejectReason::PrepareFromPrimary)
        } else if !self.within_watermarks(prepare.pp_seq_no) {
            Some(RejectReason::OutsideWatermarks)
        } else if !self
            .prepares
            .entry(key)
            .or_default()
            .collect(*origin, prepare.ballot())
        {
            Some(RejectReason::Duplicate)
        } else {
            None
        };
        if let Some(reason) = rejection {
            self.reject(origin, key.0, key.1, reason);
            return Ok(());
        }

        self.try_prepare(key)
    }

    fn on_receive_commit<S: TxnStore, A: App>(
        &mut self,
        commit: Commit,
        origin: &VerifyingKey,
        _ctx: &mut ExecutionContext<S, A>,
    ) -> Result<(), ReplicaError> {
        let key = (commit.view_no, commit.pp_seq_no);
        if commit.view_no != self.view_no {
            self.reject(origin, key.0, key.1, RejectReason::WrongView);
            return Ok(());
        }
        if !self.within_watermarks(commit.pp_seq_no) {
            self.reject(origin, key.0, key.1, RejectReason::OutsideWatermarks);
            return Ok(());
        }

        if self.prepared.contains(&key) {
            if !self
                .commits
                .entry(key)
                .or_default()
                .collect(*origin, commit.digest)
            {
                self.reject(origin, key.0, key.1, RejectReason::Duplicate);
                return Ok(());
            }
            return self.try_order();
        }

        // Not prepared yet: buffer until this replica prepares the batch.
        let capacity = self.config.pool_size;
        let waiting = self.commits_waiting_for_prepare.entry(key).or_default();
        let reason = if waiting.iter().any(|(sender, _)| sender == origin) {
            Some(RejectReason::Duplicate)
        } else if waiting.len() >= capacity {
            Some(RejectReason::BufferFull)
        } else {
            waiting.push((*origin, commit));
            None
        };
        if let Some(reason) = reason {
            self.reject(origin, key.0, key.1, reason);
        }
        Ok(())
    }

    /// If the batch at `key` has a Pre-Prepare and a quorum of matching Prepares, commit to it.
    fn try_prepare(&mut self, key: ThreePhaseKey) -> Result<(), ReplicaError> {
        if self.prepared.contains(&key) {
            return Ok(());
        }
        let Some(pre_prepare) = self
            .pre_prepares
            .get(&key)
            .or_else(|| self.sent_pre_prepares.get(&key))
        else {
            return Ok(());
        };
        let ballot = pre_prepare.prepare_ballot();
        let votes = self.prepares.get(&key).map_or(0, |prepares| prepares.count(&ballot));
        if votes < self.quorum() {
            return Ok(());
        }

        let commit = Commit {
            inst_id: self.inst_id,
            view_no: key.0,
            pp_seq_no: key.1,
            digest: pre_prepare.digest,
        };
        self.prepared.insert(key);

        let commits = self.commits.entry(key).or_default();
        commits.collect(self.config.me, commit.digest);
        for (origin, waiting) in self
            .commits_waiting_for_prepare
            .remove(&key)
            .unwrap_or_default()
        {
            commits.collect(origin, waiting.digest);
        }

        self.sender.broadcast(commit.clone());
        Event::Commit(CommitEvent {
            timestamp: SystemTime::now(),
            commit,
        })
        .publish(&self.event_publisher);

        self.try_order()
    }

    /// Order every batch, in sequence, that is prepared and has a quorum of matching Commits.
    fn try_order(&mut self) -> Result<(), ReplicaError> {
        loop {
            let key = (self.view_no, self.last_ordered + 1);
            if !self.prepared.contains(&key) {
                return Ok(());
            }
            let Some(pre_prepare) = self
                .pre_prepares
                .get(&key)
                .or_else(|| self.sent_pre_prepares.get(&key))
                .cloned()
            else {
                return Ok(());
            };
            let votes = self
                .commits
                .get(&key)
                .map_or(0, |commits| commits.count(&pre_prepare.digest));
            if votes < self.quorum() {
                return Ok(());
            }

            self.order(key, &pre_prepare);
        }
    }

    fn order(&mut self, key: ThreePhaseKey, pre_prepare: &PrePrepare) {
        self.ordered.insert(key);
        self.last_ordered = pre_prepare.pp_seq_no;
        self.batches.remove(&key);
        let batched: HashSet<&CryptoHash> = pre_prepare.req_idr.iter().collect();
        self.request_queue.retain(|digest| !batched.contains(digest));
        for digest in &pre_prepare.req_idr {
            self.in_flight.remove(digest);
        }

        let ordered = Ordered::from(pre_prepare);
        self.ordered_outbox.push(ordered.clone());
        Event::Order(OrderEvent {
            timestamp: SystemTime::now(),
            ordered,
        })
        .publish(&self.event_publisher);

        if let Some(checkpoint) = self
            .checkpoints
            .on_batch_ordered(pre_prepare.pp_seq_no, pre_prepare.digest)
        {
            self.sender.broadcast(checkpoint.clone());
            Event::SendCheckpoint(SendCheckpointEvent {
                timestamp: SystemTime::now(),
                checkpoint,
            })
            .publish(&self.event_publisher);
            self.try_stabilize();
        }
    }

    fn try_stabilize(&mut self) {
        if let Some(checkpoint) = self.checkpoints.try_stabilize() {
            self.garbage_collect(checkpoint.seq_no_end);
            Event::StableCheckpoint(StableCheckpointEvent {
                timestamp: SystemTime::now(),
                checkpoint,
            })
            .publish(&self.event_publisher);
        }
    }

    /// Forget everything about batches up to and including `seq_no_end`, and move the low
    /// watermark up to it.
    fn garbage_collect(&mut self, seq_no_end: PpSeqNo) {
        let keep = |key: &ThreePhaseKey| key.1 > seq_no_end;
        self.sent_pre_prepares.retain(|key, _| keep(key));
        self.pre_prepares.retain(|key, _| keep(key));
        self.pre_prepares_pending_requests.retain(|key, _| keep(key));
        self.pre_prepares_out_of_order.retain(|key, _| keep(key));
        self.prepares.retain(|key, _| keep(key));
        self.prepared.retain(|key| keep(key));
        self.commits.retain(|key, _| keep(key));
        self.commits_waiting_for_prepare.retain(|key, _| keep(key));
        self.batches.retain(|key, _| keep(key));
        self.ordered.retain(|key| keep(key));
        self.low_watermark = self.low_watermark.max(seq_no_end);
    }

    /// Roll back the `batch_count` newest batches applied to `ledger_id`, totalling `txn_count`
    /// transactions.
    fn unapply<S: TxnStore, A: App>(
        &mut self,
        ledger_id: LedgerId,
        txn_count: usize,
        batch_count: usize,
        ctx: &mut ExecutionContext<S, A>,
    ) -> Result<(), ReplicaError> {
        let Some(ledger) = ctx.ledgers.get_mut(&ledger_id) else {
            return Ok(());
        };
        ledger.discard_txns(txn_count)?;
        ctx.app.discard_batches(ledger_id, batch_count);
        Event::DiscardTxns(DiscardTxnsEvent {
            timestamp: SystemTime::now(),
            ledger_id,
            count: txn_count,
        })
        .publish(&self.event_publisher);
        Ok(())
    }

    fn reject(
        &self,
        origin: &VerifyingKey,
        view_no: ViewNumber,
        pp_seq_no: PpSeqNo,
        reason: RejectReason,
    ) {
        Event::RejectMessage(RejectMessageEvent {
            timestamp: SystemTime::now(),
            origin: *origin,
            inst_id: self.inst_id,
            view_no,
            pp_seq_no,
            reason,
        })
        .publish(&self.event_publisher);
    }
}

/// Speculatively apply `requests` to `ledger_id` and the app. Returns the resulting
/// `(state_root_hash, txn_root_hash)`, or `None` if there is no such ledger.
fn apply<S: TxnStore, A: App>(
    ledger_id: LedgerId,
    requests: &[Request],
    ctx: &mut ExecutionContext<S, A>,
) -> Option<(CryptoHash, CryptoHash)> {
    let ledger = ctx.ledgers.get_mut(&ledger_id)?;
    let (_, txns) = ledger.append_txns(requests.iter().map(Transaction::from).collect());
    let txn_root_hash = ledger
        .uncommitted_root_hash()
        .unwrap_or_else(|| ledger.root_hash());
    let state_root_hash = ctx.app.apply_batch(ledger_id, &txns);
    Some((state_root_hash, txn_root_hash))
}

fn secs_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[derive(Debug)]
pub enum ReplicaError {
    Ledger(LedgerError),
}

impl From<LedgerError> for ReplicaError {
    fn from(value: LedgerError) -> Self {
        ReplicaError::Ledger(value)
    }
}
