/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build, run, and tear down a node.
//!
//! A node is one member of the pool. It owns one [`Replica`] per protocol instance, the ledgers,
//! the application, the [monitor](crate::monitor) and the [view change coordinator](crate::view_change),
//! and is the only place where ledgers are ever committed to.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the node](NodeSpec) with:
//!   1. `NodeSpec::builder` to construct a `NodeSpecBuilder`,
//!   2. The setters of the `NodeSpecBuilder`, and
//!   3. The `NodeSpecBuilder::build` method to construct a [NodeSpec],
//! - The function to [init](NodeSpec::init) a [Node] given its [NodeSpec],
//! - [The type](Node) which is polled to make progress.
//!
//! ## Starting a node
//!
//! Here is an example that demonstrates how to build and start a node using the builder pattern:
//!
//! ```ignore
//! let mut node =
//!     NodeSpec::builder()
//!     .app(app)
//!     .network(network)
//!     .ledgers(vec![pool_ledger, domain_ledger])
//!     .configuration(configuration)
//!     .on_order(order_handler)
//!     .build()
//!     .init()?;
//!
//! loop {
//!     node.poll()?;
//! }
//! ```
//!
//! ### Required setters
//!
//! The required setters are for providing the trait implementations required to run a node:
//! - `.app(...)`
//! - `.network(...)`
//! - `.ledgers(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! `.degradation_detector(...)` replaces the [`MonitorDetector`]. The other optional setters are
//! for registering user-defined event handlers for events from [crate::events]:
//! - `.on_commit_txns(...)`
//! - `.on_discard_txns(...)`
//! - `.on_propose(...)`
//! - `.on_receive_pre_prepare(...)`
//! - `.on_prepare(...)`
//! - `.on_commit(...)`
//! - `.on_order(...)`
//! - `.on_reject_message(...)`
//! - `.on_send_checkpoint(...)`
//! - `.on_stable_checkpoint(...)`
//! - `.on_master_degraded(...)`
//! - `.on_start_view_change(...)`
//! - `.on_view_change_timeout(...)`
//! - `.on_complete_view_change(...)`
//! - `.on_catchup_needed(...)`
//!
//! ## Polling
//!
//! Nodes do not spawn threads. Every call to [`Node::poll`] drains the network, consults the
//! degradation detector and the view change timers, lets primaries propose, commits whatever the
//! master instance ordered, and finally hands the events published during the call to the
//! registered handlers.

use std::{
    collections::BTreeMap,
    sync::mpsc::{self, Receiver, Sender},
    time::{Duration, Instant, SystemTime},
};

use typed_builder::TypedBuilder;

use crate::{
    app::App,
    checkpoints::messages::Checkpoint,
    config::Configuration,
    event_bus::{drain_events, EventHandlers, HandlerPtr},
    events::*,
    ledger::{pluggables::TxnStore, Ledger, LedgerError},
    monitor::{
        detector::{DegradationDetector, MonitorDetector},
        implementation::ThroughputMonitor,
    },
    networking::{
        messages::Message, network::Network, receiving::FutureViewBuffer, sending::SenderHandle,
    },
    three_phase::{
        implementation::{ExecutionContext, Replica, ReplicaError},
        messages::{Ordered, ThreePhaseMessage},
        types::RejectReason,
    },
    types::{
        crypto_primitives::VerifyingKey,
        data_types::{CryptoHash, InstanceId, LedgerId, PpSeqNo, ViewNumber},
        pool::Pool,
        requests::{Request, RequestStore},
    },
    view_change::{
        implementation::{ViewChangeCoordinator, ViewChangeError},
        messages::{OrderedState, ViewChangeDone},
    },
};

/// Parameters of the [`Node`] itself, split off the [`Configuration`].
#[derive(Clone)]
pub struct NodeConfiguration {
    pub me: VerifyingKey,
    pub pool: Pool,
    pub perf_check_freq: Duration,
    pub future_view_buffer_capacity: usize,
    /// How many master batches before the last stable checkpoint the digests of ordered requests
    /// are kept for.
    pub request_dedup_window: u64,
    pub log_events: bool,
}

/// Stores all necessary parameters and trait implementations required to run a [Node].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [NodeSpec]. On the builder call the following methods to construct a valid [NodeSpec].

    Required:
    - `.app(...)`
    - `.network(...)`
    - `.ledgers(...)`
    - `.configuration(...)`

    Optional:
    - `.degradation_detector(...)`
    - `.on_commit_txns(...)`
    - `.on_discard_txns(...)`
    - `.on_propose(...)`
    - `.on_receive_pre_prepare(...)`
    - `.on_prepare(...)`
    - `.on_commit(...)`
    - `.on_order(...)`
    - `.on_reject_message(...)`
    - `.on_send_checkpoint(...)`
    - `.on_stable_checkpoint(...)`
    - `.on_master_degraded(...)`
    - `.on_start_view_change(...)`
    - `.on_view_change_timeout(...)`
    - `.on_complete_view_change(...)`
    - `.on_catchup_needed(...)`
"))]
pub struct NodeSpec<S: TxnStore, A: App + 'static, N: Network + 'static> {
    // Required parameters
    #[builder(setter(doc = "Set the application whose transactions the ledgers record. The argument must implement the [App](crate::app::App) trait. Required."))]
    app: A,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::network::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the ledgers the node maintains, each with a distinct ledger id. Required."))]
    ledgers: Vec<Ledger<S>>,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a node. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default = Box::new(MonitorDetector), setter(transform = |detector: impl DegradationDetector + 'static| Box::new(detector) as Box<dyn DegradationDetector>,
    doc = "Set the strategy that decides whether the master instance is degraded. Defaults to [MonitorDetector]. Optional."))]
    degradation_detector: Box<dyn DegradationDetector>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitTxnsEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitTxnsEvent>),
    doc = "Register a handler closure to be invoked after the transactions of an ordered batch are committed to a ledger. Optional."))]
    on_commit_txns: Option<HandlerPtr<CommitTxnsEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DiscardTxnsEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DiscardTxnsEvent>),
    doc = "Register a handler closure to be invoked after speculative transactions are discarded from a ledger. Optional."))]
    on_discard_txns: Option<HandlerPtr<DiscardTxnsEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeEvent>),
    doc = "Register a handler closure to be invoked after the node, as a primary, broadcasts a Pre-Prepare. Optional."))]
    on_propose: Option<HandlerPtr<ProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceivePrePrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceivePrePrepareEvent>),
    doc = "Register a handler closure to be invoked after the node accepts a Pre-Prepare. Optional."))]
    on_receive_pre_prepare: Option<HandlerPtr<ReceivePrePrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PrepareEvent>),
    doc = "Register a handler closure to be invoked after the node broadcasts a Prepare. Optional."))]
    on_prepare: Option<HandlerPtr<PrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitEvent>),
    doc = "Register a handler closure to be invoked after the node broadcasts a Commit. Optional."))]
    on_commit: Option<HandlerPtr<CommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&OrderEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<OrderEvent>),
    doc = "Register a handler closure to be invoked after an instance orders a batch. Optional."))]
    on_order: Option<HandlerPtr<OrderEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RejectMessageEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RejectMessageEvent>),
    doc = "Register a handler closure to be invoked after the node rejects a message. Optional."))]
    on_reject_message: Option<HandlerPtr<RejectMessageEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SendCheckpointEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SendCheckpointEvent>),
    doc = "Register a handler closure to be invoked after the node broadcasts a checkpoint. Optional."))]
    on_send_checkpoint: Option<HandlerPtr<SendCheckpointEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StableCheckpointEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StableCheckpointEvent>),
    doc = "Register a handler closure to be invoked after a checkpoint becomes stable. Optional."))]
    on_stable_checkpoint: Option<HandlerPtr<StableCheckpointEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&MasterDegradedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<MasterDegradedEvent>),
    doc = "Register a handler closure to be invoked after the master instance is found degraded. Optional."))]
    on_master_degraded: Option<HandlerPtr<MasterDegradedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartViewChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartViewChangeEvent>),
    doc = "Register a handler closure to be invoked after the node starts changing views. Optional."))]
    on_start_view_change: Option<HandlerPtr<StartViewChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ViewChangeTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ViewChangeTimeoutEvent>),
    doc = "Register a handler closure to be invoked after a view change times out. Optional."))]
    on_view_change_timeout: Option<HandlerPtr<ViewChangeTimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CompleteViewChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CompleteViewChangeEvent>),
    doc = "Register a handler closure to be invoked after the node completes a view change. Optional."))]
    on_complete_view_change: Option<HandlerPtr<CompleteViewChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CatchupNeededEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CatchupNeededEvent>),
    doc = "Register a handler closure to be invoked after a view change leaves the node behind the pool. Optional."))]
    on_catchup_needed: Option<HandlerPtr<CatchupNeededEvent>>,
}

impl<S: TxnStore, A: App + 'static, N: Network + 'static> NodeSpec<S, A, N> {
    /// Check this `NodeSpec` and build the [Node] it describes.
    pub fn init(self) -> Result<Node<S, A, N>, NodeError> {
        let (replica_config, monitor_config, view_change_config, node_config) =
            self.configuration.into();

        if node_config.pool.is_empty() {
            return Err(NodeError::EmptyPool);
        }
        if !node_config.pool.contains(&node_config.me) {
            return Err(NodeError::NotInPool);
        }
        if !replica_config.quorums.fit(&node_config.pool) {
            return Err(NodeError::InvalidQuorum {
                strong: replica_config.quorums.strong,
                pool_size: node_config.pool.len(),
            });
        }

        let mut ledgers = BTreeMap::new();
        for ledger in self.ledgers {
            let ledger_id = ledger.ledger_id();
            if ledgers.insert(ledger_id, ledger).is_some() {
                return Err(NodeError::DuplicateLedger(ledger_id));
            }
        }

        let event_handlers = EventHandlers::new(
            node_config.log_events,
            self.on_commit_txns,
            self.on_discard_txns,
            self.on_propose,
            self.on_receive_pre_prepare,
            self.on_prepare,
            self.on_commit,
            self.on_order,
            self.on_reject_message,
            self.on_send_checkpoint,
            self.on_stable_checkpoint,
            self.on_master_degraded,
            self.on_start_view_change,
            self.on_view_change_timeout,
            self.on_complete_view_change,
            self.on_catchup_needed,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let instance_count = node_config.pool.instance_count();
        let replicas = (0..instance_count as u32)
            .map(InstanceId::new)
            .map(|inst_id| {
                Replica::new(
                    replica_config.clone(),
                    inst_id,
                    node_config.pool.primary(ViewNumber::init(), inst_id),
                    SenderHandle::new(self.network.clone()),
                    event_publisher.clone(),
                )
            })
            .collect();

        let now = Instant::now();
        Ok(Node {
            requests: RequestStore::new(instance_count),
            replicas,
            monitor: ThroughputMonitor::new(monitor_config, now),
            degradation_detector: self.degradation_detector,
            coordinator: ViewChangeCoordinator::new(
                view_change_config,
                SenderHandle::new(self.network.clone()),
                event_publisher.clone(),
            ),
            future_view_msgs: FutureViewBuffer::new(node_config.future_view_buffer_capacity),
            ordered: Vec::new(),
            pruned_up_to: PpSeqNo::new(0),
            next_perf_check: now + node_config.perf_check_freq,
            halted: false,
            network: self.network,
            ledgers,
            app: self.app,
            config: node_config,
            event_handlers,
            event_publisher,
            event_subscriber,
        })
    }
}

/// A running member of the pool.
///
/// A node only makes progress when [polled](Self::poll). Requests reach it through
/// [`submit_request`](Self::submit_request): propagating requests to every node of the pool is the
/// job of an outer layer.
pub struct Node<S: TxnStore, A: App, N: Network> {
    config: NodeConfiguration,
    network: N,
    ledgers: BTreeMap<LedgerId, Ledger<S>>,
    app: A,
    requests: RequestStore,
    replicas: Vec<Replica<N>>,
    monitor: ThroughputMonitor,
    degradation_detector: Box<dyn DegradationDetector>,
    coordinator: ViewChangeCoordinator<N>,
    future_view_msgs: FutureViewBuffer,
    // Batches the master instance ordered and the node committed, not yet collected.
    ordered: Vec<Ordered>,
    // End of the master instance's stable checkpoint the request store was last pruned at.
    pruned_up_to: PpSeqNo,
    next_perf_check: Instant,
    halted: bool,
    event_handlers: EventHandlers,
    event_publisher: Option<Sender<Event>>,
    event_subscriber: Option<Receiver<Event>>,
}

impl<S: TxnStore, A: App, N: Network> Node<S, A, N> {
    /// Hand a request to every instance of this node.
    ///
    /// Returns `Ok(false)` if the node already knows the request, or ordered it recently enough to
    /// remember.
    ///
    /// # Errors
    ///
    /// [`NodeError::InvalidRequest`] if the [`App`] finds the request invalid. Such requests never
    /// reach the replicas.
    pub fn submit_request(&mut self, request: Request) -> Result<bool, NodeError> {
        if self.halted {
            return Err(NodeError::Halted);
        }
        if !self.ledgers.contains_key(&request.ledger_id) {
            return Err(NodeError::UnknownLedger(request.ledger_id));
        }
        if !self.app.validate_request(&request) {
            return Err(NodeError::InvalidRequest(request.digest()));
        }
        let Some(digest) = self.requests.insert(request) else {
            return Ok(false);
        };

        self.monitor.request_received(digest, Instant::now());
        for replica in self.replicas.iter_mut() {
            replica.enqueue_request(digest);
        }
        Ok(true)
    }

    /// Make as much progress as possible without blocking.
    ///
    /// # Errors
    ///
    /// A [`LedgerError`] means the ledgers can no longer be trusted. The node halts, and every
    /// further call returns [`NodeError::Halted`].
    pub fn poll(&mut self) -> Result<(), NodeError> {
        if self.halted {
            return Err(NodeError::Halted);
        }
        let result = self.poll_at(Instant::now());
        if let Err(err) = &result {
            log::error!("Halting node {:?}: {:?}", self.config.me, err);
            self.halted = true;
        }
        self.drain_events();
        result
    }

    /// Start a view change to the next view, unless one is already in progress.
    ///
    /// Returns whether a view change was started.
    pub fn start_view_change(&mut self) -> Result<bool, NodeError> {
        if self.halted {
            return Err(NodeError::Halted);
        }
        self.begin_view_change(None, Instant::now())
    }

    /// Start, or escalate the ongoing, view change to `target`.
    ///
    /// Returns whether the target changed.
    pub fn propose_view_change(&mut self, target: ViewNumber) -> Result<bool, NodeError> {
        if self.halted {
            return Err(NodeError::Halted);
        }
        self.begin_view_change(Some(target), Instant::now())
    }

    /// Collect the batches the master instance ordered since the last call. By the time a batch is
    /// returned here, its transactions are committed to its ledger.
    pub fn ordered(&mut self) -> Vec<Ordered> {
        std::mem::take(&mut self.ordered)
    }

    /// Stop the node, returning its ledgers, in ledger id order, and its app.
    pub fn teardown(mut self) -> (Vec<Ledger<S>>, A) {
        self.drain_events();
        (self.ledgers.into_values().collect(), self.app)
    }

    pub fn me(&self) -> VerifyingKey {
        self.config.me
    }

    pub fn pool(&self) -> &Pool {
        &self.config.pool
    }

    /// The current view. Does not change until a view change completes.
    pub fn view_no(&self) -> ViewNumber {
        self.coordinator.view_no()
    }

    pub fn is_view_changing(&self) -> bool {
        self.coordinator.is_view_changing()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// The primary of `inst_id` in the current view.
    pub fn primary(&self, inst_id: InstanceId) -> Option<VerifyingKey> {
        self.replica(inst_id).map(Replica::primary)
    }

    pub fn replica(&self, inst_id: InstanceId) -> Option<&Replica<N>> {
        self.replicas.get(inst_id.int() as usize)
    }

    pub fn replicas(&self) -> &[Replica<N>] {
        &self.replicas
    }

    /// The latest stable checkpoint of `inst_id`.
    pub fn stable_checkpoint(&self, inst_id: InstanceId) -> Option<&Checkpoint> {
        self.replica(inst_id)?.stable_checkpoint()
    }

    pub fn ledger(&self, ledger_id: LedgerId) -> Option<&Ledger<S>> {
        self.ledgers.get(&ledger_id)
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn requests(&self) -> &RequestStore {
        &self.requests
    }

    pub fn monitor(&self) -> &ThroughputMonitor {
        &self.monitor
    }

    pub fn coordinator(&self) -> &ViewChangeCoordinator<N> {
        &self.coordinator
    }

    /// What this node has ordered and committed so far, as reported in view changes.
    pub fn ordered_state(&self) -> OrderedState {
        OrderedState {
            last_ordered: self
                .replicas
                .iter()
                .map(|replica| (replica.inst_id(), replica.last_ordered()))
                .collect(),
            ledgers: self.ledgers.values().map(Ledger::summary).collect(),
        }
    }

    fn poll_at(&mut self, now: Instant) -> Result<(), NodeError> {
        // 1. Handle every message available.
        while let Some((origin, msg)) = self.network.recv() {
            self.on_receive_msg(msg, &origin, now)?;
            self.process_ordered(now)?;
        }

        // 2. Accept Pre-Prepares whose requests arrived since.
        for replica in self.replicas.iter_mut() {
            let ctx = &mut ExecutionContext {
                ledgers: &mut self.ledgers,
                app: &mut self.app,
                requests: &self.requests,
            };
            replica.retry_pending_pre_prepares(ctx)?;
        }
        self.process_ordered(now)?;

        // 3. Check on the master instance.
        if now >= self.next_perf_check {
            self.next_perf_check = now + self.config.perf_check_freq;
            if !self.coordinator.is_view_changing()
                && self
                    .degradation_detector
                    .is_master_degraded(&mut self.monitor, now)
            {
                Event::MasterDegraded(MasterDegradedEvent {
                    timestamp: SystemTime::now(),
                    view_no: self.coordinator.view_no(),
                })
                .publish(&self.event_publisher);
                self.begin_view_change(None, now)?;
            }
        }

        // 4. Retry or escalate a view change that is taking too long.
        self.coordinator.tick(now);

        // 5. Propose.
        for replica in self.replicas.iter_mut() {
            let ctx = &mut ExecutionContext {
                ledgers: &mut self.ledgers,
                app: &mut self.app,
                requests: &self.requests,
            };
            replica.send_batches(ctx)?;
        }
        self.process_dropped();
        self.process_ordered(now)?;

        self.try_complete_view_change(now)
    }

    fn on_receive_msg(
        &mut self,
        msg: Message,
        origin: &VerifyingKey,
        now: Instant,
    ) -> Result<(), NodeError> {
        if !self.config.pool.contains(origin) {
            self.reject(origin, &msg, RejectReason::NotInPool);
            return Ok(());
        }

        match msg {
            Message::ThreePhaseMessage(three_phase_msg) => {
                self.on_receive_three_phase_msg(three_phase_msg, origin)
            }
            Message::Checkpoint(checkpoint) => {
                match self.replicas.get_mut(checkpoint.inst_id.int() as usize) {
                    Some(replica) => replica.on_receive_checkpoint(checkpoint, origin),
                    None => self.reject(
                        origin,
                        &Message::Checkpoint(checkpoint),
                        RejectReason::WrongView,
                    ),
                }
                Ok(())
            }
            Message::ViewChangeDone(view_change_done) => {
                self.on_receive_view_change_done(view_change_done, origin, now)
            }
        }
    }

    fn on_receive_three_phase_msg(
        &mut self,
        msg: ThreePhaseMessage,
        origin: &VerifyingKey,
    ) -> Result<(), NodeError> {
        // Hold on to messages for views this node has yet to enter.
        if msg.view_no() > self.coordinator.view_no() {
            if !self.future_view_msgs.insert(msg.clone(), *origin) {
                self.reject(origin, &msg.into(), RejectReason::BufferFull);
            }
            return Ok(());
        }

        let Some(replica) = self.replicas.get_mut(msg.inst_id().int() as usize) else {
            self.reject(origin, &msg.into(), RejectReason::WrongView);
            return Ok(());
        };
        let ctx = &mut ExecutionContext {
            ledgers: &mut self.ledgers,
            app: &mut self.app,
            requests: &self.requests,
        };
        replica.on_receive_msg(msg, origin, ctx)?;
        Ok(())
    }

    fn on_receive_view_change_done(
        &mut self,
        view_change_done: ViewChangeDone,
        origin: &VerifyingKey,
        now: Instant,
    ) -> Result<(), NodeError> {
        if let Some(target) = self
            .coordinator
            .on_receive_view_change_done(view_change_done, origin)
        {
            self.begin_view_change(Some(target), now)?;
        }
        self.try_complete_view_change(now)
    }

    fn begin_view_change(
        &mut self,
        target: Option<ViewNumber>,
        now: Instant,
    ) -> Result<bool, NodeError> {
        // Report everything ordered so far as committed.
        self.process_ordered(now)?;
        let own_state = self.ordered_state();

        let started = match target {
            None => self.coordinator.start_view_change(own_state, now),
            Some(target) => self.coordinator.propose_view_change(target, own_state, now)?,
        };
        if started {
            self.replicas.iter_mut().for_each(Replica::freeze);
            self.try_complete_view_change(now)?;
        }
        Ok(started)
    }

    /// Complete the ongoing view change if a quorum agreed on an ordered state.
    fn try_complete_view_change(&mut self, now: Instant) -> Result<(), NodeError> {
        self.process_ordered(now)?;
        let Some((view_no, agreed)) = self.coordinator.agreed_state() else {
            return Ok(());
        };
        self.coordinator.complete(view_no, agreed.clone());

        // 1. Move every instance to the new view.
        for replica in self.replicas.iter_mut() {
            let inst_id = replica.inst_id();
            let agreed_last_ordered = agreed
                .last_ordered_of(inst_id)
                .unwrap_or(PpSeqNo::new(0));
            let ctx = &mut ExecutionContext {
                ledgers: &mut self.ledgers,
                app: &mut self.app,
                requests: &self.requests,
            };
            replica.complete_view_change(
                view_no,
                self.config.pool.primary(view_no, inst_id),
                agreed_last_ordered,
                ctx,
            )?;
        }

        // 2. Judge the new master afresh.
        self.monitor.reset(now);

        // 3. Replay what arrived early.
        for (origin, msg) in self.future_view_msgs.take(view_no) {
            self.on_receive_three_phase_msg(msg, &origin)?;
        }
        self.process_ordered(now)
    }

    /// The commit path: collect what every instance ordered, and commit what the master instance
    /// ordered to the ledgers and the app.
    fn process_ordered(&mut self, now: Instant) -> Result<(), NodeError> {
        let mut ordered_any = false;
        for replica in self.replicas.iter_mut() {
            for ordered in replica.take_ordered() {
                ordered_any = true;
                self.monitor
                    .batch_ordered(ordered.inst_id, &ordered.req_idr, now);
                for digest in &ordered.req_idr {
                    self.requests
                        .mark_ordered(digest, ordered.inst_id, ordered.pp_seq_no);
                }
                if !ordered.inst_id.is_master() {
                    continue;
                }

                let ledger = self
                    .ledgers
                    .get_mut(&ordered.ledger_id)
                    .ok_or(NodeError::UnknownLedger(ordered.ledger_id))?;
                let (range, _) = ledger.commit_txns(ordered.req_idr.len())?;
                self.app.commit_batches(ordered.ledger_id, 1);
                Event::CommitTxns(CommitTxnsEvent {
                    timestamp: SystemTime::now(),
                    ledger_id: ordered.ledger_id,
                    range,
                })
                .publish(&self.event_publisher);
                self.ordered.push(ordered);
            }
        }

        if ordered_any && self.coordinator.is_view_changing() {
            let own_state = self.ordered_state();
            self.coordinator.update_own_state(own_state);
        }
        self.prune_ordered_requests();
        Ok(())
    }

    /// Forget requests that a primary dropped as invalid, so that they neither linger in the
    /// request store nor count as waiting on the master.
    fn process_dropped(&mut self) {
        let dropped: Vec<CryptoHash> = self
            .replicas
            .iter_mut()
            .flat_map(Replica::take_dropped)
            .collect();
        for digest in dropped {
            log::debug!("Dropping invalid request {:?}", digest);
            self.monitor.request_dropped(&digest);
            self.requests.remove(&digest);
            for replica in self.replicas.iter_mut() {
                replica.forget_request(&digest);
            }
        }
    }

    /// Once the master instance's stable checkpoint moves, forget the digests of requests ordered
    /// more than `request_dedup_window` batches before it.
    fn prune_ordered_requests(&mut self) {
        let Some(stable_end) = self
            .stable_checkpoint(InstanceId::MASTER)
            .map(|checkpoint| checkpoint.seq_no_end)
        else {
            return;
        };
        if stable_end <= self.pruned_up_to {
            return;
        }
        self.pruned_up_to = stable_end;
        self.requests.prune_ordered(PpSeqNo::new(
            stable_end.int().saturating_sub(self.config.request_dedup_window),
        ));
    }

    fn reject(&self, origin: &VerifyingKey, msg: &Message, reason: RejectReason) {
        let (inst_id, view_no, pp_seq_no) = match msg {
            Message::ThreePhaseMessage(msg) => (msg.inst_id(), msg.view_no(), msg.pp_seq_no()),
            Message::Checkpoint(checkpoint) => {
                (checkpoint.inst_id, checkpoint.view_no, checkpoint.seq_no_end)
            }
            Message::ViewChangeDone(view_change_done) => {
                (InstanceId::MASTER, view_change_done.view_no, PpSeqNo::new(0))
            }
        };
        Event::RejectMessage(RejectMessageEvent {
            timestamp: SystemTime::now(),
            origin: *origin,
            inst_id,
            view_no,
            pp_seq_no,
            reason,
        })
        .publish(&self.event_publisher);
    }

    fn drain_events(&self) {
        if let Some(event_subscriber) = &self.event_subscriber {
            drain_events(&self.event_handlers, event_subscriber);
        }
    }
}

#[derive(Debug)]
pub enum NodeError {
    Ledger(LedgerError),
    ViewChange(ViewChangeError),
    /// The node's own key is not a member of the pool.
    NotInPool,
    EmptyPool,
    UnknownLedger(LedgerId),
    DuplicateLedger(LedgerId),
    /// The configured strong quorum is zero, or larger than the pool.
    InvalidQuorum { strong: usize, pool_size: usize },
    /// The app rejected a submitted request.
    InvalidRequest(CryptoHash),
    /// The node hit a fatal error earlier and refuses to do anything but tear down.
    Halted,
}

impl From<LedgerError> for NodeError {
    fn from(value: LedgerError) -> Self {
        NodeError::Ledger(value)
    }
}

impl From<ReplicaError> for NodeError {
    fn from(value: ReplicaError) -> Self {
        match value {
            ReplicaError::Ledger(err) => NodeError::Ledger(err),
        }
    }
}

impl From<ViewChangeError> for NodeError {
    fn from(value: ViewChangeError) -> Self {
        NodeError::ViewChange(value)
    }
}
