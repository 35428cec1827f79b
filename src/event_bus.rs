/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Dispatch of published [events](crate::events) to logging and user-registered handlers.
//!
//! Nodes are polled from a single thread, so instead of running a separate event bus thread, the
//! node drains its event channel at the end of every [`poll`](crate::node::Node::poll) and fires the
//! handlers here in publication order.

use std::sync::mpsc::Receiver;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// One list of handlers per event type. If logging is enabled, the first handler in every list is
/// the event type's [logger](Logger::get_logger).
pub(crate) struct EventHandlers {
    pub(crate) commit_txns_handlers: Vec<HandlerPtr<CommitTxnsEvent>>,
    pub(crate) discard_txns_handlers: Vec<HandlerPtr<DiscardTxnsEvent>>,
    pub(crate) propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub(crate) receive_pre_prepare_handlers: Vec<HandlerPtr<ReceivePrePrepareEvent>>,
    pub(crate) prepare_handlers: Vec<HandlerPtr<PrepareEvent>>,
    pub(crate) commit_handlers: Vec<HandlerPtr<CommitEvent>>,
    pub(crate) order_handlers: Vec<HandlerPtr<OrderEvent>>,
    pub(crate) reject_message_handlers: Vec<HandlerPtr<RejectMessageEvent>>,
    pub(crate) send_checkpoint_handlers: Vec<HandlerPtr<SendCheckpointEvent>>,
    pub(crate) stable_checkpoint_handlers: Vec<HandlerPtr<StableCheckpointEvent>>,
    pub(crate) master_degraded_handlers: Vec<HandlerPtr<MasterDegradedEvent>>,
    pub(crate) start_view_change_handlers: Vec<HandlerPtr<StartViewChangeEvent>>,
    pub(crate) view_change_timeout_handlers: Vec<HandlerPtr<ViewChangeTimeoutEvent>>,
    pub(crate) complete_view_change_handlers: Vec<HandlerPtr<CompleteViewChangeEvent>>,
    pub(crate) catchup_needed_handlers: Vec<HandlerPtr<CatchupNeededEvent>>,
}

// Build a handler list out of the optional logger and the optional user handler.
fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(handler) = user_handler {
        handlers.push(handler);
    }
    handlers
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        commit_txns_handler: Option<HandlerPtr<CommitTxnsEvent>>,
        discard_txns_handler: Option<HandlerPtr<DiscardTxnsEvent>>,
        propose_handler: Option<HandlerPtr<ProposeEvent>>,
        receive_pre_prepare_handler: Option<HandlerPtr<ReceivePrePrepareEvent>>,
        prepare_handler: Option<HandlerPtr<PrepareEvent>>,
        commit_handler: Option<HandlerPtr<CommitEvent>>,
        order_handler: Option<HandlerPtr<OrderEvent>>,
        reject_message_handler: Option<HandlerPtr<RejectMessageEvent>>,
        send_checkpoint_handler: Option<HandlerPtr<SendCheckpointEvent>>,
        stable_checkpoint_handler: Option<HandlerPtr<StableCheckpointEvent>>,
        master_degraded_handler: Option<HandlerPtr<MasterDegradedEvent>>,
        start_view_change_handler: Option<HandlerPtr<StartViewChangeEvent>>,
        view_change_timeout_handler: Option<HandlerPtr<ViewChangeTimeoutEvent>>,
        complete_view_change_handler: Option<HandlerPtr<CompleteViewChangeEvent>>,
        catchup_needed_handler: Option<HandlerPtr<CatchupNeededEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            commit_txns_handlers: handlers(log_events, commit_txns_handler),
            discard_txns_handlers: handlers(log_events, discard_txns_handler),
            propose_handlers: handlers(log_events, propose_handler),
            receive_pre_prepare_handlers: handlers(log_events, receive_pre_prepare_handler),
            prepare_handlers: handlers(log_events, prepare_handler),
            commit_handlers: handlers(log_events, commit_handler),
            order_handlers: handlers(log_events, order_handler),
            reject_message_handlers: handlers(log_events, reject_message_handler),
            send_checkpoint_handlers: handlers(log_events, send_checkpoint_handler),
            stable_checkpoint_handlers: handlers(log_events, stable_checkpoint_handler),
            master_degraded_handlers: handlers(log_events, master_degraded_handler),
            start_view_change_handlers: handlers(log_events, start_view_change_handler),
            view_change_timeout_handlers: handlers(log_events, view_change_timeout_handler),
            complete_view_change_handlers: handlers(log_events, complete_view_change_handler),
            catchup_needed_handlers: handlers(log_events, catchup_needed_handler),
        }
    }

    /// Whether no handler at all is registered, in which case events need not be published.
    pub(crate) fn is_empty(&self) -> bool {
        self.commit_txns_handlers.is_empty()
            && self.discard_txns_handlers.is_empty()
            && self.propose_handlers.is_empty()
            && self.receive_pre_prepare_handlers.is_empty()
            && self.prepare_handlers.is_empty()
            && self.commit_handlers.is_empty()
            && self.order_handlers.is_empty()
            && self.reject_message_handlers.is_empty()
            && self.send_checkpoint_handlers.is_empty()
            && self.stable_checkpoint_handlers.is_empty()
            && self.master_degraded_handlers.is_empty()
            && self.start_view_change_handlers.is_empty()
            && self.view_change_timeout_handlers.is_empty()
            && self.complete_view_change_handlers.is_empty()
            && self.catchup_needed_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::CommitTxns(commit_txns_event) => self
                .commit_txns_handlers
                .iter()
                .for_each(|handler| handler(&commit_txns_event)),

            Event::DiscardTxns(discard_txns_event) => self
                .discard_txns_handlers
                .iter()
                .for_each(|handler| handler(&discard_txns_event)),

            Event::Propose(propose_event) => self
                .propose_handlers
                .iter()
                .for_each(|handler| handler(&propose_event)),

            Event::ReceivePrePrepare(receive_pre_prepare_event) => self
                .receive_pre_prepare_handlers
                .iter()
                .for_each(|handler| handler(&receive_pre_prepare_event)),

            Event::Prepare(prepare_event) => self
                .prepare_handlers
                .iter()
                .for_each(|handler| handler(&prepare_event)),

            Event::Commit(commit_event) => self
                .commit_handlers
                .iter()
                .for_each(|handler| handler(&commit_event)),

            Event::Order(order_event) => self
                .order_handlers
                .iter()
                .for_each(|handler| handler(&order_event)),

            Event::RejectMessage(reject_message_event) => self
                .reject_message_handlers
                .iter()
                .for_each(|handler| handler(&reject_message_event)),

            Event::SendCheckpoint(send_checkpoint_event) => self
                .send_checkpoint_handlers
                .iter()
                .for_each(|handler| handler(&send_checkpoint_event)),

            Event::StableCheckpoint(stable_checkpoint_event) => self
                .stable_checkpoint_handlers
                .iter()
                .for_each(|handler| handler(&stable_checkpoint_event)),

            Event::MasterDegraded(master_degraded_event) => self
                .master_degraded_handlers
                .iter()
                .for_each(|handler| handler(&master_degraded_event)),

            Event::StartViewChange(start_view_change_event) => self
                .start_view_change_handlers
                .iter()
                .for_each(|handler| handler(&start_view_change_event)),

            Event::ViewChangeTimeout(view_change_timeout_event) => self
                .view_change_timeout_handlers
                .iter()
                .for_each(|handler| handler(&view_change_timeout_event)),

            Event::CompleteViewChange(complete_view_change_event) => self
                .complete_view_change_handlers
                .iter()
                .for_each(|handler| handler(&complete_view_change_event)),

            Event::CatchupNeeded(catchup_needed_event) => self
                .catchup_needed_handlers
                .iter()
                .for_each(|handler| handler(&catchup_needed_event)),
        }
    }
}

/// Fire the handlers of every event published so far, in publication order.
pub(crate) fn drain_events(event_handlers: &EventHandlers, event_subscriber: &Receiver<Event>) {
    while let Ok(event) = event_subscriber.try_recv() {
        event_handlers.fire_handlers(event)
    }
}
