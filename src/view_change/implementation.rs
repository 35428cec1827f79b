/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of the view change protocol.
//!
//! Main type: [`ViewChangeCoordinator`].

use std::{
    collections::{HashMap, HashSet},
    sync::mpsc::Sender,
    time::{Duration, Instant, SystemTime},
};

use crate::{
    events::{
        CatchupNeededEvent, CompleteViewChangeEvent, Event, StartViewChangeEvent,
        ViewChangeTimeoutEvent,
    },
    networking::{network::Network, sending::SenderHandle},
    types::{crypto_primitives::VerifyingKey, data_types::ViewNumber, pool::Quorums},
};

use super::messages::{OrderedState, ViewChangeDone};

#[derive(Clone)]
pub struct ViewChangeConfiguration {
    pub me: VerifyingKey,
    pub quorums: Quorums,
    /// How long to wait for a quorum before re-broadcasting. Doubles on every retry.
    pub view_change_timeout: Duration,
    /// How many times to re-broadcast for the same target before moving on to the next view.
    pub view_change_max_retries: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ViewChangeState {
    Stable,
    ViewChanging {
        target: ViewNumber,
        deadline: Instant,
        retries: u32,
        timeout: Duration,
    },
}

/// A single participant in the view change protocol.
///
/// # Usage
///
/// The node drives the coordinator through:
/// 1. [`start_view_change`](Self::start_view_change) when its master instance is found degraded, and
///    [`propose_view_change`](Self::propose_view_change) to change to a specific view (e.g., when
///    joining other nodes).
/// 2. [`update_own_state`](Self::update_own_state) whenever it orders a batch while changing views.
/// 3. [`on_receive_view_change_done`](Self::on_receive_view_change_done) when a [`ViewChangeDone`]
///    is received.
/// 4. [`agreed_state`](Self::agreed_state) and [`complete`](Self::complete) to find out whether a
///    quorum agreed and to finish the view change.
/// 5. [`tick`](Self::tick) as often as is practical.
///
/// # Agreement
///
/// A view change completes once a strong quorum of nodes, counting this node, report the same
/// [`OrderedState`] for a view above the current one. That view is usually this node's own target,
/// but may be lower if this node moved on without the rest of the pool. Only the latest report of
/// every sender counts.
pub struct ViewChangeCoordinator<N: Network> {
    config: ViewChangeConfiguration,
    view_no: ViewNumber,
    state: ViewChangeState,
    reports: HashMap<VerifyingKey, ViewChangeDone>,
    own_report: Option<ViewChangeDone>,
    // This node's report in the view change that brought it to `view_no`, sent to nodes that are still
    // trying to complete it.
    completed_report: Option<ViewChangeDone>,
    replied_to: HashSet<VerifyingKey>,
    sender: SenderHandle<N>,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network> ViewChangeCoordinator<N> {
    pub(crate) fn new(
        config: ViewChangeConfiguration,
        sender: SenderHandle<N>,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            config,
            view_no: ViewNumber::init(),
            state: ViewChangeState::Stable,
            reports: HashMap::new(),
            own_report: None,
            completed_report: None,
            replied_to: HashSet::new(),
            sender,
            event_publisher,
        }
    }

    /// The view this node is in. Stays the same until a view change completes.
    pub fn view_no(&self) -> ViewNumber {
        self.view_no
    }

    pub fn is_view_changing(&self) -> bool {
        matches!(self.state, ViewChangeState::ViewChanging { .. })
    }

    /// The view this node is changing to, if it is changing views.
    pub fn target(&self) -> Option<ViewNumber> {
        match self.state {
            ViewChangeState::Stable => None,
            ViewChangeState::ViewChanging { target, .. } => Some(target),
        }
    }

    /// Start changing to the next view. Does nothing if a view change is already in progress.
    ///
    /// Returns whether a view change was started.
    pub(crate) fn start_view_change(&mut self, own_state: OrderedState, now: Instant) -> bool {
        if self.is_view_changing() {
            return false;
        }
        self.begin(self.view_no + 1, own_state, now);
        true
    }

    /// Start changing to `target`, or move an ongoing view change up to `target`.
    ///
    /// Returns whether the target changed.
    pub(crate) fn propose_view_change(
        &mut self,
        target: ViewNumber,
        own_state: OrderedState,
        now: Instant,
    ) -> Result<bool, ViewChangeError> {
        if target <= self.view_no {
            return Err(ViewChangeError::StaleTarget {
                view_no: self.view_no,
                target,
            });
        }
        if self.target().is_some_and(|current| current >= target) {
            return Ok(false);
        }
        self.begin(target, own_state, now);
        Ok(true)
    }

    /// Re-broadcast this node's report if its ordered state changed since it was last sent.
    pub(crate) fn update_own_state(&mut self, own_state: OrderedState) {
        if !self.is_view_changing() {
            return;
        }
        let Some(own_report) = self.own_report.as_mut() else {
            return;
        };
        if own_report.state == own_state {
            return;
        }
        own_report.state = own_state;
        self.sender.broadcast(own_report.clone());
    }

    /// Record `origin`'s report.
    ///
    /// Returns a target this node should join, if `f + 1` nodes report view changes to views above
    /// the one this node is in or changing to.
    pub(crate) fn on_receive_view_change_done(
        &mut self,
        report: ViewChangeDone,
        origin: &VerifyingKey,
    ) -> Option<ViewNumber> {
        // 1. Help nodes that have not seen the view change this node last completed. That includes
        //    nodes that moved on to a view above it without the rest of the pool.
        if report.view_no >= self.view_no {
            if let Some(completed_report) = &self.completed_report {
                if self.replied_to.insert(*origin) {
                    self.sender.send(*origin, completed_report.clone());
                }
            }
        }
        if report.view_no <= self.view_no {
            return None;
        }

        // 2. Replace the sender's previous report.
        self.reports.insert(*origin, report);

        // 3. Join the others if enough of them are ahead.
        let current = self.target().unwrap_or(self.view_no);
        self.join_target().filter(|target| *target > current)
    }

    /// The highest view that at least `f + 1` other nodes report a view change to, or beyond.
    pub fn join_target(&self) -> Option<ViewNumber> {
        let mut targets: Vec<ViewNumber> = self
            .reports
            .values()
            .map(|report| report.view_no)
            .filter(|view_no| *view_no > self.view_no)
            .collect();
        targets.sort_unstable_by(|a, b| b.cmp(a));
        targets.get(self.config.quorums.weak - 1).copied()
    }

    /// The highest view above the current one for which a strong quorum reported the same state,
    /// along with that state. Only available while changing views.
    ///
    /// The view may be below this node's own target: a node that moved on alone follows the pool
    /// back to the view it settled on.
    pub fn agreed_state(&self) -> Option<(ViewNumber, OrderedState)> {
        if !self.is_view_changing() {
            return None;
        }
        let mut tallies: Vec<(ViewNumber, &OrderedState, usize)> = Vec::new();
        let reports = self
            .reports
            .iter()
            .filter(|(origin, _)| **origin != self.config.me)
            .map(|(_, report)| report)
            .chain(self.own_report.as_ref())
            .filter(|report| report.view_no > self.view_no);
        for report in reports {
            match tallies.iter_mut().find(|(view_no, state, _)| {
                *view_no == report.view_no && **state == report.state
            }) {
                Some((_, _, count)) => *count += 1,
                None => tallies.push((report.view_no, &report.state, 1)),
            }
        }
        tallies
            .into_iter()
            .filter(|(_, _, count)| *count >= self.config.quorums.strong)
            .max_by_key(|(view_no, _, _)| *view_no)
            .map(|(view_no, state, _)| (view_no, state.clone()))
    }

    /// Finish the view change, moving to `view_no`. `view_no` and `agreed` must be the result of
    /// [`agreed_state`](Self::agreed_state).
    pub(crate) fn complete(&mut self, view_no: ViewNumber, agreed: OrderedState) {
        if !self.is_view_changing() || view_no <= self.view_no {
            return;
        }
        let own_state = self.own_report.take().map(|own_report| own_report.state);

        self.view_no = view_no;
        self.state = ViewChangeState::Stable;
        self.reports.retain(|_, report| report.view_no > view_no);
        self.replied_to.clear();

        Event::CompleteViewChange(CompleteViewChangeEvent {
            timestamp: SystemTime::now(),
            view_no,
            state: agreed.clone(),
        })
        .publish(&self.event_publisher);

        if let Some(own_state) = &own_state {
            if *own_state != agreed {
                Event::CatchupNeeded(CatchupNeededEvent {
                    timestamp: SystemTime::now(),
                    view_no,
                    own: own_state.clone(),
                    agreed,
                })
                .publish(&self.event_publisher);
            }
        }
        self.completed_report = own_state.map(|state| ViewChangeDone { view_no, state });
    }

    /// Check whether the ongoing view change timed out. If it did, re-broadcast this node's report
    /// with a doubled timeout. Once the retries are used up, move on to the view after the target,
    /// but only if another node reports a view change to the target or beyond. Otherwise keep
    /// re-broadcasting for the same target at the last timeout.
    pub(crate) fn tick(&mut self, now: Instant) {
        let ViewChangeState::ViewChanging {
            target,
            deadline,
            retries,
            timeout,
        } = self.state
        else {
            return;
        };
        if now < deadline {
            return;
        }

        Event::ViewChangeTimeout(ViewChangeTimeoutEvent {
            timestamp: SystemTime::now(),
            target,
            retries,
        })
        .publish(&self.event_publisher);

        if retries < self.config.view_change_max_retries {
            let timeout = timeout * 2;
            self.state = ViewChangeState::ViewChanging {
                target,
                deadline: now + timeout,
                retries: retries + 1,
                timeout,
            };
            if let Some(own_report) = &self.own_report {
                self.sender.broadcast(own_report.clone());
            }
        } else if self.is_backed(target) {
            if let Some(own_report) = self.own_report.take() {
                self.begin(target + 1, own_report.state, now);
            }
        } else {
            self.state = ViewChangeState::ViewChanging {
                target,
                deadline: now + timeout,
                retries,
                timeout,
            };
            if let Some(own_report) = &self.own_report {
                self.sender.broadcast(own_report.clone());
            }
        }
    }

    // Whether another node is changing to `target` or a view beyond it.
    fn is_backed(&self, target: ViewNumber) -> bool {
        self.reports
            .iter()
            .any(|(origin, report)| *origin != self.config.me && report.view_no >= target)
    }

    fn begin(&mut self, target: ViewNumber, own_state: OrderedState, now: Instant) {
        let timeout = self.config.view_change_timeout;
        self.state = ViewChangeState::ViewChanging {
            target,
            deadline: now + timeout,
            retries: 0,
            timeout,
        };

        let own_report = ViewChangeDone {
            view_no: target,
            state: own_state,
        };
        self.sender.broadcast(own_report.clone());
        self.own_report = Some(own_report);

        Event::StartViewChange(StartViewChangeEvent {
            timestamp: SystemTime::now(),
            view_no: self.view_no,
            target,
        })
        .publish(&self.event_publisher);
    }
}

#[derive(Debug)]
pub enum ViewChangeError {
    /// A view change was proposed to a view this node is already in or past.
    StaleTarget {
        view_no: ViewNumber,
        target: ViewNumber,
    },
}
