//! Run state machine for the download pipeline.
//!
//! Transitions are a pure function of `(state, event)`. The worker task is the
//! only writer of a [`BatchRun`]; the controller only reads it for snapshots.

use crate::types::{
    AcceptedMedia, FailedEntry, PendingEntry, RunProgress, RunReport, RunSnapshot, RunState,
};
use std::collections::VecDeque;

/// Something that happened to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Pause,
    Resume,
    Stop,
    /// The queue ran dry.
    Drained,
    /// The worker noticed the cancel flag at an entry boundary.
    CancelObserved,
}

/// What the worker has to do about a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    None,
    /// Stop polling the in-flight attempt.
    SuspendFetch,
    /// Poll the held attempt again, or take the next entry.
    ResumeFetch,
    /// Drop the in-flight attempt and the rest of the queue.
    CancelFetch,
    /// Deliver the report.
    Complete,
}

pub(crate) fn transition(state: RunState, event: Event) -> (RunState, Effect) {
    use RunState::*;

    match (state, event) {
        (Running, Event::Pause) => (Paused, Effect::SuspendFetch),
        (Paused, Event::Resume) => (Running, Effect::ResumeFetch),
        (Running | Paused, Event::Stop) => (Stopping, Effect::CancelFetch),
        (Running, Event::Drained) => (Completed, Effect::Complete),
        (Stopping, Event::CancelObserved) => (Completed, Effect::Complete),
        (state, _) => (state, Effect::None),
    }
}

/// Mutable state of one run.
#[derive(Debug)]
pub(crate) struct BatchRun {
    queue: VecDeque<PendingEntry>,
    accepted: Vec<AcceptedMedia>,
    failed: Vec<FailedEntry>,
    total: usize,
    state: RunState,
    cancel_requested: bool,
}

impl BatchRun {
    pub(crate) fn new(entries: Vec<PendingEntry>) -> Self {
        Self {
            total: entries.len(),
            queue: entries.into(),
            accepted: Vec::new(),
            failed: Vec::new(),
            state: RunState::Running,
            cancel_requested: false,
        }
    }

    /// Placeholder before the first run.
    pub(crate) fn idle() -> Self {
        let mut run = Self::new(Vec::new());
        run.state = RunState::Idle;
        run
    }

    pub(crate) fn state(&self) -> RunState {
        self.state
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub(crate) fn apply(&mut self, event: Event) -> Effect {
        let (next, effect) = transition(self.state, event);
        self.state = next;
        if effect == Effect::CancelFetch {
            self.cancel_requested = true;
            self.queue.clear();
        }
        effect
    }

    pub(crate) fn next_entry(&mut self) -> Option<PendingEntry> {
        self.queue.pop_front()
    }

    /// Puts an interrupted entry back at the head so it is retried first.
    pub(crate) fn requeue_front(&mut self, entry: PendingEntry) {
        if !self.cancel_requested {
            self.queue.push_front(entry);
        }
    }

    pub(crate) fn record_accepted(&mut self, media: AcceptedMedia) {
        debug_assert!(self.processed() < self.total);
        self.accepted.push(media);
    }

    pub(crate) fn record_failed(&mut self, failed: FailedEntry) {
        debug_assert!(self.processed() < self.total);
        self.failed.push(failed);
    }

    pub(crate) fn processed(&self) -> usize {
        self.accepted.len() + self.failed.len()
    }

    pub(crate) fn progress(&self) -> RunProgress {
        RunProgress {
            state: self.state,
            total: self.total,
            queued: self.queue.len(),
            accepted: self.accepted.len(),
            failed: self.failed.len(),
        }
    }

    pub(crate) fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            state: self.state,
            total: self.total,
            queue: self.queue.iter().cloned().collect(),
            accepted: self.accepted.clone(),
            failed: self.failed.clone(),
        }
    }

    pub(crate) fn report(&self) -> RunReport {
        RunReport {
            total: self.total,
            accepted: self.accepted.clone(),
            failed: self.failed.clone(),
            stopped: self.cancel_requested,
        }
    }
}
