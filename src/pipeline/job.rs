//! Per-job bookkeeping and the job state machine.

use std::{fmt, time::Duration};

use tokio::time::Instant;
use uuid::Uuid;

use crate::prelude::*;

/// Where a job is in its life.
///
/// ```text
/// Received → Validating → AwaitingSlot → Running → Succeeded ─┐
///                 │             │           ├────→ Failed ────┤
///                 │             │           ├────→ TimedOut ──┼→ Released
///                 │             │           └────→ Cancelled ─┤
///                 └─────────────┴──(early exit)───────────────┘
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    Received,
    Validating,
    AwaitingSlot,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    Released,
}

impl JobState {
    /// Is this one of the outcome states that come right before `Released`?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::TimedOut | JobState::Cancelled
        )
    }

    /// Is `self → next` a legal transition?
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Received, Validating) => true,
            (Validating, AwaitingSlot | Failed | Cancelled) => true,
            (AwaitingSlot, Running | Failed | TimedOut | Cancelled) => true,
            (Running, Succeeded | Failed | TimedOut | Cancelled) => true,
            (from, Released) => from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A single in-flight recognition job.
#[derive(Debug)]
pub struct RecognitionJob {
    /// Unique ID, used in logs and response headers.
    pub id: Uuid,
    /// When we received the request.
    pub started_at: Instant,
    /// When the job must be finished, including time spent queued.
    pub deadline: Instant,
    state: JobState,
    history: Vec<JobState>,
}

impl RecognitionJob {
    /// Start a new job with the given overall time limit.
    pub fn new(timeout: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            id: Uuid::new_v4(),
            started_at,
            deadline: started_at + timeout,
            state: JobState::Received,
            history: vec![JobState::Received],
        }
    }

    /// Every state we've been in, oldest first.
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    /// Time since the job was received.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Move to `next`. An illegal transition is an orchestrator bug; we log
    /// it loudly but still record it, so the history shows what happened.
    pub fn transition(&mut self, next: JobState) {
        if !self.state.can_transition_to(next) {
            error!(
                job_id = %self.id,
                "Illegal job transition {} → {}",
                self.state,
                next
            );
        }
        debug!(job_id = %self.id, from = %self.state, to = %next, "Job state changed");
        self.state = next;
        self.history.push(next);
    }
}
