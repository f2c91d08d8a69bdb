//! Node and plan execution statuses
//!
//! The transition table in [`Status::can_transition_to`] is the core
//! invariant of the node state machine: any transition not listed there is
//! rejected by the store before anything is written.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a node execution or a plan execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Created and eligible to run, not yet started
    Queued,
    /// Executing, or waiting on an async callback
    Running,
    /// Blocked on a barrier or resource restraint
    Waiting,
    /// Held by a PAUSE interrupt
    Paused,
    /// Failed and waiting for a human to resolve it
    InterventionWaiting,
    /// Abort in progress
    Discontinuing,
    Succeeded,
    Failed,
    Aborted,
    Expired,
    Skipped,
    /// Engine-side failure (misconfiguration, executor defect)
    Errored,
    /// Failed, but an adviser chose to ignore the failure
    IgnoreFailed,
}

impl Status {
    /// Statuses from which an abort or expiry may still be applied.
    pub const ACTIVE: &'static [Status] = &[
        Status::Queued,
        Status::Running,
        Status::Waiting,
        Status::Paused,
        Status::InterventionWaiting,
        Status::Discontinuing,
    ];

    /// Statuses a step may be in when its response is applied.
    pub const IN_FLIGHT: &'static [Status] = &[Status::Running, Status::Waiting];

    /// Statuses that count as a broken (failed) outcome.
    pub const BROKEN: &'static [Status] = &[Status::Failed, Status::Errored, Status::Expired];

    /// Terminal statuses never change again (except the failure
    /// resolutions allowed by the transition table).
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Status::Succeeded
                | Status::Failed
                | Status::Aborted
                | Status::Expired
                | Status::Skipped
                | Status::Errored
                | Status::IgnoreFailed
        )
    }

    /// Not yet final.
    pub fn is_active(self) -> bool {
        !self.is_final()
    }

    /// A failure an adviser may act on.
    pub fn is_broken(self) -> bool {
        Self::BROKEN.contains(&self)
    }

    /// An outcome that lets the pipeline proceed.
    pub fn is_positive(self) -> bool {
        matches!(self, Status::Succeeded | Status::Skipped | Status::IgnoreFailed)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        match self {
            Queued => matches!(
                to,
                Running | Skipped | Aborted | Discontinuing | Expired | Errored | Paused
            ),
            Running => matches!(
                to,
                Succeeded
                    | Failed
                    | Aborted
                    | Expired
                    | Skipped
                    | Errored
                    | Paused
                    | Waiting
                    | Discontinuing
            ),
            Waiting => matches!(
                to,
                Running
                    | Paused
                    | Succeeded
                    | Failed
                    | Aborted
                    | Expired
                    | Errored
                    | Discontinuing
            ),
            Paused => matches!(
                to,
                Running | Waiting | Queued | Aborted | Expired | Discontinuing
            ),
            InterventionWaiting => matches!(
                to,
                Failed | Expired | Errored | Succeeded | IgnoreFailed | Aborted
            ),
            Failed | Expired | Errored => matches!(to, InterventionWaiting | IgnoreFailed),
            Discontinuing => matches!(to, Aborted | Expired),
            Succeeded | Aborted | Skipped | IgnoreFailed => false,
        }
    }

    /// Fold a set of sibling/child statuses into the status of their parent.
    ///
    /// Any ABORTED wins, then ERRORED, FAILED, EXPIRED (in that order);
    /// otherwise the parent succeeded. An empty set is a success.
    pub fn fold<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
        let mut aborted = false;
        let mut errored = false;
        let mut failed = false;
        let mut expired = false;
        for status in statuses {
            match status {
                Status::Aborted | Status::Discontinuing => aborted = true,
                Status::Errored => errored = true,
                Status::Failed => failed = true,
                Status::Expired => expired = true,
                _ => {}
            }
        }
        if aborted {
            Status::Aborted
        } else if errored {
            Status::Errored
        } else if failed {
            Status::Failed
        } else if expired {
            Status::Expired
        } else {
            Status::Succeeded
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::Waiting => "WAITING",
            Status::Paused => "PAUSED",
            Status::InterventionWaiting => "INTERVENTION_WAITING",
            Status::Discontinuing => "DISCONTINUING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Aborted => "ABORTED",
            Status::Expired => "EXPIRED",
            Status::Skipped => "SKIPPED",
            Status::Errored => "ERRORED",
            Status::IgnoreFailed => "IGNORE_FAILED",
        };
        f.write_str(name)
    }
}
