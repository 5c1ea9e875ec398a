// Run state
// Per-instance state machine, job results and the timestamped transition log

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Lifecycle state of one job instance within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Pending,
    Blocked,
    Runnable,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Skipped | RunState::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Pending, Blocked | Runnable | Skipped | Cancelled | Failed) => true,
            (Blocked, Runnable | Skipped | Cancelled | Failed) => true,
            (Runnable, Running | Cancelled | Failed) => true,
            (Running, Succeeded | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Blocked => "blocked",
            RunState::Runnable => "runnable",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Skipped => "skipped",
            RunState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate result of a job as exposed through `needs.<job>.result`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl JobResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobResult::Success => "success",
            JobResult::Failure => "failure",
            JobResult::Cancelled => "cancelled",
            JobResult::Skipped => "skipped",
        }
    }

    /// Fold the final states of every instance of one job.
    ///
    /// Failure wins over cancellation, which wins over success. A job whose
    /// instances were all skipped is skipped; zero instances is success.
    pub fn aggregate<'a>(states: impl IntoIterator<Item = &'a RunState>) -> JobResult {
        let mut any = false;
        let mut all_skipped = true;
        let mut cancelled = false;

        for state in states {
            any = true;
            match state {
                RunState::Failed => return JobResult::Failure,
                RunState::Cancelled => cancelled = true,
                _ => {}
            }
            if *state != RunState::Skipped {
                all_skipped = false;
            }
        }

        if cancelled {
            JobResult::Cancelled
        } else if any && all_skipped {
            JobResult::Skipped
        } else {
            JobResult::Success
        }
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one job instance: the job name plus an optional matrix key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    pub job: String,
    pub matrix_key: Option<String>,
}

impl InstanceId {
    pub fn job(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            matrix_key: None,
        }
    }

    pub fn matrix(job: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            matrix_key: Some(key.into()),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matrix_key {
            Some(key) => write!(f, "{} ({})", self.job, key),
            None => f.write_str(&self.job),
        }
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub instance: InstanceId,
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Owns the state of every instance in one run and records each change.
///
/// Only the scheduler holds one of these, so transitions are serialized.
#[derive(Debug, Default)]
pub struct StateTable {
    states: BTreeMap<InstanceId, RunState>,
    log: Vec<Transition>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instance: InstanceId) {
        self.states.entry(instance).or_insert(RunState::Pending);
    }

    pub fn get(&self, instance: &InstanceId) -> Option<RunState> {
        self.states.get(instance).copied()
    }

    /// Apply a transition. Illegal transitions are ignored and return false.
    pub fn transition(
        &mut self,
        instance: &InstanceId,
        to: RunState,
        reason: Option<String>,
    ) -> bool {
        let Some(from) = self.states.get(instance).copied() else {
            warn!(%instance, "transition for unknown instance");
            return false;
        };

        if !from.can_transition_to(to) {
            debug!(%instance, %from, %to, "ignoring illegal transition");
            return false;
        }

        self.states.insert(instance.clone(), to);

        if to.is_terminal() {
            info!(%instance, %from, %to, reason = reason.as_deref().unwrap_or(""), "job instance finished");
        } else {
            debug!(%instance, %from, %to, "job instance transition");
        }

        self.log.push(Transition {
            instance: instance.clone(),
            from,
            to,
            at: Utc::now(),
            reason,
        });
        true
    }

    pub fn instances_in(&self, state: RunState) -> Vec<InstanceId> {
        self.states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.states.values().all(RunState::is_terminal)
    }

    pub fn states(&self) -> &BTreeMap<InstanceId, RunState> {
        &self.states
    }

    pub fn log(&self) -> &[Transition] {
        &self.log
    }

    pub fn into_log(self) -> Vec<Transition> {
        self.log
    }
}
