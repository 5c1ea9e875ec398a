// Execution Events
// Progress reporting and event types for pipeline runs

use crate::execution::state::{InstanceId, RunState};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a pipeline run.
///
/// Every text field has already been through the run's redactor.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Run admitted and started
    RunStarted {
        workflow: String,
        run_id: String,
        total_jobs: usize,
        depth: usize,
    },

    /// Run reached its terminal state
    RunCompleted {
        workflow: String,
        run_id: String,
        state: RunState,
        duration: Duration,
    },

    /// Run is waiting for a concurrency group held by another run
    ConcurrencyWaiting { group: String, run_id: String },

    /// Job instance changed state
    InstanceTransition {
        instance: InstanceId,
        from: RunState,
        to: RunState,
        reason: Option<String>,
    },

    /// Step execution started
    StepStarted {
        instance: InstanceId,
        step_index: usize,
        step_name: String,
    },

    /// Step output (stdout/stderr)
    StepOutput {
        instance: InstanceId,
        step_index: usize,
        output: String,
        is_error: bool,
    },

    /// Step execution completed
    StepCompleted {
        instance: InstanceId,
        step_index: usize,
        outcome: StepConclusion,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Step was skipped (condition evaluated to false)
    StepSkipped {
        instance: InstanceId,
        step_index: usize,
        reason: String,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        instance: Option<InstanceId>,
    },
}

/// Result of a single step as exposed through `steps.<id>.outcome`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepConclusion {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl StepConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepConclusion::Success => "success",
            StepConclusion::Failure => "failure",
            StepConclusion::Cancelled => "cancelled",
            StepConclusion::Skipped => "skipped",
        }
    }
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn run_started(
        workflow: impl Into<String>,
        run_id: impl Into<String>,
        total_jobs: usize,
        depth: usize,
    ) -> Self {
        Self::RunStarted {
            workflow: workflow.into(),
            run_id: run_id.into(),
            total_jobs,
            depth,
        }
    }

    pub fn run_completed(
        workflow: impl Into<String>,
        run_id: impl Into<String>,
        state: RunState,
        duration: Duration,
    ) -> Self {
        Self::RunCompleted {
            workflow: workflow.into(),
            run_id: run_id.into(),
            state,
            duration,
        }
    }

    pub fn transition(
        instance: InstanceId,
        from: RunState,
        to: RunState,
        reason: Option<String>,
    ) -> Self {
        Self::InstanceTransition {
            instance,
            from,
            to,
            reason,
        }
    }

    /// Create a step output event
    pub fn step_output(
        instance: InstanceId,
        step_index: usize,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            instance,
            step_index,
            output: output.into(),
            is_error,
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, instance: Option<InstanceId>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            instance,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, instance: Option<InstanceId>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            instance,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, instance: Option<InstanceId>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            instance,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
