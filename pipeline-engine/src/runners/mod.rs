// Runners Module
// The step execution collaborator seam and the local shell runner

pub mod shell;

pub use shell::{ShellRunner, ShellTemplate};

use crate::error::ExecutionError;
use crate::execution::state::InstanceId;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a step asks the collaborator to do
#[derive(Debug, Clone, PartialEq)]
pub enum StepCommand {
    /// Run a script through a shell
    Script {
        script: String,
        shell: Option<String>,
    },
    /// Run an action the engine could not inline
    Action {
        uses: String,
        with: BTreeMap<String, String>,
    },
}

/// One step dispatch
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub instance: InstanceId,
    pub step_index: usize,
    pub step_name: String,
    pub command: StepCommand,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    /// Resolved `runs-on` label, if the job declared one
    pub runs_on: Option<String>,
}

/// A line the step emitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    pub is_error: bool,
}

impl LogLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// What the collaborator reports back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub exit_code: Option<i32>,
    pub outputs: BTreeMap<String, String>,
    pub logs: Vec<LogLine>,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl StepOutcome {
    /// A zero exit with no outputs
    pub fn success() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn failure(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), value.into());
        self
    }

    pub fn with_log(mut self, line: LogLine) -> Self {
        self.logs.push(line);
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }
}

/// Executes single steps on behalf of the scheduler.
///
/// `cancel` fires when the instance is cancelled; implementations should
/// stop promptly and report `cancelled`.
#[async_trait::async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(
        &self,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, ExecutionError>;
}
