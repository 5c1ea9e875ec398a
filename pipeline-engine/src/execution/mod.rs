// Execution Engine Module
// Context store, DAG, matrix expansion, scheduling and nested runs

pub mod concurrency;
pub mod context;
pub mod events;
pub mod executor;
pub mod graph;
pub mod job;
pub mod matrix;
pub mod plan;
pub mod state;
pub mod subpipeline;

// Re-export key types
pub use concurrency::{Admission, ConcurrencyManager, ConcurrencyPermit};
pub use context::{ContextSnapshot, ContextStore, JobContext, Redactor, StatusScope};
pub use events::{
    progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender,
    StepConclusion,
};
pub use executor::{ExecutorConfig, PipelineExecutor, RunReport, RunRequest};
pub use graph::{ExecutionGraph, JobNode};
pub use job::{InstanceReport, StepResult};
pub use matrix::{MatrixExpander, MatrixInstance, MatrixPlan, MatrixSpec};
pub use plan::{ExecutionPlan, PlannedJob, PlannedMatrix};
pub use state::{InstanceId, JobResult, RunState, StateTable, Transition};
pub use subpipeline::{FsResolver, StaticResolver, WorkflowResolver};
