// Pipeline Engine Library
// Workflow graph execution: expressions, triggers, matrices, scheduling and concurrency

pub mod error;
pub mod execution;
pub mod expression;
pub mod runners;
pub mod trigger;
pub mod workflow;

// Re-export commonly used types
pub use error::{
    DefinitionError, EngineError, EvaluationError, ExecutionError, GraphError, TriggerError,
};

// Re-export definition types
pub use workflow::{CompositeAction, Job, Step, Workflow, WorkflowParser};

// Re-export expression types
pub use expression::{ExpressionEngine, FileHasher, Value, WorkspaceHasher};

// Re-export trigger types
pub use trigger::{Activation, ActivationSeed, Event, TriggerMatcher};

// Re-export execution types
pub use execution::{
    ConcurrencyManager, ContextSnapshot, ExecutionEvent, ExecutionGraph, ExecutionPlan,
    ExecutorConfig, InstanceId, InstanceReport, PipelineExecutor, ProgressSender, RunReport,
    RunRequest, RunState, StaticResolver, FsResolver, WorkflowResolver,
};

// Re-export runner types
pub use runners::{ShellRunner, StepCommand, StepOutcome, StepRequest, StepRunner};
