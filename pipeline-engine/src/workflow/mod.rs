// Workflow Module
// Definition model and the loader that validates parsed trees into it

pub mod models;
pub mod parser;

pub use models::{
    ActionInput, ActionOutput, ActionRuns, CompositeAction, Concurrency, Defaults, EventConfig,
    InputType, Job, RunDefaults, SecretsBinding, Step, Strategy, Toggle, TriggerEvent, Workflow,
    WorkflowInput, WorkflowOutput, WorkflowSecret,
};
pub use parser::WorkflowParser;
