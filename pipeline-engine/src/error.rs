// Engine errors
// One error family per stage of a pipeline run: definition, trigger, evaluation, execution

use thiserror::Error;

/// Errors detected while loading or building a workflow definition.
///
/// These are always fatal to the run and never retried.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DefinitionError {
    #[error("schema violation at '{path}': {message}")]
    SchemaViolation { path: String, message: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("invalid schedule '{cron}': {message}")]
    InvalidSchedule { cron: String, message: String },

    #[error("cannot resolve '{reference}': {message}")]
    UnresolvedReference { reference: String, message: String },

    #[error("nesting depth {depth} exceeds the configured limit")]
    NestingTooDeep { depth: usize },
}

impl DefinitionError {
    pub fn schema(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn unresolved(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            reference: reference.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by the dependency graph builder
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("job '{job}' needs unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },
}

/// Errors raised while matching an event against a trigger specification.
///
/// Fatal to activation only: the pipeline simply does not run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("required input '{input}' was not supplied and has no default")]
    MissingRequiredInput { input: String },

    #[error("input '{input}' has value '{value}' which is not one of [{}]", .options.join(", "))]
    InvalidChoice {
        input: String,
        value: String,
        options: Vec<String>,
    },

    #[error("input '{input}' expects a {expected}, got '{value}'")]
    InvalidInputType {
        input: String,
        expected: String,
        value: String,
    },
}

/// Errors raised while evaluating a single expression.
///
/// Fatal to the consumer of that expression only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("syntax error at position {position}: {message}")]
    Syntax { message: String, position: usize },

    #[error("undefined reference '{path}'")]
    UndefinedReference { path: String },

    #[error("malformed JSON: {message}")]
    MalformedJson { message: String },

    #[error("{function}() expects {expected} argument(s), got {actual}")]
    ArityMismatch {
        function: String,
        expected: String,
        actual: usize,
    },

    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },
}

impl EvaluationError {
    pub fn syntax(message: impl Into<String>, position: usize) -> Self {
        Self::Syntax {
            message: message.into(),
            position,
        }
    }

    pub fn arity(function: &str, expected: impl Into<String>, actual: usize) -> Self {
        Self::ArityMismatch {
            function: function.to_string(),
            expected: expected.into(),
            actual,
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
        }
    }
}

/// Errors reported by the step execution collaborator.
///
/// These surface as failed step outcomes and propagate through normal
/// failure handling.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("step timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("step was cancelled")]
    Cancelled,

    #[error("{0}")]
    Collaborator(String),
}

/// Top-level error for callers that load definitions from disk
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<GraphError> for EngineError {
    fn from(err: GraphError) -> Self {
        EngineError::Definition(DefinitionError::Graph(err))
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
