// Sub-Pipeline Resolver
// Resolves `uses:` references and runs called workflows as nested runs

use crate::error::{DefinitionError, EngineError};
use crate::execution::context::ContextSnapshot;
use crate::execution::executor::{PipelineExecutor, RunRequest};
use crate::execution::job::{InstanceContext, InstanceReport};
use crate::execution::state::RunState;
use crate::trigger::{bind_inputs, ActivationSeed};
use crate::workflow::{CompositeAction, SecretsBinding, Workflow, WorkflowParser};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Looks up the definitions behind `uses:` references.
///
/// `resolve_action` returns `Ok(None)` for actions the engine does not
/// inline; those are handed to the step runner instead.
pub trait WorkflowResolver: Send + Sync {
    fn resolve_workflow(&self, reference: &str) -> Result<Workflow, DefinitionError>;

    fn resolve_action(&self, reference: &str) -> Result<Option<CompositeAction>, DefinitionError>;
}

fn is_local(reference: &str) -> bool {
    reference.starts_with("./") || reference.starts_with("../")
}

/// In-memory resolver, used by tests and embedders
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    workflows: HashMap<String, Workflow>,
    actions: HashMap<String, CompositeAction>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow(mut self, reference: impl Into<String>, workflow: Workflow) -> Self {
        self.workflows.insert(reference.into(), workflow);
        self
    }

    pub fn with_action(mut self, reference: impl Into<String>, action: CompositeAction) -> Self {
        self.actions.insert(reference.into(), action);
        self
    }
}

impl WorkflowResolver for StaticResolver {
    fn resolve_workflow(&self, reference: &str) -> Result<Workflow, DefinitionError> {
        self.workflows
            .get(reference)
            .cloned()
            .ok_or_else(|| DefinitionError::unresolved(reference, "no such workflow"))
    }

    fn resolve_action(&self, reference: &str) -> Result<Option<CompositeAction>, DefinitionError> {
        match self.actions.get(reference) {
            Some(action) => Ok(Some(action.clone())),
            None if is_local(reference) => {
                Err(DefinitionError::unresolved(reference, "no such action"))
            }
            None => Ok(None),
        }
    }
}

/// Resolves local references against a workspace directory
#[derive(Debug, Clone)]
pub struct FsResolver {
    root: PathBuf,
}

impl FsResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl WorkflowResolver for FsResolver {
    fn resolve_workflow(&self, reference: &str) -> Result<Workflow, DefinitionError> {
        if !is_local(reference) {
            return Err(DefinitionError::unresolved(
                reference,
                "remote reusable workflows are not supported",
            ));
        }
        let path = self.root.join(reference);
        debug!(path = %path.display(), "loading called workflow");
        match WorkflowParser::from_file(&path) {
            Ok(workflow) => Ok(workflow),
            Err(EngineError::Definition(e)) => Err(e),
            Err(e) => Err(DefinitionError::unresolved(reference, e.to_string())),
        }
    }

    fn resolve_action(&self, reference: &str) -> Result<Option<CompositeAction>, DefinitionError> {
        if !is_local(reference) {
            return Ok(None);
        }
        let dir = self.root.join(reference);
        let file = ["action.yml", "action.yaml"]
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| DefinitionError::unresolved(reference, "no action.yml found"))?;

        let content = std::fs::read_to_string(&file)
            .map_err(|e| DefinitionError::unresolved(reference, e.to_string()))?;
        WorkflowParser::parse_action_str(&content).map(Some)
    }
}

/// A called workflow, ready to run
struct PreparedCall {
    workflow: Workflow,
    inputs: BTreeMap<String, crate::expression::Value>,
    secrets: BTreeMap<String, String>,
}

impl PipelineExecutor {
    /// Run the reusable workflow behind a `jobs.<id>.uses` as a nested run
    pub(super) async fn call_workflow(
        &self,
        cx: &InstanceContext,
        snapshot: &ContextSnapshot,
    ) -> InstanceReport {
        let start = Instant::now();
        let reference = cx.job.uses.as_deref().unwrap_or_default();

        let depth = cx.depth + 1;
        if depth > self.config.max_nesting_depth {
            return InstanceReport::failed(
                &cx.instance,
                DefinitionError::NestingTooDeep { depth }.to_string(),
            );
        }

        let prepared = match self.prepare_call(cx, reference, snapshot) {
            Ok(prepared) => prepared,
            Err(reason) => return InstanceReport::failed(&cx.instance, reason),
        };

        info!(job = %cx.job_id, instance = %cx.instance, workflow = %reference, depth, "calling reusable workflow");

        let seed = ActivationSeed {
            inputs: prepared.inputs,
            ..(*cx.seed).clone()
        };
        let request = RunRequest::new(prepared.workflow, seed)
            .with_secrets(prepared.secrets)
            .with_vars((*cx.vars).clone())
            .with_cancellation(cx.cancel.child_token())
            .with_run_id(format!("{}.{}", cx.run_id, cx.instance));

        let nested = self.run_at_depth(request, depth).await;

        let (state, reason) = match nested.state {
            RunState::Succeeded => (RunState::Succeeded, None),
            RunState::Cancelled => (RunState::Cancelled, Some("called workflow was cancelled".to_string())),
            _ => {
                let detail = nested.reason.as_deref().unwrap_or("a job failed");
                (RunState::Failed, Some(format!("called workflow failed: {}", detail)))
            }
        };
        info!(job = %cx.job_id, workflow = %reference, state = %state.as_str(), "reusable workflow finished");

        InstanceReport {
            outputs: nested.outputs.clone(),
            duration: start.elapsed(),
            nested: Some(Box::new(nested)),
            ..InstanceReport::finished(cx.instance.clone(), state, reason)
        }
    }

    /// Resolve the callee and bind its inputs and secrets
    fn prepare_call(
        &self,
        cx: &InstanceContext,
        reference: &str,
        snapshot: &ContextSnapshot,
    ) -> Result<PreparedCall, String> {
        let workflow = self
            .resolver()
            .resolve_workflow(reference)
            .map_err(|e| e.to_string())?;
        let interface = workflow
            .call_interface()
            .cloned()
            .ok_or_else(|| {
                DefinitionError::unresolved(reference, "workflow has no workflow_call trigger")
                    .to_string()
            })?;

        let engine = self.engine(snapshot);

        let with = engine
            .expand_tree(&serde_json::Value::Object(cx.job.with.clone()))
            .map_err(|e| format!("with: {}", e))?
            .to_json();
        let supplied = with.as_object().cloned().unwrap_or_default();
        let inputs = bind_inputs(&interface.inputs, &supplied).map_err(|e| e.to_string())?;

        let secrets = match &cx.job.secrets {
            Some(SecretsBinding::Inherit) => (*cx.secrets).clone(),
            Some(SecretsBinding::Explicit(map)) => {
                let mut secrets = BTreeMap::new();
                for (name, template) in map {
                    let value = engine
                        .interpolate(template)
                        .map_err(|e| format!("secrets.{}: {}", name, e))?;
                    secrets.insert(name.clone(), value);
                }
                secrets
            }
            None => BTreeMap::new(),
        };
        for (name, declared) in &interface.secrets {
            if declared.required && !secrets.contains_key(name) {
                return Err(format!("required secret '{}' was not supplied", name));
            }
        }

        Ok(PreparedCall {
            workflow,
            inputs,
            secrets,
        })
    }
}
