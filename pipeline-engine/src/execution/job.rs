// Job Instance Execution
// Runs one job instance: admission, step sequencing, composite actions and outputs

use crate::error::DefinitionError;
use crate::execution::concurrency::{Admission, ConcurrencyPermit};
use crate::execution::context::{ContextSnapshot, Redactor, StatusScope};
use crate::execution::events::{EventSender, ExecutionEvent, StepConclusion};
use crate::execution::executor::{BoxFuture, PipelineExecutor, RunReport};
use crate::execution::state::{InstanceId, RunState};
use crate::expression::Value;
use crate::runners::{StepCommand, StepRequest};
use crate::trigger::ActivationSeed;
use crate::workflow::models::scalar_to_string;
use crate::workflow::{CompositeAction, Concurrency, Job, Step, Workflow};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of a single step
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub index: usize,
    pub id: Option<String>,
    pub name: String,
    /// What happened before `continue-on-error` was applied
    pub outcome: StepConclusion,
    pub conclusion: StepConclusion,
    pub exit_code: Option<i32>,
    pub outputs: BTreeMap<String, String>,
    pub error: Option<String>,
    pub duration: Duration,
    /// Steps of a composite action, in order
    pub steps: Vec<StepResult>,
}

impl StepResult {
    fn new(index: usize, id: Option<String>, name: String) -> Self {
        Self {
            index,
            id,
            name,
            outcome: StepConclusion::Success,
            conclusion: StepConclusion::Success,
            exit_code: None,
            outputs: BTreeMap::new(),
            error: None,
            duration: Duration::ZERO,
            steps: Vec::new(),
        }
    }

    fn conclude(mut self, conclusion: StepConclusion) -> Self {
        self.outcome = conclusion;
        self.conclusion = conclusion;
        self
    }

    fn to_context(&self) -> Value {
        let mut ctx = BTreeMap::new();
        ctx.insert("outputs".to_string(), Value::from(self.outputs.clone()));
        ctx.insert("outcome".to_string(), Value::from(self.outcome.as_str()));
        ctx.insert("conclusion".to_string(), Value::from(self.conclusion.as_str()));
        Value::Object(ctx)
    }
}

/// Final account of one job instance
#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub instance: InstanceId,
    pub state: RunState,
    pub reason: Option<String>,
    pub steps: Vec<StepResult>,
    pub outputs: BTreeMap<String, String>,
    /// Failed, but `continue-on-error` let it count as succeeded
    pub failure_tolerated: bool,
    pub duration: Duration,
    /// The nested run of a reusable workflow call
    pub nested: Option<Box<RunReport>>,
}

impl InstanceReport {
    pub fn finished(instance: InstanceId, state: RunState, reason: Option<String>) -> Self {
        Self {
            instance,
            state,
            reason,
            steps: Vec::new(),
            outputs: BTreeMap::new(),
            failure_tolerated: false,
            duration: Duration::ZERO,
            nested: None,
        }
    }

    pub(super) fn failed(instance: &InstanceId, reason: impl Into<String>) -> Self {
        Self::finished(instance.clone(), RunState::Failed, Some(reason.into()))
    }
}

/// Everything an instance task owns
pub(crate) struct InstanceContext {
    pub instance: InstanceId,
    pub job_id: String,
    pub job: Arc<Job>,
    pub workflow: Arc<Workflow>,
    /// Job snapshot with `needs`, `matrix` and `strategy` for this instance
    pub snapshot: ContextSnapshot,
    /// Resolved workflow-level env
    pub env: Arc<BTreeMap<String, String>>,
    pub redactor: Redactor,
    pub cancel: CancellationToken,
    pub run_id: String,
    pub depth: usize,
    pub seed: Arc<ActivationSeed>,
    pub secrets: Arc<BTreeMap<String, String>>,
    pub vars: Arc<BTreeMap<String, String>>,
}

/// Where a step sequence runs: the job itself or a composite action in it
struct StepFrame {
    /// Snapshot the sequence's `steps`, `env` and `job` contexts layer onto
    base: ContextSnapshot,
    env: BTreeMap<String, String>,
    shell: Option<String>,
    working_directory: Option<String>,
    depth: usize,
    /// Composite steps report under their calling step
    parent: Option<(usize, String)>,
}

impl StepFrame {
    fn step_name(&self, step: &Step) -> String {
        match &self.parent {
            Some((_, name)) => format!("{} / {}", name, step.display_name()),
            None => step.display_name(),
        }
    }

    fn event_index(&self, index: usize) -> usize {
        self.parent.as_ref().map_or(index, |(i, _)| *i)
    }

    fn snapshot(&self, state: &Sequence, cancel: &CancellationToken) -> ContextSnapshot {
        let status = if state.failed {
            "failure"
        } else if cancel.is_cancelled() {
            "cancelled"
        } else {
            "success"
        };
        let mut job = BTreeMap::new();
        job.insert("status".to_string(), Value::from(status));

        self.base
            .with_context("steps", Value::Object(state.steps.clone()))
            .with_context("env", Value::from(self.env.clone()))
            .with_context("job", Value::Object(job))
            .with_status(StatusScope {
                succeeded: !state.failed,
                failed: state.any_failure,
            })
            .with_cancellation(cancel.clone())
    }
}

/// Accumulated state of a step sequence
#[derive(Debug, Default)]
struct Sequence {
    results: Vec<StepResult>,
    /// The `steps` context
    steps: BTreeMap<String, Value>,
    /// A step failed and was not tolerated
    failed: bool,
    /// A step failed, tolerated or not
    any_failure: bool,
    cancelled: bool,
    first_failure: Option<String>,
}

impl Sequence {
    /// Rebuild the state of a sequence from the results it recorded
    fn replay(results: Vec<StepResult>) -> Self {
        let mut state = Self::default();
        for result in results {
            state.record(result);
        }
        state
    }

    fn record(&mut self, result: StepResult) {
        match result.outcome {
            StepConclusion::Failure => {
                self.any_failure = true;
                if result.conclusion == StepConclusion::Failure {
                    self.failed = true;
                    if self.first_failure.is_none() {
                        let detail = result.error.as_deref().unwrap_or("failed");
                        self.first_failure = Some(format!("step '{}': {}", result.name, detail));
                    }
                }
            }
            StepConclusion::Cancelled => self.cancelled = true,
            _ => {}
        }
        if let Some(id) = &result.id {
            self.steps.insert(id.clone(), result.to_context());
        }
        self.results.push(result);
    }
}

impl PipelineExecutor {
    pub(super) async fn run_instance(&self, cx: InstanceContext) -> InstanceReport {
        let start = Instant::now();
        debug!(instance = %cx.instance, "instance started");
        let mut report = self.run_instance_inner(&cx).await;
        report.duration = start.elapsed();
        report.reason = report.reason.map(|r| cx.redactor.redact(&r));
        report
    }

    async fn run_instance_inner(&self, cx: &InstanceContext) -> InstanceReport {
        // job env is interpolated against the workflow layer
        let mut env = (*cx.env).clone();
        {
            let engine = self.engine(&cx.snapshot);
            for (key, template) in &cx.job.env {
                match engine.interpolate(template) {
                    Ok(value) => {
                        env.insert(key.clone(), value);
                    }
                    Err(e) => return InstanceReport::failed(&cx.instance, format!("env.{}: {}", key, e)),
                }
            }
        }
        let snapshot = cx.snapshot.with_context("env", Value::from(env.clone()));

        let _permit = match &cx.job.concurrency {
            Some(spec) => match self.admit_instance(cx, spec, &snapshot).await {
                Ok(permit) => Some(permit),
                Err(report) => return report,
            },
            None => None,
        };

        let tolerated = self.toggle(&cx.job.continue_on_error, &snapshot);

        let mut report = if cx.job.is_call() {
            self.call_workflow(cx, &snapshot).await
        } else {
            self.run_job_steps(cx, snapshot, env).await
        };

        if report.state == RunState::Failed && tolerated {
            info!(instance = %cx.instance, "job failure tolerated by continue-on-error");
            report.state = RunState::Succeeded;
            report.failure_tolerated = true;
            report.reason = Some(format!(
                "failure tolerated: {}",
                report.reason.as_deref().unwrap_or("failed")
            ));
        }
        report
    }

    /// Wait for a job-level concurrency group
    async fn admit_instance(
        &self,
        cx: &InstanceContext,
        spec: &Concurrency,
        snapshot: &ContextSnapshot,
    ) -> Result<ConcurrencyPermit, InstanceReport> {
        let group = self
            .engine(snapshot)
            .interpolate_required(spec.group())
            .map_err(|e| InstanceReport::failed(&cx.instance, format!("concurrency group: {}", e)))?;
        let cancel_in_progress = self.toggle(&spec.cancel_in_progress(), snapshot);
        let holder_id = format!("{}/{}", cx.run_id, cx.instance);

        if self.concurrency.holder(&group).is_some() {
            self.event_tx.send_event(ExecutionEvent::ConcurrencyWaiting {
                group: cx.redactor.redact(&group),
                run_id: holder_id.clone(),
            });
        }

        match self
            .concurrency
            .acquire(&group, &holder_id, cancel_in_progress, cx.cancel.clone())
            .await
        {
            Admission::Admitted(permit) => Ok(permit),
            Admission::Superseded => Err(InstanceReport::finished(
                cx.instance.clone(),
                RunState::Cancelled,
                Some("superseded".to_string()),
            )),
            Admission::Cancelled => Err(InstanceReport::finished(
                cx.instance.clone(),
                RunState::Cancelled,
                Some("cancelled while waiting for concurrency group".to_string()),
            )),
        }
    }

    async fn run_job_steps(
        &self,
        cx: &InstanceContext,
        snapshot: ContextSnapshot,
        env: BTreeMap<String, String>,
    ) -> InstanceReport {
        let defaults = cx
            .job
            .defaults
            .as_ref()
            .and_then(|d| d.run.as_ref())
            .or_else(|| cx.workflow.defaults.as_ref().and_then(|d| d.run.as_ref()));

        let frame = StepFrame {
            base: snapshot,
            env,
            shell: defaults.and_then(|d| d.shell.clone()),
            working_directory: defaults.and_then(|d| d.working_directory.clone()),
            depth: cx.depth,
            parent: None,
        };

        // finished steps survive a sequence that overruns the grace period
        let journal = Mutex::new(Vec::new());
        let mut sequence = self.run_steps(cx, &frame, &cx.job.steps, cx.cancel.clone(), Some(&journal));
        let (state, timed_out) = match cx.job.timeout_minutes.map(minutes) {
            None => (sequence.await, false),
            Some(limit) => {
                tokio::select! {
                    state = &mut sequence => (state, false),
                    _ = tokio::time::sleep(limit) => {
                        warn!(instance = %cx.instance, "job timed out; cancelling");
                        cx.cancel.cancel();
                        match tokio::time::timeout(self.config.cancel_grace_period, &mut sequence).await {
                            Ok(state) => (state, true),
                            Err(_) => {
                                warn!(instance = %cx.instance, "steps did not stop within the grace period");
                                let recorded = journal.lock().map(|log| log.clone()).unwrap_or_default();
                                (Sequence::replay(recorded), true)
                            }
                        }
                    }
                }
            }
        };

        let final_snapshot = frame
            .base
            .with_context("steps", Value::Object(state.steps.clone()));
        let outputs = self.job_outputs(cx, &final_snapshot);

        let (run_state, reason) = if timed_out {
            (RunState::Failed, Some("timed out".to_string()))
        } else if cx.cancel.is_cancelled() || state.cancelled {
            (RunState::Cancelled, Some("cancelled".to_string()))
        } else if state.failed {
            (RunState::Failed, state.first_failure.clone())
        } else {
            (RunState::Succeeded, None)
        };

        InstanceReport {
            instance: cx.instance.clone(),
            state: run_state,
            reason,
            steps: state.results,
            outputs,
            failure_tolerated: false,
            duration: Duration::ZERO,
            nested: None,
        }
    }

    /// Evaluate declared job outputs after the last step
    fn job_outputs(&self, cx: &InstanceContext, snapshot: &ContextSnapshot) -> BTreeMap<String, String> {
        let engine = self.engine(snapshot);
        let mut outputs = BTreeMap::new();
        for (name, template) in &cx.job.outputs {
            match engine.interpolate(template) {
                Ok(value) => {
                    outputs.insert(name.clone(), value);
                }
                Err(e) => warn!(instance = %cx.instance, output = %name, error = %e, "job output failed to evaluate"),
            }
        }
        outputs
    }

    fn run_steps<'a>(
        &'a self,
        cx: &'a InstanceContext,
        frame: &'a StepFrame,
        steps: &'a [Step],
        cancel: CancellationToken,
        journal: Option<&'a Mutex<Vec<StepResult>>>,
    ) -> BoxFuture<'a, Sequence> {
        Box::pin(async move {
            let mut state = Sequence::default();
            for (index, step) in steps.iter().enumerate() {
                let result = self.run_step(cx, frame, &state, index, step, &cancel).await;
                if let Some(Ok(mut log)) = journal.map(Mutex::lock) {
                    log.push(result.clone());
                }
                state.record(result);
            }
            state
        })
    }

    async fn run_step(
        &self,
        cx: &InstanceContext,
        frame: &StepFrame,
        state: &Sequence,
        index: usize,
        step: &Step,
        cancel: &CancellationToken,
    ) -> StepResult {
        let start = Instant::now();
        let name = frame.step_name(step);
        let event_index = frame.event_index(index);
        let result = StepResult::new(index, step.id.clone(), name.clone());
        let snapshot = frame.snapshot(state, cancel);

        let condition = step.condition.as_deref().unwrap_or("");
        match self.engine(&snapshot).evaluate_condition(condition) {
            Ok(true) => {}
            Ok(false) => {
                let reason = if cancel.is_cancelled() {
                    "job was cancelled".to_string()
                } else if state.failed {
                    "a previous step failed".to_string()
                } else {
                    format!("condition '{}' evaluated to false", condition.trim())
                };
                self.event_tx.send_event(ExecutionEvent::StepSkipped {
                    instance: cx.instance.clone(),
                    step_index: event_index,
                    reason: cx.redactor.redact(&reason),
                });
                return result.conclude(StepConclusion::Skipped);
            }
            Err(e) => {
                return self.fail_step(cx, result, event_index, format!("condition: {}", e), start);
            }
        }

        // step env layers onto the frame env
        let mut env = frame.env.clone();
        {
            let engine = self.engine(&snapshot);
            for (key, template) in &step.env {
                match engine.interpolate(template) {
                    Ok(value) => {
                        env.insert(key.clone(), value);
                    }
                    Err(e) => {
                        return self.fail_step(cx, result, event_index, format!("env.{}: {}", key, e), start)
                    }
                }
            }
        }
        let snapshot = snapshot.with_context("env", Value::from(env.clone()));

        self.event_tx.send_event(ExecutionEvent::StepStarted {
            instance: cx.instance.clone(),
            step_index: event_index,
            step_name: cx.redactor.redact(&name),
        });

        let executed = if let Some(run) = &step.run {
            self.run_script_step(cx, frame, step, run, &name, event_index, &snapshot, env, cancel)
                .await
        } else if let Some(uses) = &step.uses {
            self.run_uses_step(cx, frame, step, uses, &name, event_index, &snapshot, env, cancel)
                .await
        } else {
            Executed::failure("step has neither run nor uses")
        };

        let tolerated = executed.conclusion == StepConclusion::Failure
            && self.toggle(&step.continue_on_error, &snapshot);

        let mut result = result.conclude(executed.conclusion);
        if tolerated {
            result.conclusion = StepConclusion::Success;
        }
        result.exit_code = executed.exit_code;
        result.outputs = executed.outputs;
        result.error = executed.error.map(|e| cx.redactor.redact(&e));
        result.steps = executed.steps;
        result.duration = start.elapsed();

        if let Some(error) = &result.error {
            debug!(instance = %cx.instance, step = %name, %error, "step did not succeed");
        }
        self.event_tx.send_event(ExecutionEvent::StepCompleted {
            instance: cx.instance.clone(),
            step_index: event_index,
            outcome: result.conclusion,
            duration: result.duration,
            exit_code: result.exit_code,
        });
        result
    }

    fn fail_step(
        &self,
        cx: &InstanceContext,
        result: StepResult,
        event_index: usize,
        error: String,
        start: Instant,
    ) -> StepResult {
        let error = cx.redactor.redact(&error);
        self.event_tx.send_event(ExecutionEvent::error(
            format!("{}: {}", result.name, error),
            Some(cx.instance.clone()),
        ));
        let mut result = result.conclude(StepConclusion::Failure);
        result.error = Some(error);
        result.duration = start.elapsed();
        self.event_tx.send_event(ExecutionEvent::StepCompleted {
            instance: cx.instance.clone(),
            step_index: event_index,
            outcome: StepConclusion::Failure,
            duration: result.duration,
            exit_code: None,
        });
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_script_step(
        &self,
        cx: &InstanceContext,
        frame: &StepFrame,
        step: &Step,
        run: &str,
        name: &str,
        event_index: usize,
        snapshot: &ContextSnapshot,
        env: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Executed {
        let script = match self.engine(snapshot).interpolate(run) {
            Ok(script) => script,
            Err(e) => return Executed::failure(format!("run: {}", e)),
        };
        let shell = step
            .shell
            .clone()
            .or_else(|| frame.shell.clone())
            .unwrap_or_else(|| self.config.default_shell.clone());

        let request = StepRequest {
            instance: cx.instance.clone(),
            step_index: event_index,
            step_name: name.to_string(),
            command: StepCommand::Script {
                script,
                shell: Some(shell),
            },
            working_dir: self.step_dir(frame, step),
            env,
            timeout: Some(step.timeout_minutes.map(minutes).unwrap_or(self.config.default_step_timeout)),
            runs_on: self.runs_on(cx, snapshot),
        };
        self.dispatch_step(cx, request, cancel).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_uses_step(
        &self,
        cx: &InstanceContext,
        frame: &StepFrame,
        step: &Step,
        uses: &str,
        name: &str,
        event_index: usize,
        snapshot: &ContextSnapshot,
        env: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Executed {
        let mut with = BTreeMap::new();
        {
            let engine = self.engine(snapshot);
            for (key, raw) in &step.with {
                let text = scalar_to_string(raw).unwrap_or_else(|| raw.to_string());
                match engine.interpolate(&text) {
                    Ok(value) => {
                        with.insert(key.clone(), value);
                    }
                    Err(e) => return Executed::failure(format!("with.{}: {}", key, e)),
                }
            }
        }

        let action = match self.resolver().resolve_action(uses) {
            Ok(action) => action,
            Err(e) => return Executed::failure(e.to_string()),
        };

        match action {
            Some(action) => {
                self.run_composite(cx, frame, &action, with, name, event_index, snapshot, env, cancel)
                    .await
            }
            None => {
                let request = StepRequest {
                    instance: cx.instance.clone(),
                    step_index: event_index,
                    step_name: name.to_string(),
                    command: StepCommand::Action {
                        uses: uses.to_string(),
                        with,
                    },
                    working_dir: self.step_dir(frame, step),
                    env,
                    timeout: Some(step.timeout_minutes.map(minutes).unwrap_or(self.config.default_step_timeout)),
                    runs_on: self.runs_on(cx, snapshot),
                };
                self.dispatch_step(cx, request, cancel).await
            }
        }
    }

    /// Run a composite action inline with its own `inputs` and `steps`
    #[allow(clippy::too_many_arguments)]
    async fn run_composite(
        &self,
        cx: &InstanceContext,
        frame: &StepFrame,
        action: &CompositeAction,
        with: BTreeMap<String, String>,
        name: &str,
        event_index: usize,
        snapshot: &ContextSnapshot,
        env: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Executed {
        let depth = frame.depth + 1;
        if depth > self.config.max_nesting_depth {
            return Executed::failure(DefinitionError::NestingTooDeep { depth }.to_string());
        }

        let mut inputs: BTreeMap<String, Value> = with
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();
        {
            let engine = self.engine(snapshot);
            for (input, declared) in &action.inputs {
                if inputs.contains_key(input) {
                    continue;
                }
                let value = match &declared.default {
                    Some(default) => {
                        let text = scalar_to_string(default).unwrap_or_else(|| default.to_string());
                        match engine.expand(&text) {
                            Ok(value) => value,
                            Err(e) => return Executed::failure(format!("inputs.{}: {}", input, e)),
                        }
                    }
                    None if declared.required => {
                        return Executed::failure(format!("required input '{}' was not supplied", input))
                    }
                    None => Value::from(""),
                };
                inputs.insert(input.clone(), value);
            }
        }

        debug!(instance = %cx.instance, action = action.name.as_deref().unwrap_or(name), depth, "entering composite action");
        let child = StepFrame {
            base: snapshot.with_context("inputs", Value::Object(inputs)),
            env,
            shell: None,
            working_directory: frame.working_directory.clone(),
            depth,
            parent: Some((event_index, name.to_string())),
        };
        let nested = self.run_steps(cx, &child, &action.runs.steps, cancel.clone(), None).await;

        let out_snapshot = child
            .base
            .with_context("steps", Value::Object(nested.steps.clone()));
        let mut outputs = BTreeMap::new();
        {
            let engine = self.engine(&out_snapshot);
            for (output, declared) in &action.outputs {
                match engine.interpolate(&declared.value) {
                    Ok(value) => {
                        outputs.insert(output.clone(), value);
                    }
                    Err(e) => warn!(instance = %cx.instance, output = %output, error = %e, "action output failed to evaluate"),
                }
            }
        }

        let (conclusion, error) = if nested.cancelled {
            (StepConclusion::Cancelled, None)
        } else if nested.failed {
            (StepConclusion::Failure, nested.first_failure.clone())
        } else {
            (StepConclusion::Success, None)
        };

        Executed {
            conclusion,
            exit_code: None,
            outputs,
            error,
            steps: nested.results,
        }
    }

    /// Hand a step to the runner, honouring timeout and cancellation
    async fn dispatch_step(
        &self,
        cx: &InstanceContext,
        mut request: StepRequest,
        cancel: &CancellationToken,
    ) -> Executed {
        let mut limit = request.timeout.unwrap_or(self.config.default_step_timeout);

        // steps that run after cancellation get a fresh signal, bounded by the grace period
        let token = if cancel.is_cancelled() {
            limit = limit.min(self.config.cancel_grace_period);
            CancellationToken::new()
        } else {
            cancel.child_token()
        };
        request.timeout = Some(limit);

        let instance = request.instance.clone();
        let step_index = request.step_index;
        debug!(instance = %instance, step = step_index, name = %request.step_name, "dispatching step");

        let outcome = match tokio::time::timeout(limit, self.runner.run_step(request, token)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Executed::failure(e.to_string()),
            Err(_) => return Executed::failure(format!("timed out after {:?}", limit)),
        };

        for line in &outcome.logs {
            self.event_tx.send_event(ExecutionEvent::step_output(
                instance.clone(),
                step_index,
                cx.redactor.redact(&line.text),
                line.is_error,
            ));
        }

        let (conclusion, error) = if outcome.cancelled {
            (StepConclusion::Cancelled, None)
        } else if outcome.timed_out {
            (StepConclusion::Failure, Some(format!("timed out after {:?}", limit)))
        } else if outcome.is_success() {
            (StepConclusion::Success, None)
        } else {
            let code = outcome
                .exit_code
                .map_or_else(|| "no exit code".to_string(), |c| format!("exit code {}", c));
            (StepConclusion::Failure, Some(code))
        };

        Executed {
            conclusion,
            exit_code: outcome.exit_code,
            outputs: outcome.outputs,
            error,
            steps: Vec::new(),
        }
    }

    fn step_dir(&self, frame: &StepFrame, step: &Step) -> PathBuf {
        let root = &self.config.working_dir;
        match step.working_directory.as_ref().or(frame.working_directory.as_ref()) {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => root.join(dir),
            None => root.clone(),
        }
    }

    fn runs_on(&self, cx: &InstanceContext, snapshot: &ContextSnapshot) -> Option<String> {
        let engine = self.engine(snapshot);
        let label = |raw: &serde_json::Value| {
            scalar_to_string(raw).and_then(|text| engine.interpolate(&text).ok())
        };
        match cx.job.runs_on.as_ref()? {
            serde_json::Value::Array(items) => {
                let labels: Vec<String> = items.iter().filter_map(label).collect();
                Some(labels.join(","))
            }
            other => label(other),
        }
    }
}

/// What came back from running one step's body
struct Executed {
    conclusion: StepConclusion,
    exit_code: Option<i32>,
    outputs: BTreeMap<String, String>,
    error: Option<String>,
    steps: Vec<StepResult>,
}

impl Executed {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            conclusion: StepConclusion::Failure,
            exit_code: None,
            outputs: BTreeMap::new(),
            error: Some(error.into()),
            steps: Vec::new(),
        }
    }
}

/// `timeout-minutes` as a duration; values too large to represent saturate
fn minutes(value: f64) -> Duration {
    Duration::try_from_secs_f64((value * 60.0).max(0.0)).unwrap_or(Duration::MAX)
}
