// Pipeline Executor
// Walks the job graph for one run: admission, dispatch, failure propagation and cancellation

use crate::error::DefinitionError;
use crate::execution::concurrency::{Admission, ConcurrencyManager, ConcurrencyPermit};
use crate::execution::context::{ContextSnapshot, ContextStore, JobContext, Redactor};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::ExecutionGraph;
use crate::execution::job::{InstanceContext, InstanceReport};
use crate::execution::matrix::{MatrixExpander, MatrixInstance, MatrixPlan};
use crate::execution::state::{InstanceId, JobResult, RunState, StateTable, Transition};
use crate::execution::subpipeline::{FsResolver, WorkflowResolver};
use crate::expression::{strip_delimiters, ExprParser, ExpressionEngine, FileHasher, Value};
use crate::runners::StepRunner;
use crate::trigger::ActivationSeed;
use crate::workflow::{Concurrency, Job, Toggle, Workflow};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Configuration for pipeline execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum concurrently running instances in one run (0 = unlimited)
    pub max_parallel: usize,
    /// Step timeout when a step declares none
    pub default_step_timeout: Duration,
    /// How long running work may take to stop after cancellation
    pub cancel_grace_period: Duration,
    /// Workspace directory steps run in
    pub working_dir: PathBuf,
    /// Limit for reusable workflow and composite action nesting
    pub max_nesting_depth: usize,
    /// Shell used when neither step nor defaults name one
    pub default_shell: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 0,
            default_step_timeout: Duration::from_secs(360 * 60),
            cancel_grace_period: Duration::from_secs(10),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            max_nesting_depth: 10,
            default_shell: "bash".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn with_cancel_grace_period(mut self, grace: Duration) -> Self {
        self.cancel_grace_period = grace;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    pub fn with_default_shell(mut self, shell: impl Into<String>) -> Self {
        self.default_shell = shell.into();
        self
    }
}

/// Everything needed to start one pipeline run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub workflow: Arc<Workflow>,
    pub seed: ActivationSeed,
    pub secrets: BTreeMap<String, String>,
    pub vars: BTreeMap<String, String>,
    /// Cancelling this token cancels the run
    pub cancel: CancellationToken,
    pub run_id: String,
}

impl RunRequest {
    pub fn new(workflow: impl Into<Arc<Workflow>>, seed: ActivationSeed) -> Self {
        Self {
            workflow: workflow.into(),
            seed,
            secrets: BTreeMap::new(),
            vars: BTreeMap::new(),
            cancel: CancellationToken::new(),
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_secrets(mut self, secrets: BTreeMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }
}

/// Result of a pipeline run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub workflow: String,
    pub state: RunState,
    /// Why the run ended the way it did, when not obvious from its jobs
    pub reason: Option<String>,
    /// Every instance in the order it was planned
    pub instances: Vec<InstanceReport>,
    pub transitions: Vec<Transition>,
    /// Final per-job results
    pub jobs: BTreeMap<String, JobContext>,
    /// Declared `workflow_call` outputs
    pub outputs: BTreeMap<String, String>,
    pub duration: Duration,
}

impl RunReport {
    /// Look up an instance by its display identity, e.g. `build (linux)`
    pub fn instance(&self, id: &str) -> Option<&InstanceReport> {
        self.instances
            .iter()
            .find(|report| report.instance.to_string() == id)
    }

    pub fn state_of(&self, id: &str) -> Option<RunState> {
        self.instance(id).map(|report| report.state)
    }

    /// Instances of one job
    pub fn job_instances<'a>(&'a self, job: &'a str) -> impl Iterator<Item = &'a InstanceReport> {
        self.instances
            .iter()
            .filter(move |report| report.instance.job == job)
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Succeeded
    }

    /// Process exit code for this run: 0 succeeded, 3 cancelled, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        match self.state {
            RunState::Succeeded => 0,
            RunState::Cancelled => 3,
            _ => 1,
        }
    }
}

/// Pipeline executor
#[derive(Clone)]
pub struct PipelineExecutor {
    pub(super) runner: Arc<dyn StepRunner>,
    pub(super) resolver: Option<Arc<dyn WorkflowResolver>>,
    pub(super) config: Arc<ExecutorConfig>,
    pub(super) event_tx: Option<ProgressSender>,
    pub(super) concurrency: ConcurrencyManager,
    pub(super) hasher: Option<Arc<dyn FileHasher>>,
}

impl PipelineExecutor {
    pub fn new(runner: impl StepRunner + 'static) -> Self {
        Self::with_runner(Arc::new(runner))
    }

    pub fn with_runner(runner: Arc<dyn StepRunner>) -> Self {
        Self {
            runner,
            resolver: None,
            config: Arc::new(ExecutorConfig::default()),
            event_tx: None,
            concurrency: ConcurrencyManager::new(),
            hasher: None,
        }
    }

    /// Set executor configuration
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Resolver for `uses:` references; defaults to the local filesystem
    pub fn with_resolver(mut self, resolver: impl WorkflowResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Share concurrency groups with other executors
    pub fn with_concurrency(mut self, manager: ConcurrencyManager) -> Self {
        self.concurrency = manager;
        self
    }

    pub fn with_file_hasher(mut self, hasher: impl FileHasher + 'static) -> Self {
        self.hasher = Some(Arc::new(hasher));
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn concurrency(&self) -> &ConcurrencyManager {
        &self.concurrency
    }

    pub(super) fn resolver(&self) -> Arc<dyn WorkflowResolver> {
        match &self.resolver {
            Some(resolver) => resolver.clone(),
            None => Arc::new(FsResolver::new(self.config.working_dir.clone())),
        }
    }

    pub(super) fn engine<'a>(&'a self, snapshot: &'a ContextSnapshot) -> ExpressionEngine<'a> {
        ExpressionEngine::new(snapshot).with_file_hasher(self.hasher.as_deref())
    }

    /// Resolve a flag that may be an expression; evaluation errors count as false
    pub(super) fn toggle(&self, toggle: &Toggle, snapshot: &ContextSnapshot) -> bool {
        match toggle {
            Toggle::Bool(value) => *value,
            Toggle::Expression(source) => match self.engine(snapshot).evaluate(source) {
                Ok(value) => value.is_truthy(),
                Err(e) => {
                    warn!(expression = %source, error = %e, "flag expression failed; treating as false");
                    false
                }
            },
        }
    }

    /// Execute a run to completion
    pub async fn execute(&self, request: RunRequest) -> RunReport {
        self.run_at_depth(request, 0).await
    }

    pub(super) fn run_at_depth(&self, request: RunRequest, depth: usize) -> BoxFuture<'_, RunReport> {
        Box::pin(async move {
            let start = Instant::now();
            let workflow = request.workflow.clone();
            let name = workflow.display_name().to_string();

            let graph = match ExecutionGraph::from_workflow(&workflow) {
                Ok(graph) => graph,
                Err(e) => {
                    let reason = DefinitionError::from(e).to_string();
                    warn!(workflow = %name, %reason, "run rejected");
                    return RunReport {
                        run_id: request.run_id,
                        workflow: name,
                        state: RunState::Failed,
                        reason: Some(reason),
                        instances: Vec::new(),
                        transitions: Vec::new(),
                        jobs: BTreeMap::new(),
                        outputs: BTreeMap::new(),
                        duration: start.elapsed(),
                    };
                }
            };

            let (store, env) = self.initial_store(&request);
            let mut scheduler = Scheduler::new(self, &request, &graph, store, env, depth);

            let _permit = match &workflow.concurrency {
                Some(spec) => match self.admit_run(spec, &request, &scheduler.store).await {
                    Ok(permit) => Some(permit),
                    Err((state, reason)) => {
                        scheduler.finish_unstarted(state, &reason);
                        let report = scheduler.into_report(state, Some(reason), start);
                        self.event_tx.send_event(ExecutionEvent::run_completed(
                            &name,
                            &report.run_id,
                            state,
                            report.duration,
                        ));
                        return report;
                    }
                },
                None => None,
            };

            info!(workflow = %name, run_id = %request.run_id, depth, "pipeline run started");
            self.event_tx.send_event(ExecutionEvent::run_started(
                &name,
                &request.run_id,
                workflow.jobs.len(),
                depth,
            ));

            scheduler.run().await;

            let state = scheduler.terminal_state();
            let report = scheduler.into_report(state, None, start);
            info!(workflow = %name, run_id = %report.run_id, state = %state, "pipeline run finished");
            self.event_tx.send_event(ExecutionEvent::run_completed(
                &name,
                &report.run_id,
                state,
                report.duration,
            ));
            report
        })
    }

    /// Build the run-level contexts and resolve the workflow `env`
    fn initial_store(&self, request: &RunRequest) -> (ContextStore, BTreeMap<String, String>) {
        let mut contexts = BTreeMap::new();
        contexts.insert(
            "github".to_string(),
            request.seed.github_context(&request.run_id),
        );
        contexts.insert(
            "inputs".to_string(),
            Value::from(request.seed.inputs.clone()),
        );
        contexts.insert("vars".to_string(), Value::from(request.vars.clone()));
        contexts.insert("runner".to_string(), self.runner_context());

        let scratch = ContextSnapshot::new(contexts.clone())
            .with_context("secrets", Value::from(request.secrets.clone()));
        let engine = self.engine(&scratch);

        let mut env = BTreeMap::new();
        for (key, template) in &request.workflow.env {
            match engine.interpolate(template) {
                Ok(value) => {
                    env.insert(key.clone(), value);
                }
                Err(e) => warn!(key = %key, error = %e, "workflow env value failed to evaluate"),
            }
        }
        contexts.insert("env".to_string(), Value::from(env.clone()));

        let store = ContextStore::new(contexts, &request.secrets, request.cancel.clone());
        (store, env)
    }

    fn runner_context(&self) -> Value {
        let mut runner = BTreeMap::new();
        runner.insert("os".to_string(), Value::from(std::env::consts::OS));
        runner.insert("arch".to_string(), Value::from(std::env::consts::ARCH));
        runner.insert(
            "temp".to_string(),
            Value::from(std::env::temp_dir().to_string_lossy().into_owned()),
        );
        runner.insert(
            "workspace".to_string(),
            Value::from(self.config.working_dir.to_string_lossy().into_owned()),
        );
        Value::Object(runner)
    }

    /// Wait for the workflow-level concurrency group
    async fn admit_run(
        &self,
        spec: &Concurrency,
        request: &RunRequest,
        store: &ContextStore,
    ) -> Result<ConcurrencyPermit, (RunState, String)> {
        let snapshot = store.snapshot();
        let redactor = store.redactor();

        let group = self
            .engine(&snapshot)
            .interpolate_required(spec.group())
            .map_err(|e| {
                (
                    RunState::Failed,
                    redactor.redact(&format!("concurrency group: {}", e)),
                )
            })?;
        let cancel_in_progress = self.toggle(&spec.cancel_in_progress(), &snapshot);

        if self.concurrency.holder(&group).is_some() {
            self.event_tx.send_event(ExecutionEvent::ConcurrencyWaiting {
                group: redactor.redact(&group),
                run_id: request.run_id.clone(),
            });
        }

        match self
            .concurrency
            .acquire(&group, &request.run_id, cancel_in_progress, request.cancel.clone())
            .await
        {
            Admission::Admitted(permit) => Ok(permit),
            Admission::Superseded => Err((RunState::Cancelled, "superseded".to_string())),
            Admission::Cancelled => Err((
                RunState::Cancelled,
                "cancelled while waiting for concurrency group".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("config", &self.config)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Where a job is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobPhase {
    /// Waiting for its needs
    Waiting,
    /// Instances are runnable or running
    Active,
    /// Result recorded in the context store
    Done,
}

struct PlannedInstance {
    id: InstanceId,
    matrix: Option<MatrixInstance>,
}

struct JobSlot {
    id: String,
    job: Arc<Job>,
    plan: Result<MatrixPlan, String>,
    phase: JobPhase,
    instances: Vec<PlannedInstance>,
    /// Every job this one waits on, directly or not
    upstream: BTreeSet<String>,
    /// Parent of every instance token; fail-fast cancels it
    cancel: CancellationToken,
    running: usize,
}

impl JobSlot {
    fn fail_fast(&self) -> bool {
        self.job.matrix().is_some()
            && self.job.strategy.as_ref().map_or(true, |s| s.fail_fast)
    }

    fn max_parallel(&self) -> Option<usize> {
        self.job
            .strategy
            .as_ref()
            .and_then(|s| s.max_parallel)
            .filter(|n| *n > 0)
    }
}

/// What an instance task hands back to the scheduler
enum Finished {
    Report(InstanceReport),
    /// The task ended without a report: it was aborted or it panicked
    Abandoned(InstanceId),
}

/// Sends a report when the instance task ends, even if it was aborted
struct Completion {
    instance: InstanceId,
    tx: mpsc::UnboundedSender<Finished>,
    sent: bool,
}

impl Completion {
    fn send(mut self, report: InstanceReport) {
        self.sent = true;
        let _ = self.tx.send(Finished::Report(report));
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.tx.send(Finished::Abandoned(self.instance.clone()));
        }
    }
}

/// Single writer of one run's state.
///
/// Instance tasks report back over a channel; every transition happens here.
struct Scheduler<'a> {
    executor: &'a PipelineExecutor,
    request: &'a RunRequest,
    depth: usize,
    store: ContextStore,
    env: Arc<BTreeMap<String, String>>,
    table: StateTable,
    jobs: Vec<JobSlot>,
    order: Vec<InstanceId>,
    reports: HashMap<InstanceId, InstanceReport>,
    queue: VecDeque<(usize, usize)>,
    running: HashMap<InstanceId, AbortHandle>,
    /// Instances aborted after the grace period ran out
    aborted: HashSet<InstanceId>,
    done_tx: mpsc::UnboundedSender<Finished>,
    done_rx: mpsc::UnboundedReceiver<Finished>,
}

impl<'a> Scheduler<'a> {
    fn new(
        executor: &'a PipelineExecutor,
        request: &'a RunRequest,
        graph: &ExecutionGraph,
        store: ContextStore,
        env: BTreeMap<String, String>,
        depth: usize,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let mut scheduler = Self {
            executor,
            request,
            depth,
            store,
            env: Arc::new(env),
            table: StateTable::new(),
            jobs: Vec::new(),
            order: Vec::new(),
            reports: HashMap::new(),
            queue: VecDeque::new(),
            running: HashMap::new(),
            aborted: HashSet::new(),
            done_tx,
            done_rx,
        };

        for node in graph.topological_order() {
            let Some(job) = request.workflow.job(&node.id) else {
                continue;
            };
            let plan = MatrixExpander::plan(job.matrix()).map_err(|e| e.to_string());
            let mut slot = JobSlot {
                id: node.id.clone(),
                job: Arc::new(job.clone()),
                plan,
                phase: JobPhase::Waiting,
                instances: Vec::new(),
                upstream: graph.transitive_needs(&node.id),
                cancel: request.cancel.child_token(),
                running: 0,
            };

            let planned = match &slot.plan {
                Ok(MatrixPlan::Single) => vec![PlannedInstance {
                    id: InstanceId::job(&slot.id),
                    matrix: None,
                }],
                Ok(MatrixPlan::Static(rows)) => instances_for(&slot.id, rows),
                _ => Vec::new(),
            };
            let blocked = !job.needs.is_empty();
            for instance in planned {
                scheduler.add_instance(&mut slot, instance, blocked);
            }
            scheduler.jobs.push(slot);
        }

        scheduler
    }

    fn add_instance(&mut self, slot: &mut JobSlot, instance: PlannedInstance, blocked: bool) {
        self.table.insert(instance.id.clone());
        self.order.push(instance.id.clone());
        if blocked {
            self.transition(&instance.id, RunState::Blocked, None);
        }
        slot.instances.push(instance);
    }

    fn transition(&mut self, instance: &InstanceId, to: RunState, reason: Option<&str>) -> bool {
        let Some(from) = self.table.get(instance) else {
            return false;
        };
        let reason = reason.map(|r| self.store.redactor().redact(r));
        if !self.table.transition(instance, to, reason.clone()) {
            return false;
        }
        self.executor
            .event_tx
            .send_event(ExecutionEvent::transition(instance.clone(), from, to, reason));
        true
    }

    async fn run(&mut self) {
        let grace = self.executor.config.cancel_grace_period;
        let run_cancel = self.request.cancel.clone();
        let mut cancel_seen = false;
        let mut abort_at: Option<tokio::time::Instant> = None;

        loop {
            self.advance();
            self.dispatch();

            if self.running.is_empty() {
                break;
            }

            tokio::select! {
                Some(finished) = self.done_rx.recv() => {
                    let report = self.settle(finished);
                    self.complete(report);
                }
                _ = run_cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    info!(run_id = %self.request.run_id, running = self.running.len(), "run cancelled; stopping running instances");
                    self.cancel_unstarted("run cancelled");
                    abort_at = Some(tokio::time::Instant::now() + grace);
                }
                _ = tokio::time::sleep_until(abort_at.unwrap_or_else(tokio::time::Instant::now)), if abort_at.is_some() => {
                    abort_at = None;
                    for (instance, handle) in &self.running {
                        warn!(%instance, "instance did not stop in time; aborting");
                        handle.abort();
                    }
                    self.aborted.extend(self.running.keys().cloned());
                }
                else => break,
            }
        }

        if self.request.cancel.is_cancelled() {
            self.cancel_unstarted("run cancelled");
        }
    }

    /// Decide every waiting job whose needs have all finished
    fn advance(&mut self) {
        if self.request.cancel.is_cancelled() {
            self.cancel_unstarted("run cancelled");
            return;
        }

        loop {
            let ready = self.jobs.iter().position(|slot| {
                slot.phase == JobPhase::Waiting
                    && slot
                        .job
                        .needs
                        .iter()
                        .all(|need| self.store.job(need).is_some())
            });
            let Some(index) = ready else {
                break;
            };
            self.decide(index);
        }
    }

    /// Evaluate a ready job's condition and make its instances runnable
    fn decide(&mut self, index: usize) {
        let job = self.jobs[index].job.clone();
        let job_id = self.jobs[index].id.clone();
        let upstream = self.jobs[index].upstream.clone();
        let snapshot = self.store.job_snapshot(&job.needs, &upstream);
        let condition = job.condition.as_deref().unwrap_or("");

        let verdict = self
            .executor
            .engine(&snapshot)
            .evaluate_condition(condition);

        match verdict {
            Ok(true) => {}
            Ok(false) => {
                let reason = if !snapshot.status().succeeded && !uses_status_function(condition) {
                    let unmet: Vec<String> = self
                        .store
                        .unsuccessful(&job.needs, &upstream)
                        .cloned()
                        .collect();
                    format!("needs not successful: {}", unmet.join(", "))
                } else {
                    format!("condition '{}' evaluated to false", condition.trim())
                };
                self.finish_job(index, RunState::Skipped, &reason);
                return;
            }
            Err(e) => {
                let reason = format!("condition failed to evaluate: {}", e);
                self.finish_job(index, RunState::Failed, &reason);
                return;
            }
        }

        let plan = self.jobs[index].plan.clone();
        match plan {
            Err(e) => {
                self.finish_job(index, RunState::Failed, &format!("matrix: {}", e));
                return;
            }
            Ok(MatrixPlan::Deferred(tree)) => {
                let expanded = MatrixExpander::expand_deferred(&tree, &self.executor.engine(&snapshot));
                match expanded {
                    Ok(rows) => {
                        let blocked = !job.needs.is_empty();
                        let mut slot = std::mem::replace(&mut self.jobs[index], placeholder_slot());
                        for instance in instances_for(&job_id, &rows) {
                            self.add_instance(&mut slot, instance, blocked);
                        }
                        self.jobs[index] = slot;
                    }
                    Err(e) => {
                        self.finish_job(index, RunState::Failed, &format!("matrix: {}", e));
                        return;
                    }
                }
            }
            Ok(_) => {}
        }

        if self.jobs[index].instances.is_empty() {
            let required = job.strategy.as_ref().is_some_and(|s| s.require_instances);
            if required {
                self.finish_job(index, RunState::Failed, "matrix produced no instances");
            } else {
                debug!(job = %job_id, "matrix produced no instances; vacuous success");
                self.jobs[index].phase = JobPhase::Done;
                self.store.record_job(job_id, JobContext::new(JobResult::Success));
            }
            return;
        }

        self.jobs[index].phase = JobPhase::Active;
        let ids: Vec<InstanceId> = self.jobs[index].instances.iter().map(|i| i.id.clone()).collect();
        for (position, id) in ids.iter().enumerate() {
            if self.transition(id, RunState::Runnable, None) {
                self.queue.push_back((index, position));
            }
        }
    }

    /// Finish a job that never ran, creating a placeholder instance if needed
    fn finish_job(&mut self, index: usize, state: RunState, reason: &str) {
        if self.jobs[index].instances.is_empty() {
            let id = InstanceId::job(&self.jobs[index].id);
            self.table.insert(id.clone());
            self.order.push(id.clone());
            self.jobs[index].instances.push(PlannedInstance { id, matrix: None });
        }

        let ids: Vec<InstanceId> = self.jobs[index].instances.iter().map(|i| i.id.clone()).collect();
        for id in &ids {
            if self.transition(id, state, Some(reason)) {
                self.reports.insert(
                    id.clone(),
                    InstanceReport::finished(id.clone(), state, Some(self.store.redactor().redact(reason))),
                );
            }
        }
        self.queue.retain(|(job, _)| *job != index);
        self.record_if_finished(index);
    }

    /// Launch queued instances while capacity allows
    fn dispatch(&mut self) {
        if self.request.cancel.is_cancelled() {
            return;
        }

        let limit = self.executor.config.max_parallel;
        let mut deferred = VecDeque::new();

        while let Some((index, position)) = self.queue.pop_front() {
            if limit > 0 && self.running.len() >= limit {
                deferred.push_back((index, position));
                break;
            }
            let slot = &self.jobs[index];
            if slot.max_parallel().is_some_and(|max| slot.running >= max) {
                deferred.push_back((index, position));
                continue;
            }
            self.launch(index, position);
        }

        deferred.extend(self.queue.drain(..));
        self.queue = deferred;
    }

    fn launch(&mut self, index: usize, position: usize) {
        let id = self.jobs[index].instances[position].id.clone();
        if !self.transition(&id, RunState::Running, None) {
            return;
        }

        let cx = self.instance_context(index, position);
        self.jobs[index].running += 1;

        let executor = self.executor.clone();
        let completion = Completion {
            instance: id.clone(),
            tx: self.done_tx.clone(),
            sent: false,
        };
        let handle = tokio::spawn(async move {
            let report = executor.run_instance(cx).await;
            completion.send(report);
        });
        self.running.insert(id, handle.abort_handle());
    }

    fn instance_context(&self, index: usize, position: usize) -> InstanceContext {
        let slot = &self.jobs[index];
        let planned = &slot.instances[position];
        let cancel = slot.cancel.child_token();

        let matrix = planned
            .matrix
            .as_ref()
            .map(MatrixInstance::to_context)
            .unwrap_or_else(|| Value::Object(BTreeMap::new()));

        let total = slot.instances.len();
        let mut strategy = BTreeMap::new();
        strategy.insert("fail-fast".to_string(), Value::Bool(slot.fail_fast()));
        strategy.insert("job-index".to_string(), Value::from(position));
        strategy.insert("job-total".to_string(), Value::from(total));
        strategy.insert(
            "max-parallel".to_string(),
            Value::from(slot.max_parallel().unwrap_or(total)),
        );

        let snapshot = self
            .store
            .job_snapshot(&slot.job.needs, &slot.upstream)
            .with_context("matrix", matrix)
            .with_context("strategy", Value::Object(strategy))
            .with_cancellation(cancel.clone());

        InstanceContext {
            instance: planned.id.clone(),
            job_id: slot.id.clone(),
            job: slot.job.clone(),
            workflow: self.request.workflow.clone(),
            snapshot,
            env: self.env.clone(),
            redactor: self.store.redactor().clone(),
            cancel,
            run_id: self.request.run_id.clone(),
            depth: self.depth,
            seed: Arc::new(self.request.seed.clone()),
            secrets: Arc::new(self.request.secrets.clone()),
            vars: Arc::new(self.request.vars.clone()),
        }
    }

    /// Turn a task's message into a report, explaining a missing one
    fn settle(&mut self, finished: Finished) -> InstanceReport {
        match finished {
            Finished::Report(report) => report,
            Finished::Abandoned(id) if self.aborted.remove(&id) => InstanceReport::finished(
                id,
                RunState::Cancelled,
                Some("did not stop within the grace period".to_string()),
            ),
            Finished::Abandoned(id) => {
                error!(instance = %id, "job instance task panicked");
                InstanceReport::failed(&id, "job instance task panicked")
            }
        }
    }

    /// Apply a finished instance's report
    fn complete(&mut self, report: InstanceReport) {
        let id = report.instance.clone();
        self.running.remove(&id);

        let Some(index) = self.jobs.iter().position(|slot| slot.id == id.job) else {
            return;
        };
        self.jobs[index].running = self.jobs[index].running.saturating_sub(1);

        let state = report.state;
        self.transition(&id, state, report.reason.as_deref());
        self.reports.insert(id.clone(), report);

        if state == RunState::Failed && self.jobs[index].fail_fast() {
            let reason = format!("fail-fast: {} failed", id);
            self.cancel_job(index, &reason);
        }

        self.record_if_finished(index);
    }

    /// Cancel a job's not-yet-started instances and signal its running ones
    fn cancel_job(&mut self, index: usize, reason: &str) {
        info!(job = %self.jobs[index].id, reason, "cancelling job instances");
        self.jobs[index].cancel.cancel();

        let ids: Vec<InstanceId> = self.jobs[index].instances.iter().map(|i| i.id.clone()).collect();
        for id in ids {
            let started = self
                .table
                .get(&id)
                .map_or(true, |s| s == RunState::Running || s.is_terminal());
            if !started && self.transition(&id, RunState::Cancelled, Some(reason)) {
                self.reports.insert(
                    id.clone(),
                    InstanceReport::finished(id, RunState::Cancelled, Some(reason.to_string())),
                );
            }
        }
        self.queue.retain(|(job, _)| *job != index);
    }

    /// Cancel everything that has not started, including undecided jobs
    fn cancel_unstarted(&mut self, reason: &str) {
        self.queue.clear();
        for index in 0..self.jobs.len() {
            match self.jobs[index].phase {
                JobPhase::Waiting => self.finish_job(index, RunState::Cancelled, reason),
                JobPhase::Active => {
                    self.cancel_job(index, reason);
                    self.record_if_finished(index);
                }
                JobPhase::Done => {}
            }
        }
    }

    /// Mark every instance of a run that never got admitted
    fn finish_unstarted(&mut self, state: RunState, reason: &str) {
        for index in 0..self.jobs.len() {
            if self.jobs[index].phase == JobPhase::Waiting {
                self.finish_job(index, state, reason);
            }
        }
    }

    /// Record the job's result once all of its instances are terminal
    fn record_if_finished(&mut self, index: usize) {
        let slot = &self.jobs[index];
        if slot.phase == JobPhase::Done {
            return;
        }
        let states: Vec<RunState> = slot
            .instances
            .iter()
            .filter_map(|i| self.table.get(&i.id))
            .collect();
        if states.is_empty() || !states.iter().all(RunState::is_terminal) {
            return;
        }

        let mut outputs = BTreeMap::new();
        let mut tolerated = false;
        for instance in &slot.instances {
            if let Some(report) = self.reports.get(&instance.id) {
                // matrix instances merge in order; later instances win
                outputs.extend(report.outputs.clone());
                tolerated |= report.failure_tolerated;
            }
        }

        let result = JobResult::aggregate(states.iter());
        let id = slot.id.clone();
        debug!(job = %id, result = %result, "job finished");

        self.jobs[index].phase = JobPhase::Done;
        let mut context = JobContext::new(result).with_outputs(outputs);
        context.failure_tolerated = tolerated;
        self.store.record_job(id, context);
    }

    fn terminal_state(&self) -> RunState {
        let states = self.table.states();
        if self.request.cancel.is_cancelled() {
            RunState::Cancelled
        } else if states.values().any(|s| *s == RunState::Failed) {
            RunState::Failed
        } else if states.values().any(|s| *s == RunState::Cancelled) {
            RunState::Cancelled
        } else {
            RunState::Succeeded
        }
    }

    fn into_report(mut self, state: RunState, reason: Option<String>, start: Instant) -> RunReport {
        let outputs = self.call_outputs();
        let redactor: Redactor = self.store.redactor().clone();
        let jobs = self
            .request
            .workflow
            .job_ids()
            .filter_map(|id| self.store.job(id).map(|ctx| (id.to_string(), ctx.clone())))
            .collect();

        let instances = self
            .order
            .iter()
            .map(|id| {
                self.reports.remove(id).unwrap_or_else(|| {
                    let state = self.table.get(id).unwrap_or(RunState::Pending);
                    InstanceReport::finished(id.clone(), state, None)
                })
            })
            .collect();

        RunReport {
            run_id: self.request.run_id.clone(),
            workflow: self.request.workflow.display_name().to_string(),
            state,
            reason: reason.map(|r| redactor.redact(&r)),
            instances,
            transitions: self.table.into_log(),
            jobs,
            outputs,
            duration: start.elapsed(),
        }
    }

    /// Evaluate `on.workflow_call.outputs` against the final snapshot
    fn call_outputs(&self) -> BTreeMap<String, String> {
        let mut outputs = BTreeMap::new();
        let Some(interface) = self.request.workflow.call_interface() else {
            return outputs;
        };

        let snapshot = self.store.snapshot();
        let engine = self.executor.engine(&snapshot);
        for (name, output) in &interface.outputs {
            match engine.interpolate(&output.value) {
                Ok(value) => {
                    outputs.insert(name.clone(), value);
                }
                Err(e) => warn!(output = %name, error = %e, "workflow output failed to evaluate"),
            }
        }
        outputs
    }
}

fn instances_for(job: &str, rows: &[MatrixInstance]) -> Vec<PlannedInstance> {
    rows.iter()
        .map(|row| PlannedInstance {
            id: InstanceId::matrix(job, row.key()),
            matrix: Some(row.clone()),
        })
        .collect()
}

fn placeholder_slot() -> JobSlot {
    JobSlot {
        id: String::new(),
        job: Arc::new(Job::default()),
        plan: Ok(MatrixPlan::Single),
        phase: JobPhase::Done,
        instances: Vec::new(),
        upstream: BTreeSet::new(),
        cancel: CancellationToken::new(),
        running: 0,
    }
}

fn uses_status_function(condition: &str) -> bool {
    ExprParser::parse_str(strip_delimiters(condition))
        .map(|ast| ast.uses_status_function())
        .unwrap_or(false)
}
