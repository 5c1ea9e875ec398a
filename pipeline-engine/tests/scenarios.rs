// End-to-end scenarios
// Drives whole runs through the executor with a scripted step runner

use pipeline_engine::error::{DefinitionError, EvaluationError, ExecutionError, GraphError};
use pipeline_engine::execution::{
    ContextSnapshot, ExecutionPlan, InstanceId, MatrixExpander, MatrixPlan, PipelineExecutor,
    PlannedMatrix, RunReport, RunRequest, RunState,
};
use pipeline_engine::expression::{ExpressionEngine, Value};
use pipeline_engine::runners::{StepCommand, StepOutcome, StepRequest, StepRunner};
use pipeline_engine::trigger::ActivationSeed;
use pipeline_engine::workflow::{Workflow, WorkflowParser};
use pipeline_engine::ConcurrencyManager;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Runs scripts by their first word:
/// `fail` exits 1, `wait` blocks until cancelled, `out=<x>` sets output `out`
#[derive(Default)]
struct ScriptedRunner {
    calls: Mutex<Vec<InstanceId>>,
    waiting: Notify,
}

#[async_trait::async_trait]
impl StepRunner for ScriptedRunner {
    async fn run_step(
        &self,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, ExecutionError> {
        self.calls.lock().unwrap().push(request.instance.clone());
        let StepCommand::Script { script, .. } = &request.command else {
            return Ok(StepOutcome::success());
        };
        if script.starts_with("fail") {
            return Ok(StepOutcome::failure(1));
        }
        if script.starts_with("wait") {
            self.waiting.notify_one();
            cancel.cancelled().await;
            return Ok(StepOutcome {
                cancelled: true,
                ..StepOutcome::default()
            });
        }
        let mut outcome = StepOutcome::success();
        if let Some(value) = script.strip_prefix("out=") {
            outcome = outcome.with_output("out", value);
        }
        Ok(outcome)
    }
}

fn push_seed() -> ActivationSeed {
    ActivationSeed {
        event_name: "push".to_string(),
        payload: serde_json::json!({ "ref": "refs/heads/main" }),
        inputs: BTreeMap::new(),
    }
}

fn parse(yaml: &str) -> Workflow {
    WorkflowParser::parse_str(yaml).unwrap()
}

async fn run(yaml: &str) -> (RunReport, Arc<ScriptedRunner>) {
    let runner = Arc::new(ScriptedRunner::default());
    let executor = PipelineExecutor::with_runner(runner.clone());
    let report = executor.execute(RunRequest::new(parse(yaml), push_seed())).await;
    (report, runner)
}

fn reached(report: &RunReport, id: &str, state: RunState) -> bool {
    report
        .transitions
        .iter()
        .any(|t| t.instance.to_string() == id && t.to == state)
}

#[test]
fn test_scenario_a_matrix_exclude() {
    let tree = serde_json::json!({
        "os": ["a", "b"],
        "v": [1, 2],
        "exclude": [{ "os": "a", "v": 1 }]
    });
    let MatrixPlan::Static(rows) = MatrixExpander::plan(Some(&tree)).unwrap() else {
        panic!("expected a static matrix");
    };
    let keys: Vec<String> = rows.iter().map(|r| r.key()).collect();
    assert_eq!(keys, vec!["b, 1", "a, 2", "b, 2"]);
}

#[tokio::test]
async fn test_scenario_a_instances_run_in_expansion_order() {
    let (report, _) = run(
        r#"
on: push
jobs:
  test:
    strategy:
      matrix:
        os: [a, b]
        v: [1, 2]
        exclude:
          - os: a
            v: 1
    steps:
      - run: echo ${{ matrix.os }}${{ matrix.v }}
"#,
    )
    .await;

    assert!(report.is_success());
    let ids: Vec<String> = report
        .job_instances("test")
        .map(|i| i.instance.to_string())
        .collect();
    assert_eq!(ids, vec!["test (b, 1)", "test (a, 2)", "test (b, 2)"]);
}

#[tokio::test]
async fn test_scenario_b_failure_skips_dependent_and_runs_failure_handler() {
    let (report, _) = run(
        r#"
on: push
jobs:
  y:
    steps:
      - run: fail
  x:
    needs: [y]
    steps:
      - run: echo never
  z:
    needs: [y]
    if: failure()
    steps:
      - run: echo cleanup
"#,
    )
    .await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.state_of("y"), Some(RunState::Failed));
    assert_eq!(report.state_of("x"), Some(RunState::Skipped));
    assert!(reached(&report, "z", RunState::Running));
    assert_eq!(report.state_of("z"), Some(RunState::Succeeded));

    let skip = report
        .transitions
        .iter()
        .find(|t| t.instance == InstanceId::job("x") && t.to == RunState::Skipped)
        .unwrap();
    assert!(skip.reason.is_some());
}

#[tokio::test]
async fn test_scenario_c_cancel_in_progress_preempts_holder() {
    let runner = Arc::new(ScriptedRunner::default());
    let manager = ConcurrencyManager::new();
    let executor = PipelineExecutor::with_runner(runner.clone()).with_concurrency(manager.clone());

    let first = parse(
        r#"
on: push
concurrency:
  group: g
  cancel-in-progress: true
jobs:
  long:
    steps:
      - run: wait for it
  other:
    steps:
      - run: wait as well
"#,
    );
    let second = parse(
        r#"
on: push
concurrency:
  group: g
  cancel-in-progress: true
jobs:
  quick:
    steps:
      - run: out=done
"#,
    );

    let run1 = {
        let executor = executor.clone();
        let request = RunRequest::new(first, push_seed()).with_run_id("run-1");
        tokio::spawn(async move { executor.execute(request).await })
    };
    tokio::time::timeout(Duration::from_secs(5), runner.waiting.notified())
        .await
        .expect("first run should start a step");
    assert_eq!(manager.holder("g").as_deref(), Some("run-1"));

    let run2 = executor
        .execute(RunRequest::new(second, push_seed()).with_run_id("run-2"))
        .await;
    let run1 = run1.await.unwrap();

    assert_eq!(run1.state, RunState::Cancelled);
    assert!(!run1.instances.is_empty());
    assert!(run1.instances.iter().all(|i| i.state == RunState::Cancelled));

    assert_eq!(run2.state, RunState::Succeeded);
    assert_eq!(run2.jobs.len(), 1);
    assert_eq!(manager.holder("g"), None);
}

#[test]
fn test_scenario_d_format() {
    let snapshot = ContextSnapshot::default();
    let engine = ExpressionEngine::new(&snapshot);

    assert_eq!(
        engine.evaluate("format('img-{0}:{1}', 'x', 'y')").unwrap(),
        Value::String("img-x:y".to_string())
    );
    assert!(matches!(
        engine.evaluate("format('img-{0}', )"),
        Err(EvaluationError::ArityMismatch { .. })
    ));
}

#[test]
fn test_scenario_e_skipped_job_outputs() {
    let mut build = BTreeMap::new();
    build.insert("result".to_string(), Value::from("skipped"));
    build.insert("outputs".to_string(), Value::Object(BTreeMap::new()));
    let mut needs = BTreeMap::new();
    needs.insert("build".to_string(), Value::Object(build));
    let mut contexts = BTreeMap::new();
    contexts.insert("needs".to_string(), Value::Object(needs));

    let snapshot = ContextSnapshot::new(contexts);
    let engine = ExpressionEngine::new(&snapshot);

    assert_eq!(
        engine.evaluate("needs.build.outputs.version").unwrap(),
        Value::Null
    );
    assert!(matches!(
        engine.interpolate_required("deploy-${{ needs.build.outputs.version }}"),
        Err(EvaluationError::UndefinedReference { .. })
    ));
}

#[tokio::test]
async fn test_scenario_e_in_a_run() {
    let (report, _) = run(
        r#"
on: push
jobs:
  build:
    if: false
    outputs:
      version: ${{ steps.v.outputs.out }}
    steps:
      - id: v
        run: out=1.0
  report:
    needs: build
    if: always()
    steps:
      - id: show
        run: out=[${{ needs.build.outputs.version }}]
  deploy:
    needs: build
    if: always()
    concurrency:
      group: deploy-${{ needs.build.outputs.version }}
    steps:
      - run: echo deploying
"#,
    )
    .await;

    assert_eq!(report.state_of("build"), Some(RunState::Skipped));
    let shown = report.instance("report").unwrap();
    assert_eq!(shown.steps[0].outputs["out"], "[]");

    let deploy = report.instance("deploy").unwrap();
    assert_eq!(deploy.state, RunState::Failed);
    assert!(deploy.reason.as_ref().unwrap().contains("undefined reference"));
}

#[test]
fn test_matrix_expansion_is_deterministic() {
    let yaml = r#"
on: push
jobs:
  test:
    strategy:
      matrix:
        os: [linux, mac, windows]
        rust: [stable, beta]
        include:
          - os: linux
            rust: nightly
          - os: linux
            experimental: true
        exclude:
          - os: mac
            rust: beta
    steps:
      - run: echo
"#;
    let first = ExecutionPlan::build(&parse(yaml)).unwrap();
    for _ in 0..10 {
        assert_eq!(ExecutionPlan::build(&parse(yaml)).unwrap(), first);
    }
    let PlannedMatrix::Instances(ids) = &first.job("test").unwrap().matrix else {
        panic!("expected static instances");
    };
    let unique: BTreeSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
}

#[test]
fn test_cycles_rejected_at_load() {
    for cycle in [
        "on: push\njobs:\n  a:\n    needs: a\n    steps:\n      - run: x\n",
        "on: push\njobs:\n  a:\n    needs: b\n    steps:\n      - run: x\n  b:\n    needs: a\n    steps:\n      - run: x\n",
        "on: push\njobs:\n  a:\n    needs: c\n    steps:\n      - run: x\n  b:\n    needs: a\n    steps:\n      - run: x\n  c:\n    needs: b\n    steps:\n      - run: x\n",
    ] {
        let err = WorkflowParser::parse_str(cycle).unwrap_err();
        assert!(
            matches!(err, DefinitionError::Graph(GraphError::CycleDetected { .. })),
            "{:?}",
            err
        );
    }
}

#[tokio::test]
async fn test_cycle_never_reaches_running() {
    let mut workflow = parse(
        "on: push\njobs:\n  a:\n    steps:\n      - run: x\n  b:\n    needs: a\n    steps:\n      - run: x\n",
    );
    // introduce the cycle after load
    workflow.jobs[0].1.needs = vec!["b".to_string()];

    let runner = Arc::new(ScriptedRunner::default());
    let executor = PipelineExecutor::with_runner(runner.clone());
    let report = executor.execute(RunRequest::new(workflow, push_seed())).await;

    assert_eq!(report.state, RunState::Failed);
    assert!(report.transitions.iter().all(|t| t.to != RunState::Running));
    assert!(runner.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failure_skips_exactly_transitive_dependents() {
    let (report, runner) = run(
        r#"
on: push
jobs:
  a:
    steps:
      - run: fail
  b:
    needs: a
    steps:
      - run: echo b
  c:
    needs: b
    steps:
      - run: echo c
  d:
    needs: a
    if: always()
    steps:
      - run: echo d
  e:
    steps:
      - run: echo e
  f:
    needs: [e, d]
    steps:
      - run: echo f
"#,
    )
    .await;

    let skipped: BTreeSet<String> = report
        .instances
        .iter()
        .filter(|i| i.state == RunState::Skipped)
        .map(|i| i.instance.to_string())
        .collect();
    assert_eq!(
        skipped,
        BTreeSet::from(["b".to_string(), "c".to_string(), "f".to_string()])
    );

    for id in ["d", "e"] {
        assert_eq!(report.state_of(id), Some(RunState::Succeeded), "{}", id);
    }
    let ran: BTreeSet<String> = runner
        .calls
        .lock()
        .unwrap()
        .iter()
        .map(|i| i.to_string())
        .collect();
    assert!(!ran.contains("b") && !ran.contains("c") && !ran.contains("f"));
}

#[tokio::test]
async fn test_failure_propagates_past_always_job() {
    let (report, runner) = run(
        r#"
on: push
jobs:
  build:
    steps:
      - run: fail
  cleanup:
    needs: build
    if: always()
    steps:
      - run: echo cleanup
  deploy:
    needs: cleanup
    steps:
      - run: echo deploy
  announce:
    needs: deploy
    steps:
      - run: echo announce
"#,
    )
    .await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.state_of("cleanup"), Some(RunState::Succeeded));
    assert_eq!(report.state_of("deploy"), Some(RunState::Skipped));
    assert_eq!(report.state_of("announce"), Some(RunState::Skipped));

    let reason = report.instance("deploy").unwrap().reason.clone().unwrap();
    assert!(reason.contains("build"), "{}", reason);
    let ran: Vec<String> = runner
        .calls
        .lock()
        .unwrap()
        .iter()
        .map(|i| i.to_string())
        .collect();
    assert!(!ran.iter().any(|id| id == "deploy" || id == "announce"));
}

#[tokio::test]
async fn test_failure_handler_sees_indirect_failure() {
    let (report, _) = run(
        r#"
on: push
jobs:
  build:
    steps:
      - run: fail
  package:
    needs: build
    steps:
      - run: echo package
  notify:
    needs: package
    if: failure()
    steps:
      - run: echo notify
  tidy:
    needs: package
    if: success()
    steps:
      - run: echo tidy
"#,
    )
    .await;

    assert_eq!(report.state_of("package"), Some(RunState::Skipped));
    assert_eq!(report.state_of("notify"), Some(RunState::Succeeded));
    assert_eq!(report.state_of("tidy"), Some(RunState::Skipped));
}

#[test]
fn test_evaluation_is_idempotent() {
    let mut contexts = BTreeMap::new();
    contexts.insert(
        "github".to_string(),
        Value::from(&serde_json::json!({ "ref": "refs/heads/main", "event_name": "push" })),
    );
    let snapshot = ContextSnapshot::new(contexts);
    let engine = ExpressionEngine::new(&snapshot);

    for expr in [
        "github.ref == 'refs/heads/main' && 'deploy' || 'skip'",
        "fromJSON('{\"a\":[1,2,3]}').a",
        "format('{0}-{1}', github.event_name, toJSON(github.ref))",
        "github.missing.deeper",
    ] {
        let first = engine.evaluate(expr).unwrap();
        let second = engine.evaluate(expr).unwrap();
        assert_eq!(first, second, "{}", expr);
        assert_eq!(ExpressionEngine::new(&snapshot).evaluate(expr).unwrap(), first);
    }
}
