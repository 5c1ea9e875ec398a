// Context Store
// Immutable context snapshots, the per-run store that rebuilds them, and secret redaction

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::execution::state::JobResult;
use crate::expression::Value;

/// Inputs to `success()` and `failure()` for the scope being evaluated.
///
/// At job level this folds the job's upstream jobs; at step level the prior steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusScope {
    /// Every predecessor concluded successfully
    pub succeeded: bool,
    /// At least one predecessor failed, including tolerated failures
    pub failed: bool,
}

impl Default for StatusScope {
    fn default() -> Self {
        Self {
            succeeded: true,
            failed: false,
        }
    }
}

/// Immutable view of all named contexts at one point in a run.
///
/// Cloning is cheap. "Changing" a snapshot produces a new one and leaves
/// every existing clone untouched.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    contexts: Arc<BTreeMap<String, Value>>,
    status: StatusScope,
    cancel: Option<CancellationToken>,
}

impl ContextSnapshot {
    pub fn new(contexts: BTreeMap<String, Value>) -> Self {
        Self {
            contexts: Arc::new(contexts),
            status: StatusScope::default(),
            cancel: None,
        }
    }

    /// Look up a context by name, case-insensitively
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.contexts.get(name).or_else(|| {
            self.contexts
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    pub fn contexts(&self) -> &BTreeMap<String, Value> {
        &self.contexts
    }

    /// New snapshot with one context replaced
    pub fn with_context(&self, name: impl Into<String>, value: Value) -> Self {
        let mut contexts = (*self.contexts).clone();
        contexts.insert(name.into(), value);
        Self {
            contexts: Arc::new(contexts),
            status: self.status,
            cancel: self.cancel.clone(),
        }
    }

    pub fn with_status(mut self, status: StatusScope) -> Self {
        self.status = status;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn status(&self) -> StatusScope {
        self.status
    }

    /// Reads the live cancellation signal on every call
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// What a finished job exposes to its dependents
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub result: JobResult,
    pub outputs: BTreeMap<String, String>,
    /// A failure happened but was tolerated by `continue-on-error`
    pub failure_tolerated: bool,
}

impl JobContext {
    pub fn new(result: JobResult) -> Self {
        Self {
            result,
            outputs: BTreeMap::new(),
            failure_tolerated: false,
        }
    }

    pub fn with_outputs(mut self, outputs: BTreeMap<String, String>) -> Self {
        self.outputs = outputs;
        self
    }

    fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("result".to_string(), Value::from(self.result.as_str()));
        map.insert("outputs".to_string(), Value::from(self.outputs.clone()));
        Value::Object(map)
    }
}

/// Sole writer of a run's context snapshots.
///
/// Owned by the scheduler. Every recorded job rebuilds the run-level
/// snapshot; job and step snapshots are derived from it on demand.
#[derive(Debug)]
pub struct ContextStore {
    current: ContextSnapshot,
    jobs: BTreeMap<String, JobContext>,
    redactor: Redactor,
}

impl ContextStore {
    pub fn new(
        contexts: BTreeMap<String, Value>,
        secrets: &BTreeMap<String, String>,
        cancel: CancellationToken,
    ) -> Self {
        let mut contexts = contexts;
        contexts.insert("secrets".to_string(), Value::from(secrets.clone()));
        contexts.insert("jobs".to_string(), Value::Object(BTreeMap::new()));

        Self {
            current: ContextSnapshot::new(contexts).with_cancellation(cancel),
            jobs: BTreeMap::new(),
            redactor: Redactor::new(secrets.values()),
        }
    }

    /// Run-level snapshot reflecting every job recorded so far
    pub fn snapshot(&self) -> ContextSnapshot {
        self.current.clone()
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn job(&self, id: &str) -> Option<&JobContext> {
        self.jobs.get(id)
    }

    /// Record a finished job and rebuild the run snapshot
    pub fn record_job(&mut self, id: impl Into<String>, context: JobContext) {
        self.jobs.insert(id.into(), context);

        let jobs = self
            .jobs
            .iter()
            .map(|(id, ctx)| (id.clone(), ctx.to_value()))
            .collect();
        self.current = self.current.with_context("jobs", Value::Object(jobs));
    }

    /// Snapshot for evaluating a job: exposes only its direct needs, but
    /// folds the results of every upstream job into the status scope.
    ///
    /// `upstream` holds the job's transitive needs. Beyond the direct needs
    /// only failed and cancelled jobs count; a skipped ancestor already
    /// decided the fate of the job between it and this one.
    pub fn job_snapshot(&self, needs: &[String], upstream: &BTreeSet<String>) -> ContextSnapshot {
        let mut needs_ctx = BTreeMap::new();
        let mut status = StatusScope::default();

        for need in needs {
            match self.jobs.get(need) {
                Some(ctx) => {
                    if ctx.result != JobResult::Success {
                        status.succeeded = false;
                    }
                    if ctx.result == JobResult::Failure || ctx.failure_tolerated {
                        status.failed = true;
                    }
                    needs_ctx.insert(need.clone(), ctx.to_value());
                }
                None => status.succeeded = false,
            }
        }

        for ancestor in upstream.iter().filter(|id| !needs.contains(*id)) {
            let Some(ctx) = self.jobs.get(ancestor) else {
                continue;
            };
            match ctx.result {
                JobResult::Failure => {
                    status.succeeded = false;
                    status.failed = true;
                }
                JobResult::Cancelled => status.succeeded = false,
                _ if ctx.failure_tolerated => status.failed = true,
                _ => {}
            }
        }

        self.current
            .with_context("needs", Value::Object(needs_ctx))
            .with_status(status)
    }

    /// Upstream jobs that did not succeed, direct needs first
    pub fn unsuccessful<'a>(
        &'a self,
        needs: &'a [String],
        upstream: &'a BTreeSet<String>,
    ) -> impl Iterator<Item = &'a String> + 'a {
        let direct = needs
            .iter()
            .filter(move |need| self.jobs.get(*need).is_some_and(|ctx| ctx.result != JobResult::Success));
        let indirect = upstream.iter().filter(move |id| {
            !needs.contains(*id)
                && self
                    .jobs
                    .get(*id)
                    .is_some_and(|ctx| matches!(ctx.result, JobResult::Failure | JobResult::Cancelled))
        });
        direct.chain(indirect)
    }
}

/// Masks secret values in any text leaving the engine
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

pub const MASK: &str = "***";

impl Redactor {
    pub fn new<'a>(values: impl IntoIterator<Item = &'a String>) -> Self {
        let mut secrets: Vec<String> = values
            .into_iter()
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .collect();
        // longest first so a secret containing another is masked whole
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();
        for secret in &self.secrets {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), MASK);
            }
        }
        result
    }

    /// Merge another redactor's secrets into this one
    pub fn extend(&mut self, other: &Redactor) {
        let merged: Vec<String> = self.secrets.iter().chain(&other.secrets).cloned().collect();
        *self = Redactor::new(merged.iter());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ContextStore {
        let mut contexts = BTreeMap::new();
        contexts.insert(
            "github".to_string(),
            Value::from(serde_json::json!({"ref": "refs/heads/main"})),
        );
        let mut secrets = BTreeMap::new();
        secrets.insert("TOKEN".to_string(), "s3cr3t-value".to_string());
        ContextStore::new(contexts, &secrets, CancellationToken::new())
    }

    #[test]
    fn test_snapshots_are_immutable() {
        let mut store = store();
        let before = store.snapshot();

        store.record_job(
            "build",
            JobContext::new(JobResult::Success).with_outputs(BTreeMap::from([(
                "version".to_string(),
                "1.0".to_string(),
            )])),
        );
        let after = store.snapshot();

        assert_eq!(before.get("jobs"), Some(&Value::Object(BTreeMap::new())));
        assert_eq!(
            after
                .get("jobs")
                .and_then(|j| j.property("build"))
                .and_then(|b| b.property("outputs"))
                .and_then(|o| o.property("version")),
            Some(&Value::from("1.0"))
        );
    }

    #[test]
    fn test_job_snapshot_only_exposes_direct_needs() {
        let mut store = store();
        store.record_job("a", JobContext::new(JobResult::Success));
        store.record_job("b", JobContext::new(JobResult::Success));

        let snap = store.job_snapshot(&["a".to_string()], &BTreeSet::new());
        let needs = snap.get("needs").and_then(Value::as_object).unwrap();
        assert!(needs.contains_key("a"));
        assert!(!needs.contains_key("b"));
        assert!(snap.status().succeeded);
        assert!(!snap.status().failed);
    }

    #[test]
    fn test_job_snapshot_status_scope() {
        let mut store = store();
        store.record_job("ok", JobContext::new(JobResult::Success));
        store.record_job("bad", JobContext::new(JobResult::Failure));
        store.record_job("skipped", JobContext::new(JobResult::Skipped));
        let mut tolerated = JobContext::new(JobResult::Success);
        tolerated.failure_tolerated = true;
        store.record_job("tolerated", tolerated);

        let failed = store.job_snapshot(&["ok".to_string(), "bad".to_string()], &BTreeSet::new());
        assert!(!failed.status().succeeded);
        assert!(failed.status().failed);

        let skipped = store.job_snapshot(&["skipped".to_string()], &BTreeSet::new());
        assert!(!skipped.status().succeeded);
        assert!(!skipped.status().failed);

        let soft = store.job_snapshot(&["tolerated".to_string()], &BTreeSet::new());
        assert!(soft.status().succeeded);
        assert!(soft.status().failed);
    }

    #[test]
    fn test_job_snapshot_folds_upstream_failures() {
        let mut store = store();
        store.record_job("build", JobContext::new(JobResult::Failure));
        store.record_job("lint", JobContext::new(JobResult::Skipped));
        store.record_job("cleanup", JobContext::new(JobResult::Success));

        let needs = vec!["cleanup".to_string()];
        let upstream = BTreeSet::from(["build".to_string(), "cleanup".to_string()]);
        let snap = store.job_snapshot(&needs, &upstream);
        assert!(!snap.status().succeeded);
        assert!(snap.status().failed);

        // only the direct need is visible through `needs`
        let ctx = snap.get("needs").and_then(Value::as_object).unwrap();
        assert_eq!(ctx.keys().collect::<Vec<_>>(), vec!["cleanup"]);
        assert_eq!(
            store.unsuccessful(&needs, &upstream).collect::<Vec<_>>(),
            vec!["build"]
        );

        // a skipped ancestor behind a successful need does not count
        let upstream = BTreeSet::from(["lint".to_string(), "cleanup".to_string()]);
        let snap = store.job_snapshot(&needs, &upstream);
        assert!(snap.status().succeeded);
        assert!(!snap.status().failed);
    }

    #[test]
    fn test_context_lookup_case_insensitive() {
        let store = store();
        let snap = store.snapshot();
        assert!(snap.get("GitHub").is_some());
        assert_eq!(
            snap.get("secrets").and_then(|s| s.property("TOKEN")),
            Some(&Value::from("s3cr3t-value"))
        );
    }

    #[test]
    fn test_redactor_masks_secrets() {
        let secrets = vec!["abc".to_string(), "abcdef".to_string(), " ".to_string()];
        let redactor = Redactor::new(secrets.iter());
        assert_eq!(redactor.redact("token=abcdef and abc"), "token=*** and ***");
        assert_eq!(redactor.redact("nothing here"), "nothing here");
    }

    #[test]
    fn test_store_redactor_uses_secret_values() {
        let store = store();
        assert_eq!(
            store.redactor().redact("curl -H 's3cr3t-value'"),
            "curl -H '***'"
        );
    }
}
