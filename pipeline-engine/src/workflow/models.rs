// Workflow Models
// Typed workflow, job, step and composite action definitions built from a parsed tree

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use std::collections::BTreeMap;

/// A GitHub Actions-compatible workflow definition.
///
/// Jobs keep their declared order. Built by `WorkflowParser`, never
/// deserialized directly, so every schema error carries a path.
#[derive(Debug, Clone, Default)]
pub struct Workflow {
    /// The name of the workflow
    pub name: Option<String>,

    /// Trigger events in declared order
    pub on: Vec<TriggerEvent>,

    /// Workflow-level environment variables
    pub env: BTreeMap<String, String>,

    /// Default settings for all jobs in the workflow
    pub defaults: Option<Defaults>,

    /// Permissions for the run token (carried, not enforced)
    pub permissions: Option<Value>,

    /// Run-level concurrency group
    pub concurrency: Option<Concurrency>,

    /// The jobs that make up this workflow
    pub jobs: Vec<(String, Job)>,
}

impl Workflow {
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|(name, _)| name == id).map(|(_, job)| job)
    }

    pub fn job_ids(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(|(id, _)| id.as_str())
    }

    /// Configuration for one trigger event, if declared
    pub fn trigger(&self, event: &str) -> Option<&EventConfig> {
        self.on
            .iter()
            .find(|t| t.event == event)
            .map(|t| &t.config)
    }

    /// Every cron expression declared under `on.schedule`
    pub fn schedules(&self) -> Vec<&str> {
        self.on
            .iter()
            .flat_map(|t| t.config.schedule.iter().map(String::as_str))
            .collect()
    }

    /// The `workflow_call` interface, present when this workflow is reusable
    pub fn call_interface(&self) -> Option<&EventConfig> {
        self.trigger("workflow_call")
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("workflow")
    }
}

/// One event under `on:` with its filters
#[derive(Debug, Clone, Default)]
pub struct TriggerEvent {
    pub event: String,
    pub config: EventConfig,
}

/// Filters and interface declared for one trigger event.
///
/// A filter list that is `None` was not declared, which is different from
/// an empty list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub branches: Option<Vec<String>>,

    #[serde(rename = "branches-ignore")]
    pub branches_ignore: Option<Vec<String>>,

    pub tags: Option<Vec<String>>,

    #[serde(rename = "tags-ignore")]
    pub tags_ignore: Option<Vec<String>>,

    pub paths: Option<Vec<String>>,

    #[serde(rename = "paths-ignore")]
    pub paths_ignore: Option<Vec<String>>,

    /// Activity types, matched against the payload `action`
    #[serde(deserialize_with = "string_or_list_opt")]
    pub types: Option<Vec<String>>,

    /// Cron expressions, filled from `on.schedule`
    #[serde(skip)]
    pub schedule: Vec<String>,

    /// Inputs for workflow_dispatch and workflow_call
    pub inputs: BTreeMap<String, WorkflowInput>,

    /// Outputs for workflow_call
    pub outputs: BTreeMap<String, WorkflowOutput>,

    /// Secrets for workflow_call
    pub secrets: BTreeMap<String, WorkflowSecret>,
}

/// Input definition for workflow_dispatch or workflow_call triggers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowInput {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default, rename = "type")]
    pub input_type: InputType,

    /// Options for choice inputs
    #[serde(default)]
    pub options: Vec<String>,
}

/// Declared type of a trigger input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    String,
    Boolean,
    Choice,
    Number,
    Environment,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::String => "string",
            InputType::Boolean => "boolean",
            InputType::Choice => "choice",
            InputType::Number => "number",
            InputType::Environment => "environment",
        }
    }
}

/// Output of a reusable workflow
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowOutput {
    #[serde(default)]
    pub description: Option<String>,

    /// Expression evaluated against the nested run's `jobs` context
    pub value: String,
}

/// Secret accepted by a reusable workflow
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowSecret {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,
}

/// Default settings for jobs and steps.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub run: Option<RunDefaults>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunDefaults {
    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,
}

/// A flag that is either literal or decided by an expression
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Toggle {
    Bool(bool),
    Expression(String),
}

impl Default for Toggle {
    fn default() -> Self {
        Toggle::Bool(false)
    }
}

/// Concurrency settings at workflow or job level.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Concurrency {
    /// `concurrency: group-name`
    Group(String),

    Detailed {
        group: String,
        #[serde(default, rename = "cancel-in-progress")]
        cancel_in_progress: Toggle,
    },
}

impl Concurrency {
    /// Unresolved group key template
    pub fn group(&self) -> &str {
        match self {
            Concurrency::Group(group) => group,
            Concurrency::Detailed { group, .. } => group,
        }
    }

    pub fn cancel_in_progress(&self) -> Toggle {
        match self {
            Concurrency::Group(_) => Toggle::Bool(false),
            Concurrency::Detailed {
                cancel_in_progress, ..
            } => cancel_in_progress.clone(),
        }
    }
}

/// A job definition within a workflow.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Job {
    /// Display name for the job
    pub name: Option<String>,

    /// Jobs that must finish before this job starts
    #[serde(deserialize_with = "string_or_list")]
    pub needs: Vec<String>,

    /// Runner selection, passed through to the step runner
    #[serde(rename = "runs-on")]
    pub runs_on: Option<Value>,

    /// Condition for running this job
    #[serde(rename = "if", deserialize_with = "condition")]
    pub condition: Option<String>,

    #[serde(deserialize_with = "scalar_map")]
    pub env: BTreeMap<String, String>,

    pub defaults: Option<Defaults>,

    /// Output name to expression over the job's steps
    #[serde(deserialize_with = "scalar_map")]
    pub outputs: BTreeMap<String, String>,

    pub strategy: Option<Strategy>,

    pub steps: Vec<Step>,

    #[serde(rename = "timeout-minutes")]
    pub timeout_minutes: Option<f64>,

    #[serde(rename = "continue-on-error")]
    pub continue_on_error: Toggle,

    pub concurrency: Option<Concurrency>,

    /// Reusable workflow reference
    pub uses: Option<String>,

    /// Inputs bound for a reusable workflow call
    pub with: Map<String, Value>,

    /// Secrets bound for a reusable workflow call
    #[serde(deserialize_with = "secrets_binding")]
    pub secrets: Option<SecretsBinding>,
}

impl Job {
    pub fn display_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(id)
    }

    /// Whether this job calls a reusable workflow instead of running steps
    pub fn is_call(&self) -> bool {
        self.uses.is_some()
    }

    pub fn matrix(&self) -> Option<&Value> {
        self.strategy.as_ref().and_then(|s| s.matrix.as_ref())
    }
}

/// Secrets forwarded to a reusable workflow
#[derive(Debug, Clone, PartialEq)]
pub enum SecretsBinding {
    /// `secrets: inherit`
    Inherit,
    /// Name to expression
    Explicit(BTreeMap<String, String>),
}

/// Matrix strategy for a job.
#[derive(Debug, Clone, Deserialize)]
pub struct Strategy {
    /// Raw matrix tree; dimensions, include and exclude
    #[serde(default)]
    pub matrix: Option<Value>,

    #[serde(default = "default_true", rename = "fail-fast")]
    pub fail_fast: bool,

    #[serde(default, rename = "max-parallel")]
    pub max_parallel: Option<usize>,

    /// Fail instead of succeeding when the matrix expands to nothing
    #[serde(default, rename = "require-instances")]
    pub require_instances: bool,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            matrix: None,
            fail_fast: true,
            max_parallel: None,
            require_instances: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A step within a job or composite action.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Step {
    /// Identifier for referencing outputs
    pub id: Option<String>,

    pub name: Option<String>,

    #[serde(rename = "if", deserialize_with = "condition")]
    pub condition: Option<String>,

    /// Shell script to run
    pub run: Option<String>,

    pub shell: Option<String>,

    #[serde(rename = "working-directory")]
    pub working_directory: Option<String>,

    /// Action reference
    pub uses: Option<String>,

    /// Inputs for the action
    pub with: Map<String, Value>,

    #[serde(deserialize_with = "scalar_map")]
    pub env: BTreeMap<String, String>,

    #[serde(rename = "continue-on-error")]
    pub continue_on_error: Toggle,

    #[serde(rename = "timeout-minutes")]
    pub timeout_minutes: Option<f64>,
}

impl Step {
    /// Get a display name for the step.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            name.clone()
        } else if let Some(uses) = &self.uses {
            format!("Run {}", uses)
        } else if let Some(run) = &self.run {
            let first_line = run.lines().next().unwrap_or(run);
            if first_line.chars().count() > 50 {
                let short: String = first_line.chars().take(47).collect();
                format!("Run {}...", short)
            } else {
                format!("Run {}", first_line)
            }
        } else {
            "Unnamed step".to_string()
        }
    }
}

/// A composite action definition (`action.yml` with `runs.using: composite`)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompositeAction {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub inputs: BTreeMap<String, ActionInput>,

    #[serde(default)]
    pub outputs: BTreeMap<String, ActionOutput>,

    pub runs: ActionRuns,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionInput {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionOutput {
    #[serde(default)]
    pub description: Option<String>,

    /// Expression over the action's local `steps` context
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionRuns {
    pub using: String,

    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Render a scalar the way it is exposed to scripts and expressions
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(string_or_list_opt(deserializer)?.unwrap_or_default())
}

fn string_or_list_opt<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => None,
        Some(OneOrMany::One(s)) => Some(vec![s]),
        Some(OneOrMany::Many(v)) => Some(v),
    })
}

fn condition<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => scalar_to_string(&value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("condition must be a string or boolean")),
    }
}

fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let map = Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    map.into_iter()
        .map(|(key, value)| match scalar_to_string(&value) {
            Some(text) => Ok((key, text)),
            None => Err(serde::de::Error::custom(format!(
                "value of '{}' must be a scalar",
                key
            ))),
        })
        .collect()
}

fn secrets_binding<'de, D>(deserializer: D) -> Result<Option<SecretsBinding>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s == "inherit" => Ok(Some(SecretsBinding::Inherit)),
        Some(Value::Object(map)) => map
            .into_iter()
            .map(|(key, value)| match scalar_to_string(&value) {
                Some(text) => Ok((key, text)),
                None => Err(serde::de::Error::custom("secret bindings must be strings")),
            })
            .collect::<Result<_, _>>()
            .map(|bindings| Some(SecretsBinding::Explicit(bindings))),
        Some(_) => Err(serde::de::Error::custom(
            "secrets must be 'inherit' or a mapping",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(yaml: &str) -> Job {
        let tree: Value = serde_yaml::from_str(yaml).unwrap();
        serde_json::from_value(tree).unwrap()
    }

    #[test]
    fn test_parse_job_with_needs() {
        assert_eq!(job("needs: build\nsteps: []").needs, vec!["build"]);
        assert_eq!(
            job("needs: [build, test]").needs,
            vec!["build".to_string(), "test".to_string()]
        );
        assert!(job("runs-on: ubuntu-latest").needs.is_empty());
    }

    #[test]
    fn test_scalar_env_and_condition() {
        let parsed = job(
            r#"
if: false
env:
  RETRIES: 3
  DEBUG: true
  NAME: app
"#,
        );
        assert_eq!(parsed.condition.as_deref(), Some("false"));
        assert_eq!(parsed.env["RETRIES"], "3");
        assert_eq!(parsed.env["DEBUG"], "true");
        assert_eq!(parsed.env["NAME"], "app");
    }

    #[test]
    fn test_strategy_defaults() {
        let parsed = job(
            r#"
strategy:
  matrix:
    os: [a, b]
"#,
        );
        let strategy = parsed.strategy.unwrap();
        assert!(strategy.fail_fast);
        assert!(!strategy.require_instances);
        assert!(strategy.matrix.is_some());
    }

    #[test]
    fn test_secrets_binding() {
        assert_eq!(
            job("uses: ./.github/workflows/deploy.yml\nsecrets: inherit").secrets,
            Some(SecretsBinding::Inherit)
        );
        let explicit = job("secrets:\n  token: ${{ secrets.TOKEN }}").secrets;
        assert!(matches!(explicit, Some(SecretsBinding::Explicit(m)) if m.contains_key("token")));

        let tree: Value = serde_yaml::from_str("secrets: everything").unwrap();
        assert!(serde_json::from_value::<Job>(tree).is_err());
    }

    #[test]
    fn test_concurrency_forms() {
        let simple: Concurrency = serde_json::from_value(serde_json::json!("deploy")).unwrap();
        assert_eq!(simple.group(), "deploy");
        assert_eq!(simple.cancel_in_progress(), Toggle::Bool(false));

        let detailed: Concurrency = serde_json::from_value(
            serde_json::json!({"group": "ci-${{ github.ref }}", "cancel-in-progress": true}),
        )
        .unwrap();
        assert_eq!(detailed.group(), "ci-${{ github.ref }}");
        assert_eq!(detailed.cancel_in_progress(), Toggle::Bool(true));
    }

    #[test]
    fn test_step_display_name() {
        let step = Step {
            run: Some("cargo test --workspace\ncargo build".into()),
            ..Default::default()
        };
        assert_eq!(step.display_name(), "Run cargo test --workspace");

        let uses = Step {
            uses: Some("actions/checkout@v4".into()),
            ..Default::default()
        };
        assert_eq!(uses.display_name(), "Run actions/checkout@v4");
    }

    #[test]
    fn test_parse_composite_action() {
        let tree: Value = serde_yaml::from_str(
            r#"
name: Setup
inputs:
  version:
    default: "1.0"
outputs:
  path:
    value: ${{ steps.install.outputs.path }}
runs:
  using: composite
  steps:
    - id: install
      run: echo "path=/opt" >> "$GITHUB_OUTPUT"
      shell: bash
"#,
        )
        .unwrap();
        let action: CompositeAction = serde_json::from_value(tree).unwrap();
        assert_eq!(action.runs.using, "composite");
        assert_eq!(action.runs.steps.len(), 1);
        assert!(action.inputs.contains_key("version"));
        assert_eq!(action.outputs["path"].value, "${{ steps.install.outputs.path }}");
    }
}
