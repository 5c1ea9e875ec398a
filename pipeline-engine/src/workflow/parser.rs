// Workflow Parser
// Validates a parsed definition tree into a typed Workflow

use crate::error::{DefinitionError, EngineError};
use crate::execution::graph::ExecutionGraph;
use crate::trigger::TriggerMatcher;
use crate::workflow::models::{
    scalar_to_string, CompositeAction, Concurrency, Defaults, EventConfig, Job, Step,
    TriggerEvent, Workflow,
};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Parser for GitHub Actions workflow definitions.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse a workflow from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Workflow, EngineError> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_str(&content)?)
    }

    /// Parse a workflow from a YAML string.
    pub fn parse_str(content: &str) -> Result<Workflow, DefinitionError> {
        let tree: Value = serde_yaml::from_str(content)
            .map_err(|e| DefinitionError::schema("", format!("invalid YAML: {}", e)))?;
        Self::from_tree(&tree)
    }

    /// Build and validate a workflow from a generic tree.
    ///
    /// Checks the schema, every job's `needs`, acyclicity, trigger filters
    /// and cron schedules.
    pub fn from_tree(tree: &Value) -> Result<Workflow, DefinitionError> {
        let root = tree
            .as_object()
            .ok_or_else(|| DefinitionError::schema("", "workflow must be a mapping"))?;

        let on = root
            .get("on")
            .ok_or_else(|| DefinitionError::schema("on", "missing required key"))?;

        let jobs = match root.get("jobs") {
            Some(Value::Object(jobs)) if !jobs.is_empty() => jobs,
            Some(Value::Object(_)) => {
                return Err(DefinitionError::schema("jobs", "at least one job is required"))
            }
            Some(_) => return Err(DefinitionError::schema("jobs", "must be a mapping")),
            None => return Err(DefinitionError::schema("jobs", "missing required key")),
        };

        let workflow = Workflow {
            name: optional::<String>(root, "name", "name")?,
            on: parse_triggers(on)?,
            env: optional::<Map<String, Value>>(root, "env", "env")?
                .map(|env| string_map(&env, "env"))
                .transpose()?
                .unwrap_or_default(),
            defaults: optional::<Defaults>(root, "defaults", "defaults")?,
            permissions: root.get("permissions").cloned(),
            concurrency: optional::<Concurrency>(root, "concurrency", "concurrency")?,
            jobs: jobs
                .iter()
                .map(|(id, job)| Ok((id.clone(), parse_job(id, job)?)))
                .collect::<Result<_, DefinitionError>>()?,
        };

        ExecutionGraph::from_workflow(&workflow)?;
        TriggerMatcher::validate(&workflow)?;

        Ok(workflow)
    }

    /// Parse a composite action definition from a YAML string.
    pub fn parse_action_str(content: &str) -> Result<CompositeAction, DefinitionError> {
        let tree: Value = serde_yaml::from_str(content)
            .map_err(|e| DefinitionError::schema("", format!("invalid YAML: {}", e)))?;
        Self::action_from_tree(&tree)
    }

    /// Build and validate a composite action from a generic tree.
    pub fn action_from_tree(tree: &Value) -> Result<CompositeAction, DefinitionError> {
        let action: CompositeAction = deserialize(tree, "")?;
        if action.runs.using != "composite" {
            return Err(DefinitionError::schema(
                "runs.using",
                format!("unsupported action type '{}'", action.runs.using),
            ));
        }
        for (index, step) in action.runs.steps.iter().enumerate() {
            check_step(step, &format!("runs.steps[{}]", index))?;
        }
        Ok(action)
    }
}

fn deserialize<T: DeserializeOwned>(tree: &Value, path: &str) -> Result<T, DefinitionError> {
    serde_json::from_value(tree.clone()).map_err(|e| DefinitionError::schema(path, e.to_string()))
}

fn optional<T: DeserializeOwned>(
    map: &Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<Option<T>, DefinitionError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => deserialize(value, path).map(Some),
    }
}

fn string_map(map: &Map<String, Value>, path: &str) -> Result<BTreeMap<String, String>, DefinitionError> {
    map.iter()
        .map(|(key, value)| {
            scalar_to_string(value)
                .map(|text| (key.clone(), text))
                .ok_or_else(|| DefinitionError::schema(format!("{}.{}", path, key), "must be a scalar"))
        })
        .collect()
}

fn parse_triggers(on: &Value) -> Result<Vec<TriggerEvent>, DefinitionError> {
    let event = |name: &str| TriggerEvent {
        event: name.to_string(),
        config: EventConfig::default(),
    };

    match on {
        Value::String(name) => Ok(vec![event(name)]),
        Value::Array(names) => names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                name.as_str()
                    .map(event)
                    .ok_or_else(|| DefinitionError::schema(format!("on[{}]", i), "must be an event name"))
            })
            .collect(),
        Value::Object(events) => events
            .iter()
            .map(|(name, config)| {
                let path = format!("on.{}", name);
                let config = match (name.as_str(), config) {
                    (_, Value::Null) => EventConfig::default(),
                    ("schedule", Value::Array(entries)) => EventConfig {
                        schedule: parse_schedule(entries, &path)?,
                        ..EventConfig::default()
                    },
                    (_, Value::Object(_)) => deserialize(config, &path)?,
                    _ => return Err(DefinitionError::schema(path, "must be a mapping")),
                };
                Ok(TriggerEvent {
                    event: name.clone(),
                    config,
                })
            })
            .collect(),
        _ => Err(DefinitionError::schema(
            "on",
            "must be an event name, a list or a mapping",
        )),
    }
}

fn parse_schedule(entries: &[Value], path: &str) -> Result<Vec<String>, DefinitionError> {
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            entry
                .get("cron")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| DefinitionError::schema(format!("{}[{}].cron", path, i), "missing cron expression"))
        })
        .collect()
}

fn parse_job(id: &str, tree: &Value) -> Result<Job, DefinitionError> {
    let path = format!("jobs.{}", id);
    if !tree.is_object() {
        return Err(DefinitionError::schema(path, "job must be a mapping"));
    }

    let job: Job = deserialize(tree, &path)?;

    match (&job.uses, job.steps.is_empty()) {
        (Some(_), false) => {
            return Err(DefinitionError::schema(
                path,
                "a job cannot have both 'uses' and 'steps'",
            ))
        }
        (None, true) => {
            return Err(DefinitionError::schema(
                path,
                "a job needs 'steps' or 'uses'",
            ))
        }
        _ => {}
    }

    if let Some(matrix) = job.matrix() {
        if !matrix.is_object() && !matrix.is_string() {
            return Err(DefinitionError::schema(
                format!("{}.strategy.matrix", path),
                "must be a mapping or an expression",
            ));
        }
    }

    for (index, step) in job.steps.iter().enumerate() {
        check_step(step, &format!("{}.steps[{}]", path, index))?;
    }

    Ok(job)
}

fn check_step(step: &Step, path: &str) -> Result<(), DefinitionError> {
    match (&step.run, &step.uses) {
        (Some(_), Some(_)) => Err(DefinitionError::schema(
            path,
            "a step cannot have both 'run' and 'uses'",
        )),
        (None, None) => Err(DefinitionError::schema(
            path,
            "a step must have either 'run' or 'uses'",
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;

    #[test]
    fn test_parse_minimal_workflow() {
        let yaml = r#"
on: push
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - run: echo "Hello"
"#;
        let workflow = WorkflowParser::parse_str(yaml).unwrap();
        assert_eq!(workflow.on.len(), 1);
        assert_eq!(workflow.on[0].event, "push");
        assert!(workflow.job("build").is_some());
    }

    #[test]
    fn test_jobs_keep_declared_order() {
        let yaml = r#"
on: [push, pull_request]
jobs:
  zeta:
    steps: [{run: a}]
  alpha:
    needs: zeta
    steps: [{run: b}]
  mid:
    steps: [{run: c}]
"#;
        let workflow = WorkflowParser::parse_str(yaml).unwrap();
        let ids: Vec<&str> = workflow.job_ids().collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
        assert_eq!(workflow.on[1].event, "pull_request");
    }

    #[test]
    fn test_detailed_triggers_and_schedule() {
        let yaml = r#"
on:
  push:
    branches: [main]
  schedule:
    - cron: "0 3 * * 1"
  workflow_dispatch:
jobs:
  nightly:
    steps: [{run: make}]
"#;
        let workflow = WorkflowParser::parse_str(yaml).unwrap();
        assert_eq!(
            workflow.trigger("push").and_then(|c| c.branches.clone()),
            Some(vec!["main".to_string()])
        );
        assert_eq!(workflow.schedules(), vec!["0 3 * * 1"]);
        assert!(workflow.trigger("workflow_dispatch").is_some());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let yaml = "on:\n  schedule:\n    - cron: '61 * * * *'\njobs:\n  a:\n    steps: [{run: x}]\n";
        assert!(matches!(
            WorkflowParser::parse_str(yaml),
            Err(DefinitionError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn test_missing_keys_report_path() {
        let err = WorkflowParser::parse_str("jobs:\n  a:\n    steps: [{run: x}]\n").unwrap_err();
        assert_eq!(err, DefinitionError::schema("on", "missing required key"));

        let err = WorkflowParser::parse_str("on: push\n").unwrap_err();
        assert!(matches!(err, DefinitionError::SchemaViolation { ref path, .. } if path == "jobs"));
    }

    #[test]
    fn test_mistyped_job_reports_job_path() {
        let yaml = r#"
on: push
jobs:
  build:
    timeout-minutes: soon
    steps: [{run: x}]
"#;
        let err = WorkflowParser::parse_str(yaml).unwrap_err();
        assert!(matches!(err, DefinitionError::SchemaViolation { ref path, .. } if path == "jobs.build"));
    }

    #[test]
    fn test_step_needs_run_or_uses() {
        let yaml = r#"
on: push
jobs:
  build:
    steps:
      - name: nothing
"#;
        let err = WorkflowParser::parse_str(yaml).unwrap_err();
        assert!(matches!(err, DefinitionError::SchemaViolation { ref path, .. } if path == "jobs.build.steps[0]"));
    }

    #[test]
    fn test_unknown_dependency_and_cycle() {
        let unknown = "on: push\njobs:\n  test:\n    needs: build\n    steps: [{run: x}]\n";
        assert!(matches!(
            WorkflowParser::parse_str(unknown),
            Err(DefinitionError::Graph(GraphError::UnknownDependency { .. }))
        ));

        let cyclic = r#"
on: push
jobs:
  a:
    needs: c
    steps: [{run: x}]
  b:
    needs: a
    steps: [{run: x}]
  c:
    needs: b
    steps: [{run: x}]
"#;
        assert!(matches!(
            WorkflowParser::parse_str(cyclic),
            Err(DefinitionError::Graph(GraphError::CycleDetected { .. }))
        ));
    }

    #[test]
    fn test_reusable_call_job() {
        let yaml = r#"
on: push
jobs:
  deploy:
    uses: ./.github/workflows/deploy.yml
    with:
      environment: prod
    secrets: inherit
"#;
        let workflow = WorkflowParser::parse_str(yaml).unwrap();
        let job = workflow.job("deploy").unwrap();
        assert!(job.is_call());
        assert_eq!(job.with["environment"], Value::String("prod".into()));
    }

    #[test]
    fn test_from_tree_without_yaml() {
        let tree = serde_json::json!({
            "on": {"workflow_call": {"inputs": {"version": {"type": "string", "required": true}}}},
            "jobs": {"build": {"steps": [{"run": "make"}]}}
        });
        let workflow = WorkflowParser::from_tree(&tree).unwrap();
        let call = workflow.call_interface().unwrap();
        assert!(call.inputs["version"].required);
    }

    #[test]
    fn test_action_must_be_composite() {
        let err = WorkflowParser::parse_action_str("runs:\n  using: node20\n").unwrap_err();
        assert!(matches!(err, DefinitionError::SchemaViolation { ref path, .. } if path == "runs.using"));
    }
}
