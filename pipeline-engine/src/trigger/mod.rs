// Trigger Matcher
// Decides whether an event activates a workflow and seeds the run's initial context

pub mod filters;
pub mod inputs;
pub mod schedule;

pub use filters::{paths_pass, ref_passes, PatternList};
pub use inputs::bind_inputs;
pub use schedule::CronSchedule;

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::debug;

use crate::error::{DefinitionError, TriggerError};
use crate::expression::Value;
use crate::workflow::models::{EventConfig, Workflow};

/// An incoming event: a tag plus an arbitrary payload.
///
/// Recognised payload keys are `ref`, `base_ref`, `sha`, `actor`,
/// `repository`, `action`, `changed_files`, `schedule` and `inputs`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub name: String,

    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    fn field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(serde_json::Value::as_str)
    }

    pub fn git_ref(&self) -> Option<&str> {
        self.field("ref")
    }

    /// Ref that branch filters apply to: pull requests filter on their base
    pub fn filter_ref(&self) -> Option<&str> {
        if self.name.starts_with("pull_request") {
            self.field("base_ref").or_else(|| self.git_ref())
        } else {
            self.git_ref()
        }
    }

    pub fn changed_files(&self) -> Option<Vec<String>> {
        self.payload
            .get("changed_files")
            .and_then(serde_json::Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .filter_map(|f| f.as_str().map(str::to_string))
                    .collect()
            })
    }

    pub fn inputs(&self) -> serde_json::Map<String, serde_json::Value> {
        self.payload
            .get("inputs")
            .and_then(serde_json::Value::as_object)
            .cloned()
            .unwrap_or_default()
    }
}

/// What an activated trigger contributes to the run's initial contexts
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationSeed {
    pub event_name: String,
    pub payload: serde_json::Value,
    pub inputs: BTreeMap<String, Value>,
}

impl ActivationSeed {
    /// The `github` context for this activation
    pub fn github_context(&self, run_id: &str) -> Value {
        let field = |key: &str| {
            self.payload
                .get(key)
                .map(Value::from)
                .unwrap_or(Value::Null)
        };
        let git_ref = field("ref");

        let mut github = BTreeMap::new();
        github.insert("event_name".to_string(), Value::from(self.event_name.as_str()));
        github.insert("event".to_string(), Value::from(&self.payload));
        github.insert("ref_name".to_string(), Value::from(short_ref(&git_ref.as_string())));
        github.insert("ref".to_string(), git_ref);
        github.insert("base_ref".to_string(), field("base_ref"));
        github.insert("sha".to_string(), field("sha"));
        github.insert("actor".to_string(), field("actor"));
        github.insert("repository".to_string(), field("repository"));
        github.insert("run_id".to_string(), Value::from(run_id));
        Value::Object(github)
    }
}

/// Result of matching an event against a workflow
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    Activated(ActivationSeed),
    NotActivated { reason: String },
}

impl Activation {
    pub fn is_activated(&self) -> bool {
        matches!(self, Activation::Activated(_))
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Activation::NotActivated {
            reason: reason.into(),
        }
    }
}

/// Which kind of ref an event carries
enum RefKind<'a> {
    Branch(&'a str),
    Tag(&'a str),
}

fn classify(git_ref: &str) -> RefKind<'_> {
    if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
        RefKind::Tag(tag)
    } else {
        RefKind::Branch(git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref))
    }
}

fn short_ref(git_ref: &str) -> String {
    match classify(git_ref) {
        RefKind::Branch(name) | RefKind::Tag(name) => name.to_string(),
    }
}

/// Compiled filters for one trigger event
struct CompiledFilters {
    branches: Option<PatternList>,
    branches_ignore: Option<PatternList>,
    tags: Option<PatternList>,
    tags_ignore: Option<PatternList>,
    paths: Option<PatternList>,
    paths_ignore: Option<PatternList>,
}

impl CompiledFilters {
    fn compile(event: &str, config: &EventConfig) -> Result<Self, DefinitionError> {
        let compile = |list: &Option<Vec<String>>, key: &str| {
            list.as_ref()
                .map(|patterns| PatternList::new(patterns, &format!("on.{}.{}", event, key)))
                .transpose()
        };

        Ok(Self {
            branches: compile(&config.branches, "branches")?,
            branches_ignore: compile(&config.branches_ignore, "branches-ignore")?,
            tags: compile(&config.tags, "tags")?,
            tags_ignore: compile(&config.tags_ignore, "tags-ignore")?,
            paths: compile(&config.paths, "paths")?,
            paths_ignore: compile(&config.paths_ignore, "paths-ignore")?,
        })
    }

    fn has_branch_filters(&self) -> bool {
        self.branches.is_some() || self.branches_ignore.is_some()
    }

    fn has_tag_filters(&self) -> bool {
        self.tags.is_some() || self.tags_ignore.is_some()
    }

    /// `None` when the ref passes, otherwise the rejection reason
    fn check_ref(&self, git_ref: Option<&str>) -> Option<String> {
        if !self.has_branch_filters() && !self.has_tag_filters() {
            return None;
        }

        let Some(git_ref) = git_ref else {
            return Some("event has no ref to match branch or tag filters".to_string());
        };

        let passes = match classify(git_ref) {
            RefKind::Tag(tag) if self.has_tag_filters() => {
                ref_passes(self.tags.as_ref(), self.tags_ignore.as_ref(), tag)
            }
            RefKind::Branch(branch) if self.has_branch_filters() => {
                ref_passes(self.branches.as_ref(), self.branches_ignore.as_ref(), branch)
            }
            // only the other kind of filter is declared
            _ => false,
        };

        (!passes).then(|| format!("ref '{}' is filtered out", git_ref))
    }
}

/// Matches events against a workflow's `on:` declarations
pub struct TriggerMatcher;

impl TriggerMatcher {
    /// Compile every filter and schedule once, at load time
    pub fn validate(workflow: &Workflow) -> Result<(), DefinitionError> {
        for trigger in &workflow.on {
            CompiledFilters::compile(&trigger.event, &trigger.config)?;
            for cron in &trigger.config.schedule {
                CronSchedule::parse(cron)?;
            }
        }
        Ok(())
    }

    /// Decide whether `event` activates `workflow`.
    ///
    /// Input schema violations are errors; every other mismatch is a
    /// plain `NotActivated`.
    pub fn matches(workflow: &Workflow, event: &Event) -> Result<Activation, TriggerError> {
        let Some(config) = workflow.trigger(&event.name) else {
            return Ok(Activation::rejected(format!(
                "workflow is not triggered by '{}'",
                event.name
            )));
        };

        // filters were compiled by `validate`; a failure here means an
        // unvalidated workflow, which is treated as not matching
        let filters = match CompiledFilters::compile(&event.name, config) {
            Ok(filters) => filters,
            Err(err) => return Ok(Activation::rejected(err.to_string())),
        };

        if let Some(reason) = filters.check_ref(event.filter_ref()) {
            return Ok(Activation::rejected(reason));
        }

        let changed = event.changed_files();
        if !paths_pass(
            filters.paths.as_ref(),
            filters.paths_ignore.as_ref(),
            changed.as_deref(),
        ) {
            return Ok(Activation::rejected("no changed file passes the path filters"));
        }

        if let Some(types) = &config.types {
            let action = event.payload.get("action").and_then(serde_json::Value::as_str);
            if !action.is_some_and(|a| types.iter().any(|t| t == a)) {
                return Ok(Activation::rejected(format!(
                    "activity type {:?} is not one of [{}]",
                    action.unwrap_or(""),
                    types.join(", ")
                )));
            }
        }

        if event.name == "schedule" && !config.schedule.is_empty() {
            if let Some(cron) = event.payload.get("schedule").and_then(serde_json::Value::as_str) {
                if !config.schedule.iter().any(|c| c == cron) {
                    return Ok(Activation::rejected(format!(
                        "schedule '{}' is not declared",
                        cron
                    )));
                }
            }
        }

        let inputs = bind_inputs(&config.inputs, &event.inputs())?;
        debug!(event = %event.name, inputs = inputs.len(), "workflow activated");

        Ok(Activation::Activated(ActivationSeed {
            event_name: event.name.clone(),
            payload: event.payload.clone(),
            inputs,
        }))
    }
}
