// CLI commands and the helpers they share

pub mod plan;
pub mod run;
pub mod validate;

use crate::output;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Args;
use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;

use pipeline_engine::{EngineError, Event, Workflow, WorkflowParser};

pub const EXIT_TRIGGER_ERROR: i32 = 1;
pub const EXIT_DEFINITION_ERROR: i32 = 2;

/// Event used when neither an event file nor `--event-name` is given
const DEFAULT_EVENT: &str = "push";

/// Definition plus the event it is evaluated against
#[derive(Args, Debug)]
pub struct EventArgs {
    /// Path to the workflow YAML file
    pub definition: PathBuf,

    /// Event file: YAML or JSON `{event: <tag>, payload: {...}}`
    pub event_file: Option<PathBuf>,

    /// Event tag to use instead of, or to override, the event file's
    #[arg(long, value_name = "NAME")]
    pub event_name: Option<String>,

    /// Workflow input, merged into `payload.inputs` (repeatable)
    #[arg(long = "input", short = 'i', value_name = "NAME=VALUE")]
    pub inputs: Vec<String>,
}

impl EventArgs {
    /// Build the event from the file, the name override and `--input` values
    pub fn event(&self) -> Result<Event> {
        let mut event = match &self.event_file {
            Some(path) => load_event(path)?,
            None => Event::new(DEFAULT_EVENT, serde_json::json!({})),
        };
        if let Some(name) = &self.event_name {
            event.name = name.clone();
        }

        let inputs = parse_pairs(&self.inputs, "--input")?;
        if !inputs.is_empty() {
            merge_inputs(&mut event.payload, inputs)?;
        }
        Ok(event)
    }
}

/// Load a definition, reporting any failure and returning the exit code
pub fn load_definition(path: &Path) -> std::result::Result<Workflow, i32> {
    WorkflowParser::from_file(path).map_err(|e| {
        report_load_error(path, &e);
        EXIT_DEFINITION_ERROR
    })
}

fn report_load_error(path: &Path, error: &EngineError) {
    match error {
        EngineError::Io(e) => output::error(&format!("cannot read {}: {}", path.display(), e)),
        other => output::error(&format!("{}: {}", path.display(), other)),
    }
}

fn load_event(path: &Path) -> Result<Event> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| eyre!("cannot read event file {}: {}", path.display(), e))?;
    let mut event: Event = serde_yaml::from_str(&content)
        .map_err(|e| eyre!("invalid event file {}: {}", path.display(), e))?;
    if event.payload.is_null() {
        event.payload = serde_json::json!({});
    }
    Ok(event)
}

fn merge_inputs(payload: &mut serde_json::Value, inputs: BTreeMap<String, String>) -> Result<()> {
    let Some(object) = payload.as_object_mut() else {
        bail!("event payload must be a mapping to accept --input values");
    };
    let slot = object
        .entry("inputs")
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    let Some(existing) = slot.as_object_mut() else {
        bail!("event payload 'inputs' must be a mapping");
    };
    for (name, value) in inputs {
        existing.insert(name, serde_json::Value::String(value));
    }
    Ok(())
}

/// Parse repeated `NAME=VALUE` flags
pub fn parse_pairs(values: &[String], flag: &str) -> Result<BTreeMap<String, String>> {
    let mut pairs = BTreeMap::new();
    for raw in values {
        match raw.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                pairs.insert(name.to_string(), value.to_string());
            }
            _ => bail!("invalid {} '{}', expected NAME=VALUE", flag, raw),
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(event_file: Option<PathBuf>, event_name: Option<&str>, inputs: &[&str]) -> EventArgs {
        EventArgs {
            definition: PathBuf::from("ci.yml"),
            event_file,
            event_name: event_name.map(str::to_string),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs(&["A=1".to_string(), "B=x=y".to_string()], "--var").unwrap();
        assert_eq!(pairs["A"], "1");
        assert_eq!(pairs["B"], "x=y");
        assert!(parse_pairs(&["novalue".to_string()], "--var").is_err());
        assert!(parse_pairs(&["=v".to_string()], "--var").is_err());
    }

    #[test]
    fn test_event_file_with_inputs_and_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("event.yml");
        std::fs::write(
            &path,
            "event: push\npayload:\n  ref: refs/heads/main\n  inputs:\n    keep: yes\n",
        )
        .unwrap();

        let event = args(Some(path), Some("workflow_dispatch"), &["target=linux"])
            .event()
            .unwrap();
        assert_eq!(event.name, "workflow_dispatch");
        assert_eq!(event.payload["ref"], "refs/heads/main");
        assert_eq!(event.payload["inputs"]["keep"], "yes");
        assert_eq!(event.payload["inputs"]["target"], "linux");
    }

    #[test]
    fn test_default_event() {
        let event = args(None, None, &[]).event().unwrap();
        assert_eq!(event.name, "push");
        assert!(event.payload.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_missing_definition_is_definition_error() {
        let dir = TempDir::new().unwrap();
        let code = load_definition(&dir.path().join("missing.yml")).unwrap_err();
        assert_eq!(code, EXIT_DEFINITION_ERROR);
    }
}
