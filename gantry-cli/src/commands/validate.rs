use crate::commands::load_definition;
use crate::output;

use std::path::PathBuf;

use clap::Args;

use pipeline_engine::ExecutionGraph;

/// Validate a workflow YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the workflow YAML file
    pub definition: PathBuf,
}

/// Returns the process exit code
pub fn execute(args: ValidateArgs) -> i32 {
    let path = &args.definition;
    output::status("Validating", &format!("{}", path.display()));

    // loading checks the schema, needs, acyclicity, filters and cron syntax
    let workflow = match load_definition(path) {
        Ok(workflow) => workflow,
        Err(code) => return code,
    };
    output::check("Schema valid");

    let triggers: Vec<&str> = workflow.on.iter().map(|t| t.event.as_str()).collect();
    output::check(&format!("Triggers: {}", triggers.join(", ")));

    let schedules = workflow.schedules();
    if !schedules.is_empty() {
        output::check(&format!("Schedules: {}", schedules.join("; ")));
    }

    match ExecutionGraph::from_workflow(&workflow) {
        Ok(graph) => output::check(&format!(
            "Dependencies: {} jobs in {} levels",
            graph.len(),
            graph.levels().len()
        )),
        Err(e) => {
            output::error(&e.to_string());
            return super::EXIT_DEFINITION_ERROR;
        }
    }

    output::success(&format!("'{}' is valid", workflow.display_name()));
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn validate(content: &str) -> i32 {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ci.yml");
        std::fs::write(&path, content).unwrap();
        execute(ValidateArgs { definition: path })
    }

    #[test]
    fn test_valid_definition() {
        assert_eq!(validate("on: push\njobs:\n  a:\n    steps:\n      - run: echo\n"), 0);
    }

    #[test]
    fn test_cycle_exits_two() {
        let code = validate(
            "on: push\njobs:\n  a:\n    needs: b\n    steps:\n      - run: x\n  b:\n    needs: a\n    steps:\n      - run: x\n",
        );
        assert_eq!(code, 2);
    }

    #[test]
    fn test_bad_yaml_and_bad_cron_exit_two() {
        assert_eq!(validate("on: [push\njobs: {"), 2);
        assert_eq!(
            validate("on:\n  schedule:\n    - cron: '61 * * * *'\njobs:\n  a:\n    steps:\n      - run: x\n"),
            2
        );
    }
}
