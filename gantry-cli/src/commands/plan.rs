use crate::commands::{load_definition, EventArgs, EXIT_DEFINITION_ERROR, EXIT_TRIGGER_ERROR};
use crate::output;

use clap::Args;

use pipeline_engine::execution::{PlannedMatrix, ExecutionPlan};
use pipeline_engine::{Activation, TriggerMatcher};

/// Show the activation result, DAG levels and matrix instances
#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub event: EventArgs,
}

/// Returns the process exit code
pub fn execute(args: PlanArgs) -> i32 {
    let workflow = match load_definition(&args.event.definition) {
        Ok(workflow) => workflow,
        Err(code) => return code,
    };
    let event = match args.event.event() {
        Ok(event) => event,
        Err(e) => {
            output::error(&e.to_string());
            return EXIT_DEFINITION_ERROR;
        }
    };

    output::status("Planning", &format!("'{}' for '{}'", workflow.display_name(), event.name));

    let seed = match TriggerMatcher::matches(&workflow, &event) {
        Ok(Activation::Activated(seed)) => seed,
        Ok(Activation::NotActivated { reason }) => {
            output::warning(&format!("Not activated: {}", reason));
            return 0;
        }
        Err(e) => {
            output::error(&format!("Trigger error: {}", e));
            return EXIT_TRIGGER_ERROR;
        }
    };
    output::check(&format!("Activated by '{}'", seed.event_name));
    for (name, value) in &seed.inputs {
        output::dim(&format!("    input {} = {}", name, value.as_string()));
    }

    let plan = match ExecutionPlan::build(&workflow) {
        Ok(plan) => plan,
        Err(e) => {
            output::error(&e.to_string());
            return EXIT_DEFINITION_ERROR;
        }
    };

    for line in render(&plan) {
        println!("{}", line);
    }
    0
}

fn render(plan: &ExecutionPlan) -> Vec<String> {
    let mut lines = Vec::new();
    for (index, level) in plan.levels.iter().enumerate() {
        lines.push(format!("Level {}", index));
        for job in level {
            let mut header = format!("  {}", job.id);
            if job.name != job.id {
                header.push_str(&format!(" ({})", job.name));
            }
            if !job.needs.is_empty() {
                header.push_str(&format!(" needs [{}]", job.needs.join(", ")));
            }
            if let Some(callee) = &job.calls {
                header.push_str(&format!(" calls {}", callee));
            }
            lines.push(header);

            match &job.matrix {
                PlannedMatrix::Single(_) => {}
                PlannedMatrix::Instances(ids) if ids.is_empty() => {
                    lines.push("    matrix: no instances".to_string());
                }
                PlannedMatrix::Instances(ids) => {
                    for id in ids {
                        lines.push(format!("    - {}", id));
                    }
                }
                PlannedMatrix::Deferred => lines.push("    matrix: deferred".to_string()),
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_engine::WorkflowParser;

    #[test]
    fn test_render_plan() {
        let workflow = WorkflowParser::parse_str(
            r#"
on: push
jobs:
  build:
    name: Build
    strategy:
      matrix:
        os: [linux, mac]
    steps:
      - run: echo
  deploy:
    needs: build
    strategy:
      matrix:
        region: ${{ fromJSON('["eu"]') }}
    steps:
      - run: echo
"#,
        )
        .unwrap();
        let plan = ExecutionPlan::build(&workflow).unwrap();

        assert_eq!(
            render(&plan),
            vec![
                "Level 0",
                "  build (Build)",
                "    - build (linux)",
                "    - build (mac)",
                "Level 1",
                "  deploy needs [build]",
                "    matrix: deferred",
            ]
        );
    }
}
