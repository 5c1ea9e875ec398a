use crate::commands::{load_definition, parse_pairs, EventArgs, EXIT_DEFINITION_ERROR, EXIT_TRIGGER_ERROR};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pipeline_engine::execution::events::{progress_channel, LogLevel, StepConclusion};
use pipeline_engine::{
    Activation, ExecutionEvent, ExecutorConfig, PipelineExecutor, RunReport, RunRequest, RunState,
    ShellRunner, TriggerMatcher, WorkspaceHasher,
};

/// Run a workflow locally
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub event: EventArgs,

    /// Secret value, redacted from all output (repeatable)
    #[arg(long = "secret", short = 's', value_name = "NAME=VALUE")]
    pub secrets: Vec<String>,

    /// Configuration variable exposed as `vars` (repeatable)
    #[arg(long = "var", short = 'v', value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Working directory for steps and local references
    #[arg(long, short = 'w', value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Maximum number of job instances running at once
    #[arg(long, value_name = "N")]
    pub max_parallel: Option<usize>,
}

/// Returns the process exit code
pub async fn execute(args: RunArgs) -> Result<i32> {
    let workflow = match load_definition(&args.event.definition) {
        Ok(workflow) => workflow,
        Err(code) => return Ok(code),
    };
    let event = match args.event.event() {
        Ok(event) => event,
        Err(e) => {
            output::error(&e.to_string());
            return Ok(EXIT_DEFINITION_ERROR);
        }
    };

    let seed = match TriggerMatcher::matches(&workflow, &event) {
        Ok(Activation::Activated(seed)) => seed,
        Ok(Activation::NotActivated { reason }) => {
            output::info(&format!("Not activated, nothing to run: {}", reason));
            return Ok(0);
        }
        Err(e) => {
            output::error(&format!("Trigger error: {}", e));
            return Ok(EXIT_TRIGGER_ERROR);
        }
    };

    let secrets = parse_pairs(&args.secrets, "--secret")?;
    let vars = parse_pairs(&args.vars, "--var")?;

    let working_dir = match &args.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    let mut config = ExecutorConfig::default().with_working_dir(&working_dir);
    if let Some(max) = args.max_parallel {
        config = config.with_max_parallel(max);
    }

    let (tx, mut rx) = progress_channel();
    let executor = PipelineExecutor::new(ShellRunner::new())
        .with_config(config)
        .with_progress(tx)
        .with_file_hasher(WorkspaceHasher::new(&working_dir));

    let cancel = CancellationToken::new();
    let request = RunRequest::new(workflow, seed)
        .with_secrets(secrets)
        .with_vars(vars)
        .with_cancellation(cancel.clone());

    // Ctrl-C cancels the run; a second one is left to the default handler
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };

    // Spawn execution in background; the executor drops its sender when done
    let exec_handle = tokio::spawn(async move { executor.execute(request).await });

    while let Some(event) = rx.recv().await {
        render(&event);
    }

    let report = exec_handle.await?;
    interrupt.abort();
    summarize(&report);

    Ok(report.exit_code())
}

fn render(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted {
            workflow,
            total_jobs,
            depth,
            ..
        } => {
            if *depth == 0 {
                println!();
                output::header(&format!("Workflow '{}' ({} jobs)", workflow, total_jobs));
            } else {
                output::status("Calling", &format!("'{}' ({} jobs)", workflow, total_jobs));
            }
        }

        ExecutionEvent::RunCompleted {
            workflow,
            state,
            duration,
            ..
        } => {
            debug!(workflow = %workflow, state = %state.as_str(), "run completed");
            let message = format!(
                "'{}' {} in {:.2}s",
                workflow,
                state.as_str(),
                duration.as_secs_f64()
            );
            match state {
                RunState::Succeeded => output::dim_success(&message),
                _ => output::dim_failure(&message),
            }
        }

        ExecutionEvent::ConcurrencyWaiting { group, .. } => {
            output::info(&format!("Waiting for concurrency group '{}'", group));
        }

        ExecutionEvent::InstanceTransition {
            instance, to, reason, ..
        } => match to {
            RunState::Running => println!("    Job '{}' started", instance),
            RunState::Succeeded => output::dim_success(&format!("    Job '{}' OK", instance)),
            RunState::Failed => output::dim_failure(&format!(
                "    Job '{}' FAIL{}",
                instance,
                reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default()
            )),
            RunState::Skipped | RunState::Cancelled => output::warning(&format!(
                "    Job '{}' {}{}",
                instance,
                to.as_str(),
                reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default()
            )),
            _ => {}
        },

        ExecutionEvent::StepStarted {
            step_name,
            step_index,
            ..
        } => {
            println!("      [Step {}] {}", step_index + 1, step_name);
        }

        ExecutionEvent::StepOutput {
            output, is_error, ..
        } => {
            for line in output.lines() {
                if *is_error {
                    output::step_error(line);
                } else {
                    output::step_output(line);
                }
            }
        }

        ExecutionEvent::StepCompleted {
            outcome,
            duration,
            exit_code,
            ..
        } => {
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            let line = format!(
                "        {} ({:.2}s){}",
                symbol(*outcome),
                duration.as_secs_f64(),
                exit_info
            );
            match outcome {
                StepConclusion::Success => output::dim_success(&line),
                StepConclusion::Failure => output::dim_failure(&line),
                _ => println!("{}", line),
            }
        }

        ExecutionEvent::StepSkipped {
            step_index, reason, ..
        } => {
            output::warning(&format!("        Step {} skipped: {}", step_index + 1, reason));
        }

        ExecutionEvent::Log { level, message, .. } => match level {
            LogLevel::Error => output::error(message),
            LogLevel::Warning => output::warning(message),
            _ => output::dim(message),
        },
    }
}

fn symbol(outcome: StepConclusion) -> &'static str {
    match outcome {
        StepConclusion::Success => "OK",
        StepConclusion::Failure => "FAIL",
        StepConclusion::Skipped => "SKIP",
        StepConclusion::Cancelled => "CANCELLED",
    }
}

fn summarize(report: &RunReport) {
    println!();
    let failed: Vec<String> = report
        .instances
        .iter()
        .filter(|i| i.state == RunState::Failed)
        .map(|i| i.instance.to_string())
        .collect();

    match report.state {
        RunState::Succeeded => output::success(&format!(
            "Run {} succeeded in {:.2}s",
            report.run_id,
            report.duration.as_secs_f64()
        )),
        RunState::Cancelled => output::warning(&format!(
            "Run {} cancelled{}",
            report.run_id,
            report.reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default()
        )),
        _ => {
            output::failure(&format!("Run {} failed", report.run_id));
            if let Some(reason) = &report.reason {
                output::error(reason);
            }
            for id in failed {
                output::dim_failure(&format!("  - {}", id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbols() {
        assert_eq!(symbol(StepConclusion::Success), "OK");
        assert_eq!(symbol(StepConclusion::Cancelled), "CANCELLED");
    }

    #[tokio::test]
    async fn test_not_activated_exits_zero() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ci.yml");
        std::fs::write(&path, "on: pull_request\njobs:\n  a:\n    steps:\n      - run: echo\n").unwrap();

        let args = RunArgs {
            event: EventArgs {
                definition: path,
                event_file: None,
                event_name: Some("push".to_string()),
                inputs: Vec::new(),
            },
            secrets: Vec::new(),
            vars: Vec::new(),
            workdir: Some(dir.path().to_path_buf()),
            max_parallel: None,
        };
        assert_eq!(execute(args).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_required_input_exits_one() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ci.yml");
        std::fs::write(
            &path,
            "on:\n  workflow_dispatch:\n    inputs:\n      target:\n        required: true\njobs:\n  a:\n    steps:\n      - run: echo\n",
        )
        .unwrap();

        let args = RunArgs {
            event: EventArgs {
                definition: path,
                event_file: None,
                event_name: Some("workflow_dispatch".to_string()),
                inputs: Vec::new(),
            },
            secrets: Vec::new(),
            vars: Vec::new(),
            workdir: Some(dir.path().to_path_buf()),
            max_parallel: None,
        };
        assert_eq!(execute(args).await.unwrap(), EXIT_TRIGGER_ERROR);
    }
}
