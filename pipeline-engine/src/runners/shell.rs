// Shell Runner
// Executes script steps through bash, sh, pwsh, python or a custom shell template

use crate::error::ExecutionError;
use crate::runners::{LogLine, StepCommand, StepOutcome, StepRequest, StepRunner};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Environment variable naming the step's output file
pub const OUTPUT_FILE_ENV: &str = "GITHUB_OUTPUT";

/// How long to keep draining output after the child was killed
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// A shell invocation with `{0}` standing for the script file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTemplate {
    pub program: String,
    pub args: Vec<String>,
    /// Extension given to the script file
    pub extension: &'static str,
}

impl ShellTemplate {
    fn new(program: &str, args: &[&str], extension: &'static str) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            extension,
        }
    }

    /// Resolve a `shell:` value to its invocation
    pub fn resolve(shell: &str) -> Self {
        match shell.trim() {
            "bash" => Self::new("bash", &["--noprofile", "--norc", "-eo", "pipefail", "{0}"], "sh"),
            "sh" => Self::new("sh", &["-e", "{0}"], "sh"),
            "pwsh" => Self::new("pwsh", &["-NoLogo", "-NoProfile", "-NonInteractive", "-Command", ". '{0}'"], "ps1"),
            "powershell" => Self::new("powershell", &["-NoLogo", "-NoProfile", "-NonInteractive", "-Command", ". '{0}'"], "ps1"),
            "python" => Self::new("python", &["{0}"], "py"),
            custom => {
                let mut parts = custom.split_whitespace();
                let program = parts.next().unwrap_or("sh").to_string();
                let mut args: Vec<String> = parts.map(str::to_string).collect();
                if !args.iter().any(|a| a.contains("{0}")) {
                    args.push("{0}".to_string());
                }
                Self {
                    program,
                    args,
                    extension: "",
                }
            }
        }
    }

    /// Arguments with the script path substituted
    pub fn args_for(&self, script: &Path) -> Vec<String> {
        let path = script.to_string_lossy();
        self.args.iter().map(|a| a.replace("{0}", &path)).collect()
    }
}

/// Runs steps as local child processes
#[derive(Debug, Clone)]
pub struct ShellRunner {
    /// Shell used when a step names none
    default_shell: String,
    /// Where script and output files are written
    scratch_dir: PathBuf,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            default_shell: "bash".to_string(),
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_default_shell(mut self, shell: impl Into<String>) -> Self {
        self.default_shell = shell.into();
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Execute a script step
    pub async fn run_script(
        &self,
        script: &str,
        shell: Option<&str>,
        request: &StepRequest,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, ExecutionError> {
        let template = ShellTemplate::resolve(shell.unwrap_or(&self.default_shell));
        let id = uuid::Uuid::new_v4();

        let mut script_path = self.scratch_dir.join(format!("gantry-step-{}", id));
        if !template.extension.is_empty() {
            script_path.set_extension(template.extension);
        }
        let output_path = self.scratch_dir.join(format!("gantry-output-{}", id));

        tokio::fs::write(&script_path, script).await?;
        tokio::fs::write(&output_path, "").await?;

        let result = self
            .spawn_and_wait(&template, &script_path, &output_path, request, cancel)
            .await;

        let _ = tokio::fs::remove_file(&script_path).await;
        let _ = tokio::fs::remove_file(&output_path).await;
        result
    }

    async fn spawn_and_wait(
        &self,
        template: &ShellTemplate,
        script_path: &Path,
        output_path: &Path,
        request: &StepRequest,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, ExecutionError> {
        let mut cmd = Command::new(&template.program);
        cmd.args(template.args_for(script_path));
        cmd.current_dir(&request.working_dir);
        cmd.envs(&request.env);
        cmd.env(OUTPUT_FILE_ENV, output_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(
            instance = %request.instance,
            step = request.step_index,
            program = %template.program,
            "spawning step process"
        );

        let mut child = cmd.spawn().map_err(|source| ExecutionError::Spawn {
            command: template.program.clone(),
            source,
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Collaborator("stdout was not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutionError::Collaborator("stderr was not captured".into()))?;
        let readers = [
            read_lines(stdout, false, tx.clone()),
            read_lines(stderr, true, tx),
        ];

        let timeout = request.timeout;
        let expired = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let mut outcome = StepOutcome::default();
        let status: Option<ExitStatus> = tokio::select! {
            status = child.wait() => Some(status?),
            _ = expired => {
                warn!(instance = %request.instance, step = request.step_index, "step timed out");
                outcome.timed_out = true;
                None
            }
            _ = cancel.cancelled() => {
                info!(instance = %request.instance, step = request.step_index, "step cancelled");
                outcome.cancelled = true;
                None
            }
        };

        if status.is_none() {
            let _ = child.kill().await;
        }

        for reader in readers {
            if status.is_some() {
                let _ = reader.await;
            } else if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                // a grandchild may still hold the pipe open
                debug!("abandoning output reader");
            }
        }
        while let Ok(line) = rx.try_recv() {
            outcome.logs.push(line);
        }

        outcome.exit_code = status.and_then(|s| s.code());

        let contents = tokio::fs::read_to_string(output_path)
            .await
            .unwrap_or_default();
        outcome.outputs = parse_output_file(&contents);
        for line in outcome.logs.iter().filter(|l| !l.is_error) {
            if let Some((name, value)) = parse_set_output(&line.text) {
                outcome.outputs.entry(name).or_insert(value);
            }
        }

        Ok(outcome)
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StepRunner for ShellRunner {
    async fn run_step(
        &self,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, ExecutionError> {
        match &request.command {
            StepCommand::Script { script, shell } => {
                self.run_script(script, shell.as_deref(), &request, cancel)
                    .await
            }
            StepCommand::Action { uses, .. } => {
                info!(instance = %request.instance, uses = %uses, "remote action not executed locally");
                Ok(StepOutcome::success()
                    .with_log(LogLine::stdout(format!("skipping remote action {}", uses))))
            }
        }
    }
}

fn read_lines<R>(stream: R, is_error: bool, tx: mpsc::UnboundedSender<LogLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            if tx.send(LogLine { text, is_error }).is_err() {
                break;
            }
        }
    })
}

/// Parse an output file: `name=value` lines and `name<<DELIM` heredocs
pub fn parse_output_file(contents: &str) -> BTreeMap<String, String> {
    let mut outputs = BTreeMap::new();
    let mut lines = contents.lines();

    while let Some(line) = lines.next() {
        if let Some((name, delimiter)) = line.split_once("<<") {
            let delimiter = delimiter.trim();
            let mut value = Vec::new();
            for body in lines.by_ref() {
                if body == delimiter {
                    break;
                }
                value.push(body);
            }
            outputs.insert(name.trim().to_string(), value.join("\n"));
        } else if let Some((name, value)) = line.split_once('=') {
            let name = name.trim();
            if !name.is_empty() {
                outputs.insert(name.to_string(), value.to_string());
            }
        }
    }

    outputs
}

/// Legacy `::set-output name=<name>::<value>` workflow command
fn parse_set_output(line: &str) -> Option<(String, String)> {
    let rest = line.trim_start().strip_prefix("::set-output name=")?;
    let (name, value) = rest.split_once("::")?;
    Some((name.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::state::InstanceId;

    fn request(script: &str) -> StepRequest {
        StepRequest {
            instance: InstanceId::job("build"),
            step_index: 0,
            step_name: "test".to_string(),
            command: StepCommand::Script {
                script: script.to_string(),
                shell: Some("sh".to_string()),
            },
            working_dir: std::env::current_dir().unwrap(),
            env: BTreeMap::new(),
            timeout: None,
            runs_on: None,
        }
    }

    fn stdout_text(outcome: &StepOutcome) -> String {
        outcome
            .logs
            .iter()
            .filter(|l| !l.is_error)
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn test_shell_runner_echo() {
        let runner = ShellRunner::new();
        let outcome = runner
            .run_step(request("echo hello"), CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert!(stdout_text(&outcome).contains("hello"));
    }

    #[tokio::test]
    async fn test_shell_runner_with_env() {
        let runner = ShellRunner::new();
        let mut req = request("echo $MY_VAR");
        req.env.insert("MY_VAR".to_string(), "test_value".to_string());

        let outcome = runner.run_step(req, CancellationToken::new()).await.unwrap();
        assert!(stdout_text(&outcome).contains("test_value"));
    }

    #[tokio::test]
    async fn test_shell_runner_exit_code() {
        let runner = ShellRunner::new();
        let outcome = runner
            .run_step(request("exit 42"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, Some(42));
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_shell_runner_stderr() {
        let runner = ShellRunner::new();
        let outcome = runner
            .run_step(request("echo error >&2"), CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert!(outcome.logs.iter().any(|l| l.is_error && l.text == "error"));
    }

    #[tokio::test]
    async fn test_shell_runner_output_file() {
        let runner = ShellRunner::new();
        let outcome = runner
            .run_step(
                request("echo \"version=1.2.3\" >> \"$GITHUB_OUTPUT\""),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.outputs.get("version").map(String::as_str), Some("1.2.3"));
    }

    #[tokio::test]
    async fn test_shell_runner_timeout() {
        let runner = ShellRunner::new();
        let mut req = request("sleep 5");
        req.timeout = Some(Duration::from_millis(100));

        let outcome = runner.run_step(req, CancellationToken::new()).await.unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_shell_runner_cancellation() {
        let runner = ShellRunner::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = runner.run_step(request("sleep 5"), cancel).await.unwrap();
        assert!(outcome.cancelled);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let runner = ShellRunner::new();
        let mut req = request("true");
        req.command = StepCommand::Script {
            script: "true".to_string(),
            shell: Some("definitely-not-a-shell-binary {0}".to_string()),
        };

        let result = runner.run_step(req, CancellationToken::new()).await;
        assert!(matches!(result, Err(ExecutionError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_remote_action_is_reported_as_success() {
        let runner = ShellRunner::new();
        let mut req = request("");
        req.command = StepCommand::Action {
            uses: "actions/checkout@v4".to_string(),
            with: BTreeMap::new(),
        };

        let outcome = runner.run_step(req, CancellationToken::new()).await.unwrap();
        assert!(outcome.is_success());
    }

    #[test]
    fn test_parse_output_file_heredoc() {
        let contents = "a=1\nnotes<<EOF\nline one\nline two\nEOF\nb=x=y\n";
        let outputs = parse_output_file(contents);

        assert_eq!(outputs["a"], "1");
        assert_eq!(outputs["notes"], "line one\nline two");
        assert_eq!(outputs["b"], "x=y");
    }

    #[test]
    fn test_parse_set_output() {
        assert_eq!(
            parse_set_output("::set-output name=tag::v1"),
            Some(("tag".to_string(), "v1".to_string()))
        );
        assert_eq!(parse_set_output("plain line"), None);
    }

    #[test]
    fn test_shell_templates() {
        let bash = ShellTemplate::resolve("bash");
        assert_eq!(bash.program, "bash");
        assert_eq!(
            bash.args_for(Path::new("/tmp/s.sh")),
            vec!["--noprofile", "--norc", "-eo", "pipefail", "/tmp/s.sh"]
        );

        let custom = ShellTemplate::resolve("perl {0}");
        assert_eq!(custom.program, "perl");
        assert_eq!(custom.args_for(Path::new("x")), vec!["x"]);

        let bare = ShellTemplate::resolve("zsh");
        assert_eq!(bare.args_for(Path::new("x")), vec!["x"]);
    }
}
