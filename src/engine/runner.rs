//! Rule command execution

use crate::error::{ManuError, ManuResult};
use crate::graph::Rule;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Lines of command output kept in failure messages
const ERROR_TAIL_LINES: usize = 20;

/// Build an error message from the tail of a command's output
pub(crate) fn build_error_output(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let total = lines.len();
    let tail: Vec<&str> = if total > ERROR_TAIL_LINES {
        lines[total - ERROR_TAIL_LINES..].to_vec()
    } else {
        lines
    };
    tail.join("\n")
}

/// Runs the step behind a rule
#[async_trait]
pub trait RuleRunner: Send + Sync {
    /// Produce the rule's outputs under `root`
    async fn run(&self, rule: &Rule, root: &Path) -> ManuResult<()>;
}

/// Runs rule commands through a shell
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl RuleRunner for ShellRunner {
    async fn run(&self, rule: &Rule, root: &Path) -> ManuResult<()> {
        let Some(command) = &rule.command else {
            debug!("{} has no command", rule.id);
            return Ok(());
        };

        info!("Running {}: {}", rule.id, command);
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(root)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ManuError::command_failed(format!("{} -c {}", self.shell, command), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let tail = build_error_output(&stdout, &stderr);
            return Err(ManuError::rule_failed(
                &rule.id,
                if tail.is_empty() {
                    format!("command exited with {}", code)
                } else {
                    format!("command exited with {}:\n{}", code, tail)
                },
            ));
        }

        debug!("{} finished ({} bytes of output)", rule.id, stdout.len() + stderr.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn error_output_keeps_tail() {
        let stdout: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let out = build_error_output(&stdout, "boom");
        assert_eq!(out.lines().count(), ERROR_TAIL_LINES);
        assert!(out.ends_with("boom"));
        assert!(!out.contains("line 0\n"));
    }

    #[tokio::test]
    async fn shell_runner_runs_in_root() {
        let dir = TempDir::new().unwrap();
        let rule = Rule::new("w", &[], &["out.txt"], "h").with_command("echo hi > out.txt");

        ShellRunner::default().run(&rule, dir.path()).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hi\n");
    }

    #[tokio::test]
    async fn failing_command_reports_output() {
        let dir = TempDir::new().unwrap();
        let rule = Rule::new("bad", &[], &[], "h").with_command("echo oops >&2; exit 3");

        let err = ShellRunner::default().run(&rule, dir.path()).await.unwrap_err();
        match err {
            ManuError::RuleExecution { rule, reason } => {
                assert_eq!(rule, "bad");
                assert!(reason.contains("exited with 3"));
                assert!(reason.contains("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn rule_without_command_is_noop() {
        let dir = TempDir::new().unwrap();
        let rule = Rule::new("noop", &[], &[], "h");
        ShellRunner::default().run(&rule, dir.path()).await.unwrap();
    }
}
