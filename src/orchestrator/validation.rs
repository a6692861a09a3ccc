// Shell-command validation of an agent's workspace

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::traits::{ValidationReport, Validator};

/// Longest slice of a failing command's output kept in an issue
const MAX_ISSUE_OUTPUT: usize = 2000;

/// Runs each command with `sh -c` inside the workspace; every failure is an issue
pub struct CommandValidator {
    commands: Vec<String>,
}

impl CommandValidator {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }
}

fn tail(output: &str) -> &str {
    let trimmed = output.trim();
    if trimmed.len() <= MAX_ISSUE_OUTPUT {
        return trimmed;
    }
    let mut start = trimmed.len() - MAX_ISSUE_OUTPUT;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

#[async_trait]
impl Validator for CommandValidator {
    async fn validate(&self, workspace: &Path) -> ValidationReport {
        let mut issues = Vec::new();

        for command in &self.commands {
            debug!(command = %command, workspace = %workspace.display(), "Running validation command");
            let output = Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(workspace)
                .output()
                .await;

            match output {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    let detail = if stderr.trim().is_empty() {
                        tail(&stdout)
                    } else {
                        tail(&stderr)
                    };
                    let code = output
                        .status
                        .code()
                        .map_or_else(|| "signal".to_string(), |code| code.to_string());
                    issues.push(format!("`{command}` failed ({code}): {detail}"));
                }
                Err(e) => issues.push(format!("`{command}` could not be started: {e}")),
            }
        }

        info!(
            workspace = %workspace.display(),
            commands = self.commands.len(),
            failures = issues.len(),
            "Validation finished"
        );
        if issues.is_empty() {
            ValidationReport::pass()
        } else {
            ValidationReport::fail(issues)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_commands_pass() {
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("marker"), "ok").unwrap();
        let validator = CommandValidator::new(vec!["test -f marker".to_string(), "true".to_string()]);
        assert_eq!(validator.validate(workspace.path()).await, ValidationReport::pass());
    }

    #[tokio::test]
    async fn test_failures_become_issues() {
        let workspace = tempfile::tempdir().unwrap();
        let validator = CommandValidator::new(vec![
            "echo 'error[E0308]: mismatched types' >&2; exit 101".to_string(),
            "true".to_string(),
            "exit 1".to_string(),
        ]);
        let report = validator.validate(workspace.path()).await;
        assert!(!report.passed);
        assert_eq!(report.issues.len(), 2);
        assert!(report.issues[0].contains("(101)"));
        assert!(report.issues[0].contains("mismatched types"));
    }

    #[test]
    fn test_long_output_keeps_the_tail() {
        let long = format!("{}END", "x".repeat(MAX_ISSUE_OUTPUT * 2));
        let kept = tail(&long);
        assert_eq!(kept.len(), MAX_ISSUE_OUTPUT);
        assert!(kept.ends_with("END"));
    }
}
