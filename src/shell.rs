//! Built-in `"shell"` language: each request runs through `sh -c`.

use std::process::Command;

use crate::evaluator::{EvalError, Evaluation, Evaluator};
use crate::relay::OutputRelay;

/// Evaluator that hands the request text to the system shell.
///
/// Stdout (trailing newline trimmed) is the result. A non-zero exit status
/// is an evaluation error carrying stderr. Stderr printed by a successful
/// command is published to the attached relay, if any.
#[derive(Debug, Clone, Default)]
pub struct ShellEvaluator {
    shell: String,
    relay: Option<OutputRelay>,
}

impl ShellEvaluator {
    /// Evaluator using `sh`.
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            relay: None,
        }
    }

    /// Use a different POSIX shell binary.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Publish stderr of successful commands to `relay`.
    #[must_use]
    pub fn with_relay(mut self, relay: OutputRelay) -> Self {
        self.relay = Some(relay);
        self
    }
}

impl Evaluator for ShellEvaluator {
    fn evaluate(&self, source: &str) -> Result<Evaluation, EvalError> {
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(source)
            .output()
            .map_err(|e| EvalError::new(format!("Failed to run {}: {e}", self.shell)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let stderr = stderr.trim_end();
            return Err(if stderr.is_empty() {
                EvalError::new(format!("Command failed: {}", output.status))
            } else {
                EvalError::new(stderr)
            });
        }

        if let Some(relay) = &self.relay {
            for line in stderr.lines() {
                relay.publish(line);
            }
        }

        let value = stdout.strip_suffix('\n').unwrap_or(&stdout).to_string();
        Ok(Evaluation::value(value))
    }

    /// `prefix 'line'` with the line single-quoted for `sh`.
    fn apply_prefix(&self, prefix: &str, line: &str) -> String {
        format!("{prefix} '{}'", line.replace('\'', r"'\''"))
    }
}
