//! Debugger commands run as one child process per command

use async_trait::async_trait;
use postmortem_core::{CommandExecutor, ExecutorConfig, ExecutorError};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    target: PathBuf,
}

impl ProcessExecutor {
    pub fn new(config: &ExecutorConfig, target: impl Into<PathBuf>) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            target: target.into(),
        }
    }

    fn command_args(&self, command: &str) -> Vec<String> {
        let target = self.target.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{target}", &target).replace("{command}", command))
            .collect()
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<String, ExecutorError> {
        let args = self.command_args(command);
        debug!(program = %self.program, ?args, "spawning debugger");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::unavailable(format!("cannot start {}: {}", self.program, e)))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ExecutorError::unavailable(format!("{} failed: {}", self.program, e))),
            Err(_) => return Err(ExecutorError::timeout(format!("`{}` exceeded {:?}", command, timeout))),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::failed(format!(
                "`{}` exited with {}: {}",
                command,
                output.status,
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postmortem_core::ExecutorErrorKind;

    fn config(program: &str, args: &[&str]) -> ExecutorConfig {
        ExecutorConfig {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn test_args_substitution() {
        let executor = ProcessExecutor::new(&ExecutorConfig::new(), "/dumps/app.dmp");
        assert_eq!(
            executor.command_args("!threads"),
            vec!["-z", "/dumps/app.dmp", "-c", "!threads; q"]
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let mut executor = ProcessExecutor::new(&config("postmortem-no-such-debugger", &["{command}"]), "x.dmp");
        let err = executor.execute("!threads", Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind, ExecutorErrorKind::Unavailable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_command() {
        let mut executor = ProcessExecutor::new(&config("echo", &["{target}", "{command}"]), "x.dmp");
        let output = executor.execute("!eeversion", Duration::from_secs(5)).await.unwrap();
        assert_eq!(output, "x.dmp !eeversion\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_command_times_out() {
        let mut executor = ProcessExecutor::new(&config("sleep", &["{command}"]), "x.dmp");
        let err = executor.execute("5", Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err.kind, ExecutorErrorKind::Timeout);
    }
}
