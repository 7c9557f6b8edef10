//! Bounded execution of external query commands

use super::SourceError;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Runs a program with fixed arguments and returns its stdout.
///
/// The child is killed if the timeout elapses before it exits.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: PathBuf,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn program(&self) -> String {
        self.program.display().to_string()
    }

    pub async fn run(&self, args: &[&str]) -> Result<String, SourceError> {
        let program = self.program();
        let started = tokio::time::Instant::now();

        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(SourceError::Spawn { program, source }),
            Err(_) => {
                return Err(SourceError::Timeout {
                    program,
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(SourceError::ExitStatus {
                program,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!(
            program = %program,
            elapsed_ms = started.elapsed().as_millis(),
            bytes = output.stdout.len(),
            "Query command finished"
        );

        String::from_utf8(output.stdout).map_err(|_| SourceError::InvalidOutput { program })
    }
}
