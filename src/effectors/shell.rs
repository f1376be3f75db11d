//! Shell command execution through the platform shell.

use std::process::Command;

use tracing::debug;

use super::{EffectorError, ShellBackend, ShellOutput};

/// Runs commands with `cmd /C` on Windows and `sh -c` elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShell;

impl SystemShell {
    fn command(line: &str) -> Command {
        if cfg!(target_os = "windows") {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", line]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", line]);
            cmd
        }
    }
}

impl ShellBackend for SystemShell {
    fn run(&self, command: &str) -> Result<ShellOutput, EffectorError> {
        let output = Self::command(command).output()?;
        let result = ShellOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(
            status = ?result.status,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            "Shell command finished"
        );
        Ok(result)
    }
}
