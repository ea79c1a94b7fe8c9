use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured result of a finished host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external tools for a driver.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion. An `Err` means it could not be spawned;
    /// a non-zero exit is reported through [`CommandOutput::code`].
    async fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> io::Result<CommandOutput>;
}

/// Spawns real processes on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCommandRunner;

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> io::Result<CommandOutput> {
        tracing::debug!(program, args = ?args, "running host command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes()).await?;
            // Closing the pipe signals EOF.
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let out = HostCommandRunner
            .run("sh", &["-c", "echo out; echo err >&2; exit 3"], None)
            .await
            .unwrap();

        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let out = HostCommandRunner.run("cat", &[], Some("<domain/>")).await.unwrap();

        assert!(out.success());
        assert_eq!(out.stdout, "<domain/>");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = HostCommandRunner
            .run("definitely-not-a-real-tool-4821", &[], None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
