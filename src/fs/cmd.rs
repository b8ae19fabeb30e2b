use std::process::Stdio;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// Exit code and captured output of a finished external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    fn describe(&self, cmd: &Command) -> String {
        format!(
            "\ncmd: {:?}\nexit code: {}\nstdout: {}\nstderr: {}",
            cmd.as_std(),
            self.code,
            indent(&String::from_utf8_lossy(&self.stdout)),
            indent(&String::from_utf8_lossy(&self.stderr)),
        )
    }
}

fn indent(s: &str) -> String {
    if s.trim_end().contains('\n') {
        format!("(multi-line)\n\t{}", s.trim_end().replace('\n', "\n\t"))
    } else {
        s.trim_end().to_owned()
    }
}

#[async_trait]
pub trait CheckCommandOutput {
    /// Run to completion and fail unless the exit code is zero.
    async fn run(&mut self) -> Result<Vec<u8>>;

    /// Run to completion and let `f` judge the outcome.
    async fn run_with_status_checker<R: Send>(
        &mut self,
        f: impl for<'a> Fn(&'a CommandOutput) -> Result<R> + Send + Sync,
    ) -> Result<R>;
}

#[async_trait]
impl CheckCommandOutput for Command {
    async fn run(&mut self) -> Result<Vec<u8>> {
        self.run_with_status_checker(|output| {
            if output.code != 0 {
                Err(anyhow!("Bad exit code {}", output.code))
            } else {
                Ok(output.stdout.clone())
            }
        })
        .await
    }

    async fn run_with_status_checker<R: Send>(
        &mut self,
        f: impl for<'a> Fn(&'a CommandOutput) -> Result<R> + Send + Sync,
    ) -> Result<R> {
        self.env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::trace!(cmd=?self.as_std(), "run external cmd");

        let output = self
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {:?}", self.as_std()))?;

        let output = CommandOutput {
            code: output
                .status
                .code()
                .with_context(|| format!("{:?} killed by signal", self.as_std()))?,
            stdout: output.stdout,
            stderr: output.stderr,
        };

        f(&output).with_context(|| output.describe(self))
    }
}
