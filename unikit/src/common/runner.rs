use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use log::{debug, LevelFilter};
use tokio::process::Command;

/// Capability for invoking external processes (git, docker, buildctl).
///
/// Backends and builders never spawn processes directly; they hold a
/// runner so tests can substitute a fake that scripts the outputs.
#[async_trait]
pub trait CommandRunner: Debug + Send + Sync {
    /// Run the program to completion and capture stdout.
    async fn output(&self, program: &str, args: &[String]) -> Result<Vec<u8>>;

    /// Run the program to completion. Tool output reaches the terminal
    /// only under verbose logging.
    async fn run(&self, program: &str, args: &[String]) -> Result<()>;

    /// Like [`CommandRunner::run`] with extra environment variables and
    /// an optional working directory.
    async fn run_in(
        &self,
        program: &str,
        args: &[String],
        envs: &HashMap<String, String>,
        current_dir: Option<&Path>,
    ) -> Result<()>;
}

/// The production runner: resolves the program on `$PATH` and executes
/// it on the host.
#[derive(Debug, Default)]
pub struct HostRunner;

impl HostRunner {
    fn command(&self, program: &str, args: &[String]) -> Result<Command> {
        let path = which::which(program)
            .context(format!("Unable to find '{program}' in the search path"))?;
        let mut cmd = Command::new(path);
        cmd.args(args);
        Ok(cmd)
    }

    /// Execute a prepared command. At `warn` and quieter the tool's
    /// output is captured and surfaced only when it fails; under more
    /// verbose logging it streams straight to the terminal, which is
    /// what users want while an image build or clone is running.
    async fn dispatch(&self, program: &str, mut cmd: Command) -> Result<()> {
        debug!("running: {cmd:?}");
        if log::max_level() <= LevelFilter::Warn {
            let output = cmd
                .output()
                .await
                .context(format!("Unable to start '{program}'"))?;
            ensure!(
                output.status.success(),
                "'{program}' exited with {}:\n{}{}",
                output.status.code().unwrap_or(1),
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        } else {
            let status = cmd
                .status()
                .await
                .context(format!("Unable to start '{program}'"))?;
            ensure!(
                status.success(),
                "'{program}' exited with {}",
                status.code().unwrap_or(1)
            );
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for HostRunner {
    async fn output(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        let mut cmd = self.command(program, args)?;
        let output = cmd
            .output()
            .await
            .context(format!("Unable to start '{program}'"))?;
        ensure!(
            output.status.success(),
            "'{program} {}' was unsuccessful, exit code {}:\n{}",
            args.join(" "),
            output.status.code().unwrap_or(1),
            String::from_utf8_lossy(&output.stderr)
        );
        Ok(output.stdout)
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<()> {
        let cmd = self.command(program, args)?;
        self.dispatch(program, cmd).await
    }

    async fn run_in(
        &self,
        program: &str,
        args: &[String],
        envs: &HashMap<String, String>,
        current_dir: Option<&Path>,
    ) -> Result<()> {
        let mut cmd = self.command(program, args)?;
        cmd.envs(envs);
        if let Some(dir) = current_dir {
            cmd.current_dir(dir);
        }
        self.dispatch(program, cmd).await
    }
}
