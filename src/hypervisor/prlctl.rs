use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{CommandOutput, Hypervisor, VmRuntimeState, VmStatus, args, render_command};
use crate::error::FleetError;

/// Drives the Parallels `prlctl` command-line tool.
///
/// Stateless apart from its settings: each call spawns one process and
/// waits for it. The child is killed if the cancellation token fires or the
/// per-command timeout elapses.
#[derive(Debug, Clone)]
pub struct PrlctlClient {
    program: String,
    command_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl PrlctlClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            command_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn execute(&self, args: &[String]) -> Result<CommandOutput, FleetError> {
        tracing::debug!(command = %render_command(&self.program, args), "running");

        let child = tokio::process::Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FleetError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|source| FleetError::Io {
                context: format!("waiting for {}", render_command(&self.program, args)),
                source,
            })?,
            _ = self.cancel.cancelled() => {
                return Err(FleetError::Cancelled {
                    what: render_command(&self.program, args),
                });
            }
            _ = deadline(self.command_timeout) => {
                let secs = self.command_timeout.unwrap_or_default().as_secs();
                tracing::warn!(command = %render_command(&self.program, args), secs, "command timed out");
                return Ok(CommandOutput {
                    code: -1,
                    stdout: String::new(),
                    stderr: format!("timed out after {secs}s"),
                });
            }
        };

        let result = CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success() {
            tracing::debug!(
                command = %render_command(&self.program, args),
                code = result.code,
                stderr = %result.stderr.trim(),
                "command exited nonzero"
            );
        }
        Ok(result)
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending::<()>().await,
    }
}

#[async_trait]
impl Hypervisor for PrlctlClient {
    fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, args: &[String]) -> Result<CommandOutput, FleetError> {
        self.execute(args).await
    }

    async fn query(&self, name: &str) -> Result<VmRuntimeState, FleetError> {
        let list = args::list_all();
        let output = self.execute(&list).await?;
        if !output.success() {
            return Err(FleetError::HypervisorCommand {
                command: render_command(&self.program, &list),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(parse_list(&output.stdout, name))
    }

    async fn exec_in_guest(
        &self,
        name: &str,
        command: &str,
    ) -> Result<CommandOutput, FleetError> {
        self.execute(&args::exec(name, command)).await
    }
}

/// Find `name` in `prlctl list --output uuid,status,ip,name` output.
///
/// The name column is last so names containing spaces survive the split.
pub fn parse_list(output: &str, name: &str) -> VmRuntimeState {
    for line in output.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 4 || cols[3..].join(" ") != name {
            continue;
        }
        let uuid = cols[0].trim_matches(|c| c == '{' || c == '}');
        return VmRuntimeState {
            status: VmStatus::from_prlctl(cols[1]),
            uuid: (!uuid.is_empty()).then(|| uuid.to_string()),
            ip: cols[2]
                .split(',')
                .find_map(|candidate| candidate.trim().parse::<Ipv4Addr>().ok()),
        };
    }
    VmRuntimeState::not_found()
}
