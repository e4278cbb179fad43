//! Hypervisor control interface.
//!
//! Every fact about a VM instance is re-read from the hypervisor through
//! [`Hypervisor::query`]; nothing here caches state between calls. Mutating
//! operations are plain argument vectors (see [`args`]) dispatched through
//! [`Hypervisor::run`], so a fake implementation can stand in for `prlctl`.

pub mod args;
pub mod prlctl;

#[cfg(test)]
pub mod fake;

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::FleetError;

pub use prlctl::PrlctlClient;

/// Captured result of one control-tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Observed power state of a VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    NotFound,
    Stopped,
    Running,
    Suspended,
    Unknown,
}

impl VmStatus {
    /// Map a status word as printed by `prlctl list`.
    pub fn from_prlctl(word: &str) -> Self {
        match word.trim().to_ascii_lowercase().as_str() {
            "running" => VmStatus::Running,
            "stopped" => VmStatus::Stopped,
            "suspended" | "paused" => VmStatus::Suspended,
            _ => VmStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::NotFound => "not found",
            VmStatus::Stopped => "stopped",
            VmStatus::Running => "running",
            VmStatus::Suspended => "suspended",
            VmStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts about a named VM instance, freshly queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRuntimeState {
    pub status: VmStatus,
    pub uuid: Option<String>,
    pub ip: Option<Ipv4Addr>,
}

impl VmRuntimeState {
    pub fn not_found() -> Self {
        Self {
            status: VmStatus::NotFound,
            uuid: None,
            ip: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.status != VmStatus::NotFound
    }
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Program name used when rendering commands in errors and logs.
    fn program(&self) -> &str {
        "prlctl"
    }

    /// Run the control tool with `args`. A nonzero exit is returned as
    /// output, not as an error; only failing to run the tool at all is `Err`.
    async fn run(&self, args: &[String]) -> Result<CommandOutput, FleetError>;

    /// Query the current state of `name`.
    async fn query(&self, name: &str) -> Result<VmRuntimeState, FleetError>;

    /// Run a shell command inside the guest. Nonzero exits are expected
    /// while the guest is still booting.
    async fn exec_in_guest(&self, name: &str, command: &str)
    -> Result<CommandOutput, FleetError>;

    async fn exists(&self, name: &str) -> Result<bool, FleetError> {
        Ok(self.query(name).await?.exists())
    }

    /// Run a mutating command; a nonzero exit becomes
    /// [`FleetError::HypervisorCommand`].
    async fn mutate(&self, args: &[String]) -> Result<CommandOutput, FleetError> {
        let output = self.run(args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(FleetError::HypervisorCommand {
                command: render_command(self.program(), args),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Render a command line for messages.
pub fn render_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            line.push('"');
            line.push_str(arg);
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }
    line
}

/// Extract the first global-scope IPv4 address from `ip -4 -o addr` output.
pub fn parse_guest_ipv4(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            if word == "inet" {
                let addr = words.next()?;
                let addr = addr.split('/').next()?;
                return addr
                    .parse::<Ipv4Addr>()
                    .ok()
                    .filter(|ip| !ip.is_loopback() && !ip.is_link_local());
            }
        }
        None
    })
}
