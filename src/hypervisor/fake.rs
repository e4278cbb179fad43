//! In-memory stand-in for `prlctl`, used by unit tests.
//!
//! Interprets the argument vectors from [`super::args`] against a map of
//! simulated VMs and records every call in order, so tests can assert on
//! exactly which commands were issued.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{CommandOutput, Hypervisor, VmRuntimeState, VmStatus};
use crate::error::FleetError;

/// How a simulated guest answers readiness probes. Poll numbers are
/// 1-based counts of address probes.
#[derive(Debug, Clone, Copy)]
pub struct GuestScript {
    pub ip_from_poll: Option<usize>,
    pub marker_from_poll: Option<usize>,
}

impl Default for GuestScript {
    fn default() -> Self {
        Self {
            ip_from_poll: Some(1),
            marker_from_poll: Some(1),
        }
    }
}

#[derive(Debug, Clone)]
struct FakeVm {
    uuid: String,
    status: VmStatus,
}

#[derive(Debug, Default)]
struct FakeState {
    vms: BTreeMap<String, FakeVm>,
    calls: Vec<Vec<String>>,
    failures: Vec<(String, String)>,
    interrupts: Vec<(String, String, CancellationToken)>,
    guests: BTreeMap<String, GuestScript>,
    ip_polls: BTreeMap<String, usize>,
    next_uuid: usize,
}

impl FakeState {
    fn add_vm(&mut self, name: &str, status: VmStatus) {
        self.next_uuid += 1;
        let uuid = format!("00000000-0000-4000-8000-{:012}", self.next_uuid);
        self.vms.insert(name.to_string(), FakeVm { uuid, status });
    }

    fn injected_failure(&self, args: &[String]) -> bool {
        let Some(sub) = args.first() else {
            return false;
        };
        self.failures
            .iter()
            .any(|(s, vm)| s == sub && args.iter().skip(1).any(|a| a == vm))
    }
}

#[derive(Debug, Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
}

fn ok() -> CommandOutput {
    CommandOutput::default()
}

fn fail(message: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: 1,
        stdout: String::new(),
        stderr: message.into(),
    }
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a VM (a template, a stale instance, ...).
    pub fn with_vm(self, name: &str, status: VmStatus) -> Self {
        self.state.lock().unwrap().add_vm(name, status);
        self
    }

    /// Make `subcommand` fail whenever it targets `vm`.
    pub fn fail_on(self, subcommand: &str, vm: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((subcommand.to_string(), vm.to_string()));
        self
    }

    /// Cancel `token` when `subcommand` targets `vm`, as if Ctrl-C arrived
    /// while that command ran. The call itself reports `Cancelled`.
    pub fn cancel_on(self, subcommand: &str, vm: &str, token: &CancellationToken) -> Self {
        self.state.lock().unwrap().interrupts.push((
            subcommand.to_string(),
            vm.to_string(),
            token.clone(),
        ));
        self
    }

    pub fn with_guest(self, vm: &str, script: GuestScript) -> Self {
        self.state
            .lock()
            .unwrap()
            .guests
            .insert(vm.to_string(), script);
        self
    }

    /// Every `run` call so far, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls whose arguments mention `vm`.
    pub fn calls_for(&self, vm: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.iter().skip(1).any(|a| a == vm))
            .collect()
    }

    /// Position of the first call with this subcommand targeting `vm`.
    pub fn position(&self, subcommand: &str, vm: &str) -> Option<usize> {
        self.calls()
            .iter()
            .position(|c| c.first().is_some_and(|s| s == subcommand) && c.iter().any(|a| a == vm))
    }

    pub fn status_of(&self, vm: &str) -> VmStatus {
        self.state
            .lock()
            .unwrap()
            .vms
            .get(vm)
            .map_or(VmStatus::NotFound, |v| v.status)
    }

    pub fn ip_polls(&self, vm: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .ip_polls
            .get(vm)
            .copied()
            .unwrap_or(0)
    }

    fn apply(state: &mut FakeState, args: &[String]) -> CommandOutput {
        let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("");
        let flag = |f: &str| {
            args.iter()
                .position(|a| a == f)
                .and_then(|i| args.get(i + 1))
                .cloned()
        };
        match arg(0) {
            "clone" | "create" | "register" => {
                let name = match arg(0) {
                    "clone" => flag("--name").unwrap_or_default(),
                    "create" => arg(1).to_string(),
                    _ => std::path::Path::new(arg(1))
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                };
                if state.vms.contains_key(&name) {
                    return fail(format!("The virtual machine '{name}' already exists."));
                }
                state.add_vm(&name, VmStatus::Stopped);
                ok()
            }
            "set" => {
                let target = arg(1).to_string();
                if !state.vms.contains_key(&target) {
                    return fail(format!("Failed to get VM config: {target}"));
                }
                if let Some(new_name) = flag("--name")
                    && let Some(vm) = state.vms.remove(&target)
                {
                    state.vms.insert(new_name, vm);
                }
                ok()
            }
            "snapshot-switch" => {
                if state.vms.contains_key(arg(1)) {
                    ok()
                } else {
                    fail("no such VM")
                }
            }
            "start" => match state.vms.get_mut(arg(1)) {
                Some(vm) => {
                    vm.status = VmStatus::Running;
                    ok()
                }
                None => fail("no such VM"),
            },
            "stop" => match state.vms.get_mut(arg(1)) {
                Some(vm) if vm.status == VmStatus::Running => {
                    vm.status = VmStatus::Stopped;
                    ok()
                }
                Some(_) => fail("The VM is not running."),
                None => fail("no such VM"),
            },
            "delete" => {
                if state.vms.remove(arg(1)).is_some() {
                    ok()
                } else {
                    fail("no such VM")
                }
            }
            other => fail(format!("fake: unsupported subcommand {other}")),
        }
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn run(&self, args: &[String]) -> Result<CommandOutput, FleetError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(args.to_vec());
        let sub = args.first().map(String::as_str).unwrap_or("");
        if let Some((_, _, token)) = state
            .interrupts
            .iter()
            .find(|(s, vm, _)| s == sub && args.iter().skip(1).any(|a| a == vm))
        {
            token.cancel();
            return Err(FleetError::Cancelled {
                what: super::render_command("prlctl", args),
            });
        }
        if state.injected_failure(args) {
            return Ok(fail("injected failure"));
        }
        Ok(Self::apply(&mut state, args))
    }

    async fn query(&self, name: &str) -> Result<VmRuntimeState, FleetError> {
        let state = self.state.lock().unwrap();
        Ok(match state.vms.get(name) {
            Some(vm) => VmRuntimeState {
                status: vm.status,
                uuid: Some(vm.uuid.clone()),
                ip: None,
            },
            None => VmRuntimeState::not_found(),
        })
    }

    async fn exec_in_guest(
        &self,
        name: &str,
        command: &str,
    ) -> Result<CommandOutput, FleetError> {
        let mut state = self.state.lock().unwrap();
        let running = state
            .vms
            .get(name)
            .is_some_and(|vm| vm.status == VmStatus::Running);
        if !running {
            return Ok(CommandOutput {
                code: 255,
                stdout: String::new(),
                stderr: "VM is not running".into(),
            });
        }
        let script = state.guests.get(name).copied().unwrap_or_default();
        let reached = |from: Option<usize>, polls: usize| from.is_some_and(|n| polls >= n);

        if command.starts_with("ip -4") {
            let polls = state.ip_polls.entry(name.to_string()).or_insert(0);
            *polls += 1;
            if reached(script.ip_from_poll, *polls) {
                return Ok(CommandOutput {
                    code: 0,
                    stdout: "2: enp0s5    inet 10.211.55.20/24 brd 10.211.55.255 scope global enp0s5\n"
                        .into(),
                    stderr: String::new(),
                });
            }
            return Ok(fail("Network is unreachable"));
        }
        if command.starts_with("test -f") {
            let polls = state.ip_polls.get(name).copied().unwrap_or(0);
            return Ok(if reached(script.marker_from_poll, polls) {
                ok()
            } else {
                fail("")
            });
        }
        Ok(fail(format!("fake: unsupported guest command {command}")))
    }
}
