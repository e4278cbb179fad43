//! Final per-VM records, their on-disk JSON snapshots, and the aggregate
//! fleet report.

use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::FleetError;
use crate::hypervisor::{VmRuntimeState, VmStatus};
use crate::paths;
use crate::vm::Hardware;

/// Externally visible record for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionResult {
    pub name: String,
    pub status: VmStatus,
    pub uuid: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub sizing: Hardware,
}

impl ProvisionResult {
    pub fn from_state(name: &str, sizing: Hardware, state: &VmRuntimeState) -> Self {
        Self {
            name: name.to_string(),
            status: state.status,
            uuid: state.uuid.clone(),
            ip: state.ip,
            sizing,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            name: self.name.clone(),
            status: self.status.as_str().to_string(),
            ip: self.ip.map(|ip| ip.to_string()),
            uuid: self.uuid.clone(),
            cpus: self.sizing.cpus,
            memory: self.sizing.memory_mib,
            disk_size: self.sizing.disk_gib,
        }
    }
}

/// Contents of `status.json`. `memory` is MiB, `disk_size` is GiB.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct StatusSnapshot {
    pub name: String,
    pub status: String,
    pub ip: Option<String>,
    pub uuid: Option<String>,
    pub cpus: u32,
    pub memory: u64,
    pub disk_size: u64,
}

pub fn write_snapshot(state_dir: &Path, result: &ProvisionResult) -> Result<PathBuf, FleetError> {
    let path = paths::status_path(state_dir, &result.name);
    let json = facet_json::to_string(&result.snapshot()).map_err(|e| FleetError::Serialize {
        what: format!("status of '{}'", result.name),
        message: e.to_string(),
    })?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| FleetError::Io {
            context: format!("creating directory {}", parent.display()),
            source,
        })?;
    }
    std::fs::write(&path, json).map_err(|source| FleetError::Io {
        context: format!("writing {}", path.display()),
        source,
    })?;
    Ok(path)
}

/// Best-effort removal of a VM's snapshot file.
pub fn remove_snapshot(state_dir: &Path, name: &str) {
    let path = paths::status_path(state_dir, name);
    if let Err(e) = std::fs::remove_file(&path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove status snapshot");
    }
}

/// One line per VM: name, status, address, UUID.
pub fn render_status_table(results: &[ProvisionResult]) -> String {
    let width = results.iter().map(|r| r.name.len()).max().unwrap_or(0);
    let mut out = String::new();
    for r in results {
        let ip = r.ip.map_or_else(|| "-".to_string(), |ip| ip.to_string());
        let uuid = r.uuid.as_deref().unwrap_or("-");
        let _ = writeln!(out, "{:<width$}  {:<9}  {ip:<15}  {uuid}", r.name, r.status.as_str());
    }
    out
}

pub fn status_json(results: &[ProvisionResult]) -> Result<String, FleetError> {
    let snapshots: Vec<StatusSnapshot> = results.iter().map(ProvisionResult::snapshot).collect();
    facet_json::to_string(&snapshots).map_err(|e| FleetError::Serialize {
        what: "status".into(),
        message: e.to_string(),
    })
}

// ── Fleet report ──────────────────────────────────────────

#[derive(Debug)]
pub enum VmOutcome {
    Ready(ProvisionResult),
    /// Started, but readiness timed out. The VM is left running.
    Degraded(ProvisionResult),
    Failed(FleetError),
    /// Never attempted because a `start_after` dependency did not start.
    Skipped {
        blocked_by: String,
    },
}

impl VmOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            VmOutcome::Ready(_) => "ready",
            VmOutcome::Degraded(_) => "degraded",
            VmOutcome::Failed(_) => "failed",
            VmOutcome::Skipped { .. } => "skipped",
        }
    }

    pub fn result(&self) -> Option<&ProvisionResult> {
        match self {
            VmOutcome::Ready(r) | VmOutcome::Degraded(r) => Some(r),
            _ => None,
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            VmOutcome::Ready(_) => None,
            VmOutcome::Degraded(_) => Some("readiness timed out, VM left running".into()),
            VmOutcome::Failed(e) => Some(e.to_string()),
            VmOutcome::Skipped { blocked_by } => {
                Some(format!("dependency '{blocked_by}' did not start"))
            }
        }
    }
}

/// Outcomes in the order the VMs were declared.
#[derive(Debug, Default)]
pub struct FleetReport {
    pub outcomes: Vec<(String, VmOutcome)>,
}

#[derive(Facet)]
struct OutcomeJson {
    name: String,
    outcome: String,
    detail: Option<String>,
    vm: Option<StatusSnapshot>,
}

#[derive(Facet)]
struct ReportJson {
    success: bool,
    vms: Vec<OutcomeJson>,
}

impl FleetReport {
    pub fn get(&self, name: &str) -> Option<&VmOutcome> {
        self.outcomes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, o)| o)
    }

    /// True when no VM failed or was skipped. Degraded VMs count as success.
    pub fn success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, o)| matches!(o, VmOutcome::Ready(_) | VmOutcome::Degraded(_)))
    }

    pub fn render_text(&self) -> String {
        let width = self.outcomes.iter().map(|(n, _)| n.len()).max().unwrap_or(0);
        let mut out = String::new();
        for (name, outcome) in &self.outcomes {
            let _ = write!(out, "{name:<width$}  {:<8}", outcome.label());
            if let Some(r) = outcome.result() {
                let ip = r.ip.map_or_else(|| "-".to_string(), |ip| ip.to_string());
                let _ = write!(out, "  {:<9}  {ip}", r.status.as_str());
            }
            if let Some(detail) = outcome.detail() {
                let _ = write!(out, "  {detail}");
            }
            out.push('\n');
        }
        out
    }

    pub fn to_json(&self) -> Result<String, FleetError> {
        let report = ReportJson {
            success: self.success(),
            vms: self
                .outcomes
                .iter()
                .map(|(name, o)| OutcomeJson {
                    name: name.clone(),
                    outcome: o.label().to_string(),
                    detail: o.detail(),
                    vm: o.result().map(ProvisionResult::snapshot),
                })
                .collect(),
        };
        facet_json::to_string(&report).map_err(|e| FleetError::Serialize {
            what: "fleet report".into(),
            message: e.to_string(),
        })
    }
}
