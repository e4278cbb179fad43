//! Declared VM model, independent of how it was loaded.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use crate::error::FleetError;

/// Resource sizing. Zero means "leave the hypervisor default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hardware {
    pub cpus: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkMode {
    #[default]
    Shared,
    Bridged,
    HostOnly,
}

impl NetworkMode {
    pub fn parse(s: &str) -> Result<Self, FleetError> {
        match s {
            "" | "shared" => Ok(NetworkMode::Shared),
            "bridged" => Ok(NetworkMode::Bridged),
            "host-only" | "host_only" => Ok(NetworkMode::HostOnly),
            other => Err(FleetError::Validation {
                message: format!(
                    "unknown network mode '{other}' (expected shared, bridged or host-only)"
                ),
            }),
        }
    }

    /// Adapter type as `prlctl` spells it.
    pub fn as_prlctl(self) -> &'static str {
        match self {
            NetworkMode::Shared => "shared",
            NetworkMode::Bridged => "bridged",
            NetworkMode::HostOnly => "host-only",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_prlctl())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    pub name: String,
    pub linked_clone: bool,
}

/// Clone `source_vm`, then switch the clone to `snapshot_id`. The snapshot
/// must be resolvable on the clone once it exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSource {
    pub source_vm: String,
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudInit {
    pub user_data: String,
    pub meta_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Features {
    pub nested_virt: bool,
    pub shared_clipboard: bool,
    pub time_sync: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            nested_virt: false,
            shared_clipboard: false,
            time_sync: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub hardware: Hardware,
    pub network: NetworkMode,
    pub template: Option<TemplateSource>,
    pub pvm_import: Option<PathBuf>,
    pub snapshot: Option<SnapshotSource>,
    pub iso_install: Option<PathBuf>,
    pub cloud_init: Option<CloudInit>,
    pub start_after: BTreeSet<String>,
    pub autostart: bool,
    pub headless: bool,
    pub features: Features,
}

impl VmSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            headless: true,
            ..Default::default()
        }
    }

    pub fn from_template(name: impl Into<String>, template: &str) -> Self {
        Self {
            template: Some(TemplateSource {
                name: template.to_string(),
                linked_clone: false,
            }),
            ..Self::new(name)
        }
    }

    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.start_after.extend(deps.into_iter().map(Into::into));
        self
    }
}

/// A VM name: `[a-zA-Z0-9][a-zA-Z0-9._-]*`. Names end up in file paths and
/// command lines, so nothing else is accepted.
pub fn validate_name(name: &str) -> Result<(), FleetError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(FleetError::Validation {
            message: format!("VM name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}
