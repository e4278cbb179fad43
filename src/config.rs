use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::FleetError;
use crate::paths;
use crate::readiness::ReadinessPolicy;
use crate::vm::{
    CloudInit, Features, Hardware, NetworkMode, SnapshotSource, TemplateSource, VmSpec,
    validate_name,
};

pub const DEFAULT_READY_MARKER: &str = "/var/lib/cloud/instance/boot-finished";

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SettingsConfig {
    #[facet(default = "prlctl")]
    pub prlctl: String,
    #[facet(default = 4)]
    pub max_concurrency: u32,
    #[facet(default = 600)]
    pub ready_timeout_s: u64,
    #[facet(default = 10)]
    pub ready_interval_s: u64,
    #[facet(default = 5)]
    pub settle_delay_s: u64,
    #[facet(default)]
    pub command_timeout_s: u64,
    #[facet(default)]
    pub state_dir: String,
    #[facet(default = "/var/lib/cloud/instance/boot-finished")]
    pub ready_marker: String,
    #[facet(default)]
    pub ssh_public_key: String,
    #[facet(default = "admin")]
    pub guest_user: String,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            prlctl: "prlctl".into(),
            max_concurrency: 4,
            ready_timeout_s: 600,
            ready_interval_s: 10,
            settle_delay_s: 5,
            command_timeout_s: 0,
            state_dir: String::new(),
            ready_marker: DEFAULT_READY_MARKER.into(),
            ssh_public_key: String::new(),
            guest_user: "admin".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct CloudInitConfig {
    #[facet(default)]
    pub user_data: String,
    #[facet(default)]
    pub meta_data: String,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct VmConfig {
    #[facet(default)]
    pub cpus: u32,
    #[facet(default)]
    pub memory_mb: u64,
    #[facet(default)]
    pub disk_gb: u64,
    #[facet(default)]
    pub network: String,
    #[facet(default)]
    pub template: String,
    #[facet(default)]
    pub linked_clone: bool,
    #[facet(default)]
    pub pvm: String,
    #[facet(default)]
    pub snapshot_vm: String,
    #[facet(default)]
    pub snapshot_id: String,
    #[facet(default)]
    pub iso: String,
    pub cloud_init: Option<CloudInitConfig>,
    #[facet(default)]
    pub start_after: Vec<String>,
    #[facet(default)]
    pub autostart: bool,
    #[facet(default = true)]
    pub headless: bool,
    #[facet(default)]
    pub nested_virt: bool,
    #[facet(default)]
    pub shared_clipboard: bool,
    #[facet(default = true)]
    pub time_sync: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cpus: 0,
            memory_mb: 0,
            disk_gb: 0,
            network: String::new(),
            template: String::new(),
            linked_clone: false,
            pvm: String::new(),
            snapshot_vm: String::new(),
            snapshot_id: String::new(),
            iso: String::new(),
            cloud_init: None,
            start_after: Vec::new(),
            autostart: false,
            headless: true,
            nested_virt: false,
            shared_clipboard: false,
            time_sync: true,
        }
    }
}

#[derive(Debug, Clone, Facet)]
pub struct FleetConfig {
    #[facet(default)]
    pub settings: SettingsConfig,
    #[facet(default)]
    pub vms: BTreeMap<String, VmConfig>,
}

// ── Resolved settings ─────────────────────────────────────

/// Runtime settings with durations and paths resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub prlctl: String,
    pub max_concurrency: usize,
    pub ready_timeout: Duration,
    pub ready_interval: Duration,
    pub settle_delay: Duration,
    /// `None` means hypervisor commands may run indefinitely.
    pub command_timeout: Option<Duration>,
    pub state_dir: PathBuf,
    pub ready_marker: String,
    pub ssh_public_key: Option<PathBuf>,
    pub guest_user: String,
}

impl Default for Settings {
    fn default() -> Self {
        let defaults = SettingsConfig::default();
        Self {
            prlctl: defaults.prlctl,
            max_concurrency: defaults.max_concurrency as usize,
            ready_timeout: Duration::from_secs(defaults.ready_timeout_s),
            ready_interval: Duration::from_secs(defaults.ready_interval_s),
            settle_delay: Duration::from_secs(defaults.settle_delay_s),
            command_timeout: None,
            state_dir: paths::default_state_dir(),
            ready_marker: defaults.ready_marker,
            ssh_public_key: None,
            guest_user: defaults.guest_user,
        }
    }
}

impl Settings {
    pub fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            timeout: self.ready_timeout,
            interval: self.ready_interval,
            marker: self.ready_marker.clone(),
        }
    }
}

/// A loaded fleet: settings plus VMs in declaration (name) order.
#[derive(Debug, Clone)]
pub struct FleetSpec {
    pub config_path: PathBuf,
    pub settings: Settings,
    pub vms: Vec<VmSpec>,
}

impl FleetSpec {
    pub fn get(&self, name: &str) -> Option<&VmSpec> {
        self.vms.iter().find(|vm| vm.name == name)
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &FleetConfig) -> Result<(), FleetError> {
    let s = &config.settings;
    if s.max_concurrency < 1 {
        return Err(FleetError::Validation {
            message: "max_concurrency must be at least 1".into(),
        });
    }
    if s.ready_interval_s == 0 {
        return Err(FleetError::Validation {
            message: "ready_interval_s must be greater than 0".into(),
        });
    }
    if s.prlctl.trim().is_empty() {
        return Err(FleetError::Validation {
            message: "prlctl must name the control tool".into(),
        });
    }
    if s.guest_user.trim().is_empty() {
        return Err(FleetError::Validation {
            message: "guest_user must not be empty".into(),
        });
    }

    if config.vms.is_empty() {
        return Err(FleetError::Validation {
            message: "no VMs declared (add a [vms.<name>] table)".into(),
        });
    }

    for (name, vm) in &config.vms {
        validate_name(name)?;
        NetworkMode::parse(&vm.network).map_err(|e| FleetError::Validation {
            message: format!("VM '{name}': {e}"),
        })?;
        if !vm.snapshot_id.is_empty() && vm.snapshot_vm.is_empty() {
            return Err(FleetError::Validation {
                message: format!("VM '{name}': snapshot_id requires snapshot_vm"),
            });
        }
        for dep in &vm.start_after {
            if dep == name {
                return Err(FleetError::Validation {
                    message: format!("VM '{name}' cannot start after itself"),
                });
            }
            if !config.vms.contains_key(dep) {
                return Err(FleetError::UnknownDependency {
                    vm: name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    Ok(())
}

// ── conversion ────────────────────────────────────────────

/// Resolve a configured path relative to the config file's directory.
fn resolve_path(config_dir: &Path, value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        return None;
    }
    let p = Path::new(value);
    Some(if p.is_absolute() {
        p.to_path_buf()
    } else {
        config_dir.join(p)
    })
}

fn resolve_settings(s: &SettingsConfig, config_dir: &Path) -> Settings {
    Settings {
        prlctl: s.prlctl.clone(),
        max_concurrency: s.max_concurrency as usize,
        ready_timeout: Duration::from_secs(s.ready_timeout_s),
        ready_interval: Duration::from_secs(s.ready_interval_s),
        settle_delay: Duration::from_secs(s.settle_delay_s),
        command_timeout: (s.command_timeout_s > 0).then(|| Duration::from_secs(s.command_timeout_s)),
        state_dir: resolve_path(config_dir, &s.state_dir).unwrap_or_else(paths::default_state_dir),
        ready_marker: s.ready_marker.clone(),
        ssh_public_key: resolve_path(config_dir, &s.ssh_public_key),
        guest_user: s.guest_user.clone(),
    }
}

fn to_vm_spec(name: &str, vm: &VmConfig, config_dir: &Path) -> Result<VmSpec, FleetError> {
    Ok(VmSpec {
        name: name.to_string(),
        hardware: Hardware {
            cpus: vm.cpus,
            memory_mib: vm.memory_mb,
            disk_gib: vm.disk_gb,
        },
        network: NetworkMode::parse(&vm.network)?,
        template: (!vm.template.is_empty()).then(|| TemplateSource {
            name: vm.template.clone(),
            linked_clone: vm.linked_clone,
        }),
        pvm_import: resolve_path(config_dir, &vm.pvm),
        snapshot: (!vm.snapshot_id.is_empty()).then(|| SnapshotSource {
            source_vm: vm.snapshot_vm.clone(),
            snapshot_id: vm.snapshot_id.clone(),
        }),
        iso_install: resolve_path(config_dir, &vm.iso),
        cloud_init: vm.cloud_init.as_ref().map(|c| CloudInit {
            user_data: c.user_data.clone(),
            meta_data: c.meta_data.clone(),
        }),
        start_after: vm.start_after.iter().cloned().collect::<BTreeSet<_>>(),
        autostart: vm.autostart,
        headless: vm.headless,
        features: Features {
            nested_virt: vm.nested_virt,
            shared_clipboard: vm.shared_clipboard,
            time_sync: vm.time_sync,
        },
    })
}

// ── public API ────────────────────────────────────────────

/// Parse and validate config text. Relative paths resolve against the
/// directory of `path`.
pub fn parse_config(contents: &str, path: &Path) -> Result<FleetSpec, FleetError> {
    let config: FleetConfig =
        facet_toml::from_str(contents).map_err(|e| FleetError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    validate_config(&config)?;

    let config_dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let vms = config
        .vms
        .iter()
        .map(|(name, vm)| to_vm_spec(name, vm, &config_dir))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FleetSpec {
        config_path: path.to_path_buf(),
        settings: resolve_settings(&config.settings, &config_dir),
        vms,
    })
}

pub fn load_config(path: &Path) -> Result<FleetSpec, FleetError> {
    let contents = std::fs::read_to_string(path).map_err(|source| FleetError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&contents, path)
}
