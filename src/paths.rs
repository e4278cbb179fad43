use std::path::{Path, PathBuf};

/// Default state directory: `~/.local/share/prlfleet/`
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("prlfleet")
}

/// Per-VM directory: `<state>/vms/<name>/`
pub fn vm_dir(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join("vms").join(name)
}

/// Seed ISO for a VM. Deterministic from the name, so two VMs in one fleet
/// never share a path.
pub fn seed_path(state_dir: &Path, name: &str) -> PathBuf {
    vm_dir(state_dir, name).join("seed.iso")
}

/// Fingerprint of the inputs the current seed ISO was built from.
pub fn seed_fingerprint_path(state_dir: &Path, name: &str) -> PathBuf {
    vm_dir(state_dir, name).join("seed.fingerprint")
}

/// Staging directory holding `user-data` / `meta-data` for the ISO tool.
pub fn seed_staging_dir(state_dir: &Path, name: &str) -> PathBuf {
    vm_dir(state_dir, name).join("seed")
}

/// Persisted status snapshot for out-of-band inspection.
pub fn status_path(state_dir: &Path, name: &str) -> PathBuf {
    vm_dir(state_dir, name).join("status.json")
}

pub fn logs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}
