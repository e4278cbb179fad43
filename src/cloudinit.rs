use std::path::{Path, PathBuf};

use facet_value::{VArray, Value, value};

use crate::error::FleetError;
use crate::vm::CloudInit;

/// Inputs for the generated cloud-init documents.
pub struct SeedConfig<'a> {
    pub hostname: &'a str,
    pub user_name: &'a str,
    pub ssh_keys: &'a [String],
}

/// Fill in empty user-data / meta-data with generated defaults. Non-empty
/// documents from the configuration are passed through untouched.
pub fn materialize(cloud_init: &CloudInit, config: &SeedConfig) -> Result<CloudInit, FleetError> {
    let user_data = if cloud_init.user_data.trim().is_empty() {
        build_user_data(config)?
    } else {
        cloud_init.user_data.clone()
    };
    let meta_data = if cloud_init.meta_data.trim().is_empty() {
        build_meta_data(config.hostname)
    } else {
        cloud_init.meta_data.clone()
    };
    Ok(CloudInit {
        user_data,
        meta_data,
    })
}

pub fn build_meta_data(hostname: &str) -> String {
    format!("instance-id: {hostname}\nlocal-hostname: {hostname}\n")
}

pub fn build_user_data(config: &SeedConfig) -> Result<String, FleetError> {
    let mut user = value!({
        "name": (config.user_name),
        "lock_passwd": true,
        "shell": "/bin/bash",
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
    });

    if !config.ssh_keys.is_empty() {
        let keys = VArray::from_iter(config.ssh_keys.iter().map(|k| Value::from(k.as_str())));
        if let Some(obj) = user.as_object_mut() {
            obj.insert("ssh_authorized_keys", Value::from(keys));
        }
    }

    let document = value!({
        "hostname": (config.hostname),
        "users": [user],
    });

    let yaml = facet_yaml::to_string(&document).map_err(|e| FleetError::Serialize {
        what: "cloud-init user-data".into(),
        message: e.to_string(),
    })?;
    // cloud-init wants #cloud-config on the very first line.
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    Ok(format!("#cloud-config\n{yaml}"))
}

/// Read and normalize an OpenSSH public key. Unreadable or malformed keys
/// are skipped with a warning.
pub fn read_public_key(path: &Path) -> Option<String> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "no SSH public key");
            return None;
        }
    };
    match ssh_key::PublicKey::from_openssh(text.trim()) {
        Ok(key) => key.to_openssh().ok(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring malformed SSH public key");
            None
        }
    }
}

/// The configured key, or the first default key found under `~/.ssh`.
pub fn discover_public_key(configured: Option<&Path>) -> Option<String> {
    if let Some(path) = configured {
        return read_public_key(path);
    }
    let ssh_dir = dirs::home_dir()?.join(".ssh");
    ["id_ed25519.pub", "id_rsa.pub"]
        .iter()
        .map(|f| ssh_dir.join(f))
        .find_map(|p: PathBuf| read_public_key(&p))
}
