//! Argument vectors for `prlctl` subcommands.
//!
//! One function per operation. Callers decide whether to issue a command at
//! all; nothing in here inspects values to skip work.

use std::path::Path;

fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

pub fn list_all() -> Vec<String> {
    argv(["list", "--all", "--no-header", "--output", "uuid,status,ip,name"])
}

pub fn clone(source: &str, name: &str, linked: bool) -> Vec<String> {
    let mut args = argv(["clone", source, "--name", name]);
    if linked {
        args.push("--linked".into());
    }
    args
}

pub fn register(bundle: &Path) -> Vec<String> {
    vec![
        "register".into(),
        bundle.display().to_string(),
        "--regenerate-src-uuid".into(),
    ]
}

pub fn rename(current: &str, name: &str) -> Vec<String> {
    argv(["set", current, "--name", name])
}

pub fn snapshot_switch(name: &str, snapshot_id: &str) -> Vec<String> {
    argv(["snapshot-switch", name, "--id", snapshot_id])
}

pub fn create_empty(name: &str) -> Vec<String> {
    argv(["create", name, "--distribution", "linux"])
}

pub fn set_install_media(name: &str, iso: &Path) -> Vec<String> {
    let iso = iso.display().to_string();
    argv(["set", name, "--device-set", "cdrom0", "--image", &iso, "--connect"])
}

pub fn set_cpus(name: &str, cpus: u32) -> Vec<String> {
    argv(["set", name, "--cpus", &cpus.to_string()])
}

pub fn set_memory(name: &str, memory_mib: u64) -> Vec<String> {
    argv(["set", name, "--memsize", &memory_mib.to_string()])
}

/// `prlctl` takes disk sizes in MiB.
pub fn set_disk(name: &str, disk_gib: u64) -> Vec<String> {
    let mib = disk_gib.saturating_mul(1024).to_string();
    argv(["set", name, "--device-set", "hdd0", "--size", &mib])
}

pub fn attach_cdrom(name: &str, image: &Path) -> Vec<String> {
    let image = image.display().to_string();
    argv(["set", name, "--device-add", "cdrom", "--image", &image, "--connect"])
}

pub fn set_network(name: &str, mode: &str) -> Vec<String> {
    argv(["set", name, "--device-set", "net0", "--type", mode])
}

pub fn set_boot_order(name: &str, order: &str) -> Vec<String> {
    argv(["set", name, "--device-bootorder", order])
}

pub fn set_nested_virt(name: &str, enabled: bool) -> Vec<String> {
    argv(["set", name, "--nested-virt", on_off(enabled)])
}

pub fn set_shared_clipboard(name: &str, enabled: bool) -> Vec<String> {
    argv(["set", name, "--shared-clipboard", on_off(enabled)])
}

pub fn set_time_sync(name: &str, enabled: bool) -> Vec<String> {
    argv(["set", name, "--time-sync", on_off(enabled)])
}

pub fn set_autostart(name: &str, enabled: bool) -> Vec<String> {
    argv(["set", name, "--autostart", on_off(enabled)])
}

pub fn set_startup_view(name: &str, headless: bool) -> Vec<String> {
    let view = if headless { "headless" } else { "window" };
    argv(["set", name, "--startup-view", view])
}

pub fn start(name: &str) -> Vec<String> {
    argv(["start", name])
}

pub fn stop_kill(name: &str) -> Vec<String> {
    argv(["stop", name, "--kill"])
}

pub fn delete(name: &str) -> Vec<String> {
    argv(["delete", name])
}

pub fn exec(name: &str, command: &str) -> Vec<String> {
    argv(["exec", name, command])
}
