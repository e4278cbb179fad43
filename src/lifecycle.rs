//! Per-VM provisioning lifecycle.
//!
//! ```text
//! Absent → Creating → Created → Configuring → Configured → Starting
//!        → Running → AwaitingReady → Ready | ReadyTimedOut
//! any    → Destroying → Absent
//! ```
//!
//! Every step re-queries the hypervisor instead of trusting earlier
//! observations, and the create path removes any same-named instance
//! first, so rerunning a failed lifecycle from the top is always safe.
//! A failing step moves the VM to `Failed` without rolling back earlier
//! steps.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::cloudinit::{self, SeedConfig};
use crate::config::Settings;
use crate::error::FleetError;
use crate::hypervisor::{Hypervisor, VmStatus, args};
use crate::observer::{Transition, publish_transition};
use crate::readiness::{self, Readiness};
use crate::seed::{SeedMedia, SeedMediaBuilder};
use crate::source::{self, Source, SourceType};
use crate::status::{self, ProvisionResult};
use crate::vm::VmSpec;

/// Boot order for VMs installing from an ISO.
pub const BOOT_ORDER_INSTALL: &str = "cdrom0 hdd0 net0";
/// Boot order for VMs created from an existing disk.
pub const BOOT_ORDER_DISK: &str = "hdd0 cdrom0 net0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Absent,
    Creating,
    Created,
    Configuring,
    Configured,
    Starting,
    Running,
    AwaitingReady,
    Ready,
    ReadyTimedOut,
    /// A step failed; earlier steps are left in place.
    Failed,
    Destroying,
}

impl LifecyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecyclePhase::Absent => "absent",
            LifecyclePhase::Creating => "creating",
            LifecyclePhase::Created => "created",
            LifecyclePhase::Configuring => "configuring",
            LifecyclePhase::Configured => "configured",
            LifecyclePhase::Starting => "starting",
            LifecyclePhase::Running => "running",
            LifecyclePhase::AwaitingReady => "awaiting-ready",
            LifecyclePhase::Ready => "ready",
            LifecyclePhase::ReadyTimedOut => "ready-timed-out",
            LifecyclePhase::Failed => "failed",
            LifecyclePhase::Destroying => "destroying",
        }
    }

    /// Human-readable phase, for progress output.
    pub fn describe(self) -> &'static str {
        match self {
            LifecyclePhase::Absent => "absent",
            LifecyclePhase::Creating => "creating VM",
            LifecyclePhase::Created => "VM created",
            LifecyclePhase::Configuring => "configuring hardware",
            LifecyclePhase::Configured => "configured",
            LifecyclePhase::Starting => "starting",
            LifecyclePhase::Running => "running",
            LifecyclePhase::AwaitingReady => "waiting for guest",
            LifecyclePhase::Ready => "ready",
            LifecyclePhase::ReadyTimedOut => "running, readiness timed out",
            LifecyclePhase::Failed => "failed",
            LifecyclePhase::Destroying => "destroying",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecyclePhase::Ready
                | LifecyclePhase::ReadyTimedOut
                | LifecyclePhase::Failed
                | LifecyclePhase::Absent
        )
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current phase of one VM; every change is published to observers.
#[derive(Debug)]
pub struct PhaseTracker {
    vm: String,
    phase: LifecyclePhase,
    tx: broadcast::Sender<Transition>,
}

impl PhaseTracker {
    fn new(vm: &str, phase: LifecyclePhase, tx: broadcast::Sender<Transition>) -> Self {
        Self {
            vm: vm.to_string(),
            phase,
            tx,
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    fn advance(&mut self, to: LifecyclePhase) {
        tracing::debug!(vm = %self.vm, from = %self.phase, %to, "phase transition");
        publish_transition(&self.tx, &self.vm, self.phase, to);
        self.phase = to;
    }
}

/// A VM that has been started but not yet checked for readiness.
#[derive(Debug)]
pub struct Launched {
    tracker: PhaseTracker,
    seed: Option<SeedMedia>,
}

impl Launched {
    pub fn phase(&self) -> LifecyclePhase {
        self.tracker.phase()
    }

    pub fn seed(&self) -> Option<&SeedMedia> {
        self.seed.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub result: ProvisionResult,
    pub readiness: Readiness,
}

pub struct Provisioner {
    hv: Arc<dyn Hypervisor>,
    seeds: SeedMediaBuilder,
    settings: Settings,
    ssh_keys: Vec<String>,
    transitions: broadcast::Sender<Transition>,
    cancel: CancellationToken,
}

impl Provisioner {
    pub fn new(hv: Arc<dyn Hypervisor>, seeds: SeedMediaBuilder, settings: Settings) -> Self {
        let (transitions, _) = broadcast::channel(256);
        Self {
            hv,
            seeds,
            settings,
            ssh_keys: Vec::new(),
            transitions,
            cancel: CancellationToken::new(),
        }
    }

    /// Public keys added to generated cloud-init user-data.
    pub fn with_ssh_keys(mut self, keys: Vec<String>) -> Self {
        self.ssh_keys = keys;
        self
    }

    /// Also stops an in-flight seed build.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.seeds = self.seeds.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run the whole create path: [`launch`](Self::launch) then
    /// [`settle`](Self::settle).
    pub async fn provision(&self, spec: &VmSpec) -> Result<Provisioned, FleetError> {
        let launched = self.launch(spec).await?;
        self.settle(spec, launched).await
    }

    /// Create, configure and start `spec`, stopping once the VM is running.
    ///
    /// A missing source or seed tool fails before any hypervisor mutation.
    #[tracing::instrument(skip_all, fields(vm = %spec.name))]
    pub async fn launch(&self, spec: &VmSpec) -> Result<Launched, FleetError> {
        let mut tracker = PhaseTracker::new(
            &spec.name,
            LifecyclePhase::Absent,
            self.transitions.clone(),
        );

        let Some(source) = source::select(spec) else {
            tracker.advance(LifecyclePhase::Failed);
            return Err(FleetError::NoSourceSpecified {
                name: spec.name.clone(),
            });
        };
        tracing::debug!(source = %source.kind(), "resolved provisioning source");

        let seed = match self.prepare_seed(spec).await {
            Ok(seed) => seed,
            Err(e) => {
                tracker.advance(LifecyclePhase::Failed);
                return Err(e);
            }
        };

        match self.bring_up(spec, source, seed.as_ref(), &mut tracker).await {
            Ok(()) => Ok(Launched { tracker, seed }),
            Err(e) => {
                self.abandon(&mut tracker, seed.as_ref(), &e).await;
                Err(e)
            }
        }
    }

    /// Wait for a launched VM to become ready and record its final state.
    /// A readiness timeout is not an error.
    #[tracing::instrument(skip_all, fields(vm = %spec.name))]
    pub async fn settle(&self, spec: &VmSpec, launched: Launched) -> Result<Provisioned, FleetError> {
        let Launched { mut tracker, seed } = launched;
        match self.await_guest(spec, &mut tracker).await {
            Ok(provisioned) => Ok(provisioned),
            Err(e) => {
                self.abandon(&mut tracker, seed.as_ref(), &e).await;
                Err(e)
            }
        }
    }

    /// Tear down `name`: stop, delete, then release its seed media and
    /// status file. Media and status are released even when deleting the
    /// instance fails. An already-absent VM is not an error.
    #[tracing::instrument(skip(self))]
    pub async fn destroy(&self, name: &str) -> Result<(), FleetError> {
        let from = match self.hv.query(name).await {
            Ok(state) if state.status == VmStatus::Running => LifecyclePhase::Running,
            Ok(state) if state.exists() => LifecyclePhase::Created,
            _ => LifecyclePhase::Absent,
        };
        let mut tracker = PhaseTracker::new(name, from, self.transitions.clone());
        tracker.advance(LifecyclePhase::Destroying);

        let removed = self.remove_instance(name).await;

        self.seeds.destroy(&self.seeds.media_for(name)).await;
        status::remove_snapshot(&self.settings.state_dir, name);
        // only succeeds once the directory is empty
        let _ = std::fs::remove_dir(crate::paths::vm_dir(&self.settings.state_dir, name));

        match removed {
            Ok(()) => {
                tracker.advance(LifecyclePhase::Absent);
                tracing::info!("VM destroyed");
                Ok(())
            }
            Err(e) => {
                tracker.advance(LifecyclePhase::Failed);
                Err(e)
            }
        }
    }

    // ── steps ─────────────────────────────────────────────

    async fn prepare_seed(&self, spec: &VmSpec) -> Result<Option<SeedMedia>, FleetError> {
        let Some(cloud_init) = &spec.cloud_init else {
            return Ok(None);
        };
        let docs = cloudinit::materialize(
            cloud_init,
            &SeedConfig {
                hostname: &spec.name,
                user_name: &self.settings.guest_user,
                ssh_keys: &self.ssh_keys,
            },
        )?;
        self.seeds
            .build(&spec.name, &docs.user_data, &docs.meta_data)
            .await
            .map(Some)
    }

    async fn bring_up(
        &self,
        spec: &VmSpec,
        source: Source<'_>,
        seed: Option<&SeedMedia>,
        tracker: &mut PhaseTracker,
    ) -> Result<(), FleetError> {
        let name = spec.name.as_str();

        tracker.advance(LifecyclePhase::Creating);
        self.ensure_absent(name).await?;
        self.create(name, source).await?;
        tracker.advance(LifecyclePhase::Created);

        tracker.advance(LifecyclePhase::Configuring);
        self.configure(spec, source.kind(), seed).await?;
        tracker.advance(LifecyclePhase::Configured);

        tracker.advance(LifecyclePhase::Starting);
        self.hv.mutate(&args::start(name)).await?;
        tracker.advance(LifecyclePhase::Running);
        tracing::info!("VM started");
        Ok(())
    }

    async fn await_guest(
        &self,
        spec: &VmSpec,
        tracker: &mut PhaseTracker,
    ) -> Result<Provisioned, FleetError> {
        let name = spec.name.as_str();
        self.pause(self.settings.settle_delay, name).await?;

        tracker.advance(LifecyclePhase::AwaitingReady);
        let readiness = readiness::await_ready(
            self.hv.as_ref(),
            name,
            &self.settings.readiness(),
            &self.cancel,
        )
        .await?;

        let state = self.hv.query(name).await?;
        let mut result = ProvisionResult::from_state(name, spec.hardware, &state);
        if readiness.ip.is_some() {
            result.ip = readiness.ip;
        }

        if readiness.ready {
            tracker.advance(LifecyclePhase::Ready);
        } else {
            tracing::warn!(
                timeout = ?self.settings.ready_timeout,
                "VM is running but did not report ready; leaving it running"
            );
            tracker.advance(LifecyclePhase::ReadyTimedOut);
        }

        if let Err(e) = status::write_snapshot(&self.settings.state_dir, &result) {
            tracing::warn!(error = %e, "failed to write status snapshot");
        }

        Ok(Provisioned { result, readiness })
    }

    /// Remove any same-named instance left over from an earlier run.
    async fn ensure_absent(&self, name: &str) -> Result<(), FleetError> {
        let state = self.hv.query(name).await?;
        if !state.exists() {
            return Ok(());
        }
        tracing::info!(status = %state.status, "removing stale instance before create");
        self.stop_tolerant(name).await?;
        self.hv.mutate(&args::delete(name)).await?;
        Ok(())
    }

    async fn create(&self, name: &str, source: Source<'_>) -> Result<(), FleetError> {
        match source {
            Source::Template(t) => {
                self.hv
                    .mutate(&args::clone(&t.name, name, t.linked_clone))
                    .await?;
            }
            Source::PvmImage(bundle) => {
                self.hv.mutate(&args::register(bundle)).await?;
                let registered = bundle
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if !registered.is_empty() && registered != name {
                    self.hv.mutate(&args::rename(&registered, name)).await?;
                }
            }
            Source::Snapshot(s) => {
                self.hv
                    .mutate(&args::clone(&s.source_vm, name, false))
                    .await?;
                self.hv
                    .mutate(&args::snapshot_switch(name, &s.snapshot_id))
                    .await?;
            }
            Source::Iso(iso) => {
                self.hv.mutate(&args::create_empty(name)).await?;
                self.hv.mutate(&args::set_install_media(name, iso)).await?;
            }
        }
        tracing::info!(source = %source.kind(), "VM created");
        Ok(())
    }

    /// Apply every setting independently. Failures are collected and
    /// reported together; settings that succeeded are kept.
    async fn configure(
        &self,
        spec: &VmSpec,
        kind: SourceType,
        seed: Option<&SeedMedia>,
    ) -> Result<(), FleetError> {
        let name = spec.name.as_str();
        let hw = &spec.hardware;

        let mut steps: Vec<(&str, Vec<String>)> = Vec::new();
        if hw.cpus > 0 {
            steps.push(("cpus", args::set_cpus(name, hw.cpus)));
        }
        if hw.memory_mib > 0 {
            steps.push(("memory", args::set_memory(name, hw.memory_mib)));
        }
        if hw.disk_gib > 0 {
            steps.push(("disk size", args::set_disk(name, hw.disk_gib)));
        }
        if let Some(seed) = seed {
            steps.push(("seed media", args::attach_cdrom(name, &seed.path)));
        }
        steps.push(("network", args::set_network(name, spec.network.as_prlctl())));
        let boot_order = if kind == SourceType::Iso {
            BOOT_ORDER_INSTALL
        } else {
            BOOT_ORDER_DISK
        };
        steps.push(("boot order", args::set_boot_order(name, boot_order)));
        steps.push((
            "nested virtualization",
            args::set_nested_virt(name, spec.features.nested_virt),
        ));
        steps.push((
            "shared clipboard",
            args::set_shared_clipboard(name, spec.features.shared_clipboard),
        ));
        steps.push(("time sync", args::set_time_sync(name, spec.features.time_sync)));
        steps.push(("autostart", args::set_autostart(name, spec.autostart)));
        steps.push(("startup view", args::set_startup_view(name, spec.headless)));

        let mut failures = Vec::new();
        for (field, argv) in steps {
            match self.hv.mutate(&argv).await {
                Ok(_) => {}
                Err(e @ FleetError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(field, error = %e, "failed to apply setting");
                    failures.push(format!("{field}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Configure {
                name: name.to_string(),
                failures,
            })
        }
    }

    async fn remove_instance(&self, name: &str) -> Result<(), FleetError> {
        self.stop_tolerant(name).await?;
        if self.hv.exists(name).await? {
            self.hv.mutate(&args::delete(name)).await?;
        } else {
            tracing::debug!("instance already absent");
        }
        Ok(())
    }

    /// Force-stop; a VM that is already stopped (or missing) is fine.
    async fn stop_tolerant(&self, name: &str) -> Result<(), FleetError> {
        let out = self.hv.run(&args::stop_kill(name)).await?;
        if !out.success() {
            tracing::debug!(code = out.code, stderr = %out.stderr.trim(), "stop not needed");
        }
        Ok(())
    }

    async fn pause(&self, delay: Duration, name: &str) -> Result<(), FleetError> {
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FleetError::Cancelled {
                what: format!("provisioning of '{name}'"),
            }),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Mark the VM failed. A cancelled run also releases its seed media.
    async fn abandon(&self, tracker: &mut PhaseTracker, seed: Option<&SeedMedia>, error: &FleetError) {
        tracing::error!(phase = %tracker.phase(), error = %error, "provisioning step failed");
        tracker.advance(LifecyclePhase::Failed);
        if matches!(error, FleetError::Cancelled { .. })
            && let Some(seed) = seed
        {
            self.seeds.destroy(seed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::hypervisor::fake::{FakeHypervisor, GuestScript};
    use crate::paths;
    use crate::vm::{CloudInit, Hardware, SnapshotSource};

    fn settings(state: &Path) -> Settings {
        Settings {
            state_dir: state.to_path_buf(),
            settle_delay: Duration::ZERO,
            ready_timeout: Duration::from_secs(30),
            ready_interval: Duration::from_secs(1),
            ..Settings::default()
        }
    }

    fn provisioner(hv: &Arc<FakeHypervisor>, state: &Path) -> Provisioner {
        Provisioner::new(hv.clone(), SeedMediaBuilder::new(state, None), settings(state))
    }

    fn golden() -> FakeHypervisor {
        FakeHypervisor::new().with_vm("golden", VmStatus::Stopped)
    }

    fn subcommands(calls: &[Vec<String>]) -> Vec<&str> {
        calls.iter().map(|c| c[0].as_str()).collect()
    }

    fn has_flag(calls: &[Vec<String>], flag: &str) -> bool {
        calls.iter().any(|c| c.iter().any(|a| a == flag))
    }

    #[tokio::test(start_paused = true)]
    async fn template_clone_reaches_ready() {
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(golden());
        let p = provisioner(&hv, state.path());
        let mut rx = p.subscribe();

        let mut spec = VmSpec::from_template("web", "golden");
        spec.hardware = Hardware {
            cpus: 2,
            memory_mib: 2048,
            disk_gib: 40,
        };
        let out = p.provision(&spec).await.unwrap();

        assert!(out.readiness.ready);
        assert_eq!(out.result.status, VmStatus::Running);
        assert_eq!(out.result.ip, Some(Ipv4Addr::new(10, 211, 55, 20)));
        assert!(out.result.uuid.is_some());
        assert_eq!(out.result.sizing, spec.hardware);

        let calls = hv.calls_for("web");
        assert_eq!(calls[0], vec!["clone", "golden", "--name", "web"]);
        assert_eq!(calls.last().unwrap(), &vec!["start", "web"]);
        assert!(has_flag(&calls, "--cpus"));
        assert!(has_flag(&calls, "--memsize"));
        assert!(calls.iter().any(|c| c.contains(&"40960".to_string())));
        assert!(calls.iter().any(|c| c.contains(&BOOT_ORDER_DISK.to_string())));

        let mut phases = Vec::new();
        while let Ok(t) = rx.try_recv() {
            phases.push(t.to);
        }
        assert_eq!(
            phases,
            vec![
                LifecyclePhase::Creating,
                LifecyclePhase::Created,
                LifecyclePhase::Configuring,
                LifecyclePhase::Configured,
                LifecyclePhase::Starting,
                LifecyclePhase::Running,
                LifecyclePhase::AwaitingReady,
                LifecyclePhase::Ready,
            ]
        );

        assert!(paths::status_path(state.path(), "web").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_stops_and_deletes_stale_instance_first() {
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(golden());
        let p = provisioner(&hv, state.path());
        let spec = VmSpec::from_template("web", "golden");

        let first = p.provision(&spec).await.unwrap();
        let before = hv.calls().len();
        let second = p.provision(&spec).await.unwrap();

        assert_eq!(first.result.status, second.result.status);
        let rerun: Vec<Vec<String>> = hv.calls()[before..].to_vec();
        assert_eq!(&subcommands(&rerun)[..3], ["stop", "delete", "clone"]);
        assert_eq!(rerun[0], vec!["stop", "web", "--kill"]);
    }

    #[tokio::test]
    async fn missing_source_fails_without_touching_hypervisor() {
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(FakeHypervisor::new());
        let p = provisioner(&hv, state.path());
        let mut rx = p.subscribe();

        let err = p.provision(&VmSpec::new("web")).await.unwrap_err();
        assert!(matches!(err, FleetError::NoSourceSpecified { ref name } if name == "web"));
        assert!(hv.calls().is_empty());
        assert_eq!(rx.try_recv().unwrap().to, LifecyclePhase::Failed);
    }

    #[tokio::test]
    async fn missing_iso_tool_fails_before_any_mutation() {
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(golden());
        let p = provisioner(&hv, state.path());

        let mut spec = VmSpec::from_template("web", "golden");
        spec.cloud_init = Some(CloudInit::default());
        let err = p.provision(&spec).await.unwrap_err();
        assert!(matches!(err, FleetError::ToolingUnavailable { .. }));
        assert!(hv.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_sizing_is_left_to_hypervisor() {
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(golden());
        let p = provisioner(&hv, state.path());

        let mut spec = VmSpec::from_template("web", "golden");
        spec.hardware.cpus = 4;
        p.provision(&spec).await.unwrap();

        let calls = hv.calls_for("web");
        assert!(has_flag(&calls, "--cpus"));
        assert!(!has_flag(&calls, "--memsize"));
        assert!(!calls.iter().any(|c| c.contains(&"hdd0".to_string()) && c.contains(&"--size".to_string())));
        // everything else is still applied
        assert!(has_flag(&calls, "--device-bootorder"));
        assert!(has_flag(&calls, "--startup-view"));
    }

    #[tokio::test]
    async fn configure_reports_every_failed_setting_and_does_not_start() {
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(golden().fail_on("set", "web"));
        let p = provisioner(&hv, state.path());

        let mut spec = VmSpec::from_template("web", "golden");
        spec.hardware.cpus = 2;
        let err = p.provision(&spec).await.unwrap_err();
        match err {
            FleetError::Configure { name, failures } => {
                assert_eq!(name, "web");
                // cpus, network, boot order, 3 toggles, autostart, startup view
                assert_eq!(failures.len(), 8);
                assert!(failures[0].starts_with("cpus:"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hv.position("start", "web"), None);
        // the clone is not rolled back
        assert_eq!(hv.status_of("web"), VmStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn iso_install_boots_from_cdrom() {
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(FakeHypervisor::new());
        let p = provisioner(&hv, state.path());

        let mut spec = VmSpec::new("web");
        spec.iso_install = Some(PathBuf::from("/isos/ubuntu.iso"));
        p.provision(&spec).await.unwrap();

        let calls = hv.calls_for("web");
        assert_eq!(calls[0], vec!["create", "web", "--distribution", "linux"]);
        assert_eq!(
            calls[1],
            vec!["set", "web", "--device-set", "cdrom0", "--image", "/isos/ubuntu.iso", "--connect"]
        );
        assert!(calls.iter().any(|c| c.contains(&BOOT_ORDER_INSTALL.to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn pvm_import_registers_then_renames() {
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(FakeHypervisor::new());
        let p = provisioner(&hv, state.path());

        let mut spec = VmSpec::new("web");
        spec.pvm_import = Some(PathBuf::from("/images/base.pvm"));
        p.provision(&spec).await.unwrap();

        let calls = hv.calls();
        assert_eq!(calls[0], vec!["register", "/images/base.pvm", "--regenerate-src-uuid"]);
        assert_eq!(calls[1], vec!["set", "base", "--name", "web"]);
        assert_eq!(hv.status_of("web"), VmStatus::Running);
        assert_eq!(hv.status_of("base"), VmStatus::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_source_clones_then_switches() {
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(FakeHypervisor::new().with_vm("base", VmStatus::Stopped));
        let p = provisioner(&hv, state.path());

        let mut spec = VmSpec::new("web");
        spec.snapshot = Some(SnapshotSource {
            source_vm: "base".into(),
            snapshot_id: "{5b1d}".into(),
        });
        p.provision(&spec).await.unwrap();

        let calls = hv.calls();
        assert_eq!(calls[0], vec!["clone", "base", "--name", "web"]);
        assert_eq!(calls[1], vec!["snapshot-switch", "web", "--id", "{5b1d}"]);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_leaves_vm_running() {
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(golden().with_guest(
            "web",
            GuestScript {
                ip_from_poll: Some(1),
                marker_from_poll: None,
            },
        ));
        let p = provisioner(&hv, state.path());
        let mut rx = p.subscribe();

        let out = p.provision(&VmSpec::from_template("web", "golden")).await.unwrap();
        assert!(!out.readiness.ready);
        assert_eq!(out.readiness.attempts, 30);
        assert_eq!(out.result.ip, Some(Ipv4Addr::new(10, 211, 55, 20)));
        assert_eq!(hv.status_of("web"), VmStatus::Running);

        let mut last = None;
        while let Ok(t) = rx.try_recv() {
            last = Some(t.to);
        }
        assert_eq!(last, Some(LifecyclePhase::ReadyTimedOut));
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_releases_seed_media() {
        let tools = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(golden().with_guest(
            "web",
            GuestScript {
                ip_from_poll: None,
                marker_from_poll: None,
            },
        ));
        let seeds = SeedMediaBuilder::new(
            state.path(),
            Some(crate::seed::tests::fake_iso_tool(tools.path())),
        );
        let p = Provisioner::new(hv.clone(), seeds, settings(state.path()));

        let mut spec = VmSpec::from_template("web", "golden");
        spec.cloud_init = Some(CloudInit::default());

        let launched = p.launch(&spec).await.unwrap();
        let seed_path = launched.seed().unwrap().path.clone();
        assert!(seed_path.exists());
        assert!(
            hv.calls_for("web")
                .iter()
                .any(|c| c.contains(&"--device-add".to_string()) && c.contains(&seed_path.display().to_string()))
        );

        p.cancellation().cancel();
        let err = p.settle(&spec, launched).await.unwrap_err();
        assert!(matches!(err, FleetError::Cancelled { .. }));
        assert!(!seed_path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_create_releases_seed_media() {
        let tools = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let hv = Arc::new(golden().cancel_on("clone", "web", &cancel));
        let seeds = SeedMediaBuilder::new(
            state.path(),
            Some(crate::seed::tests::fake_iso_tool(tools.path())),
        );
        let p = Provisioner::new(hv.clone(), seeds, settings(state.path()))
            .with_cancellation(cancel.clone());
        let mut rx = p.subscribe();

        let mut spec = VmSpec::from_template("web", "golden");
        spec.cloud_init = Some(CloudInit::default());

        let err = p.launch(&spec).await.unwrap_err();
        assert!(matches!(err, FleetError::Cancelled { .. }));
        assert!(cancel.is_cancelled());
        assert!(!paths::seed_path(state.path(), "web").exists());
        assert!(!paths::seed_fingerprint_path(state.path(), "web").exists());
        assert_eq!(hv.position("start", "web"), None);

        let mut last = None;
        while let Ok(t) = rx.try_recv() {
            last = Some(t.to);
        }
        assert_eq!(last, Some(LifecyclePhase::Failed));
    }

    #[test]
    fn terminal_phases() {
        for phase in [
            LifecyclePhase::Ready,
            LifecyclePhase::ReadyTimedOut,
            LifecyclePhase::Failed,
            LifecyclePhase::Absent,
        ] {
            assert!(phase.is_terminal(), "{phase}");
        }
        assert!(!LifecyclePhase::AwaitingReady.is_terminal());
        assert!(!LifecyclePhase::Destroying.is_terminal());
    }

    #[tokio::test]
    async fn destroy_never_started_vm() {
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(FakeHypervisor::new().with_vm("web", VmStatus::Stopped));
        let p = provisioner(&hv, state.path());

        let seed = paths::seed_path(state.path(), "web");
        std::fs::create_dir_all(seed.parent().unwrap()).unwrap();
        std::fs::write(&seed, "ISO").unwrap();

        p.destroy("web").await.unwrap();
        assert_eq!(subcommands(&hv.calls()), ["stop", "delete"]);
        assert_eq!(hv.status_of("web"), VmStatus::NotFound);
        assert!(!seed.exists());
    }

    #[tokio::test]
    async fn destroy_absent_vm_is_ok() {
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(FakeHypervisor::new());
        let p = provisioner(&hv, state.path());
        let mut rx = p.subscribe();

        p.destroy("web").await.unwrap();
        assert_eq!(subcommands(&hv.calls()), ["stop"]);
        assert_eq!(rx.try_recv().unwrap().to, LifecyclePhase::Destroying);
        assert_eq!(rx.try_recv().unwrap().to, LifecyclePhase::Absent);
    }

    #[tokio::test]
    async fn destroy_releases_media_even_when_delete_fails() {
        let state = tempfile::tempdir().unwrap();
        let hv = Arc::new(
            FakeHypervisor::new()
                .with_vm("web", VmStatus::Running)
                .fail_on("delete", "web"),
        );
        let p = provisioner(&hv, state.path());

        let seed = paths::seed_path(state.path(), "web");
        std::fs::create_dir_all(seed.parent().unwrap()).unwrap();
        std::fs::write(&seed, "ISO").unwrap();

        let err = p.destroy("web").await.unwrap_err();
        assert!(matches!(err, FleetError::HypervisorCommand { .. }));
        assert!(!seed.exists());
    }
}
