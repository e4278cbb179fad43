//! Fleet scheduling across `start_after` dependencies.
//!
//! Each VM gets a task. A task first waits for every dependency to reach
//! *started* (not ready), then takes a concurrency permit and runs the
//! lifecycle while holding it. Each task publishes its own gate: `Started`
//! once the VM is running, `Blocked` if it failed, was skipped or was
//! cancelled. Dependents of a blocked VM are skipped without any hypervisor
//! call; unrelated branches carry on.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use crate::error::FleetError;
use crate::lifecycle::Provisioner;
use crate::status::{FleetReport, VmOutcome};
use crate::vm::VmSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Pending,
    Started,
    Blocked,
}

/// Check names and dependencies, returning indices of `vms` in a start
/// order that honors `start_after`. Ties keep declaration order.
pub fn start_order(vms: &[VmSpec]) -> Result<Vec<usize>, FleetError> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, vm) in vms.iter().enumerate() {
        if index.insert(vm.name.as_str(), i).is_some() {
            return Err(FleetError::Validation {
                message: format!("VM '{}' is declared more than once", vm.name),
            });
        }
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); vms.len()];
    let mut unmet: Vec<usize> = vec![0; vms.len()];
    for (i, vm) in vms.iter().enumerate() {
        for dep in &vm.start_after {
            let Some(&d) = index.get(dep.as_str()) else {
                return Err(FleetError::UnknownDependency {
                    vm: vm.name.clone(),
                    dependency: dep.clone(),
                });
            };
            dependents[d].push(i);
            unmet[i] += 1;
        }
    }

    let mut ready: VecDeque<usize> = (0..vms.len()).filter(|&i| unmet[i] == 0).collect();
    let mut order = Vec::with_capacity(vms.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &j in &dependents[i] {
            unmet[j] -= 1;
            if unmet[j] == 0 {
                ready.push_back(j);
            }
        }
    }

    if order.len() < vms.len() {
        return Err(FleetError::DependencyCycle {
            members: cycle_members(vms, &unmet, &dependents),
        });
    }
    Ok(order)
}

/// Names of VMs on a cycle. VMs merely downstream of one are dropped.
fn cycle_members(vms: &[VmSpec], unmet: &[usize], dependents: &[Vec<usize>]) -> Vec<String> {
    let mut left: BTreeSet<usize> = (0..vms.len()).filter(|&i| unmet[i] > 0).collect();
    loop {
        let leaves: Vec<usize> = left
            .iter()
            .copied()
            .filter(|&i| !dependents[i].iter().any(|j| left.contains(j)))
            .collect();
        if leaves.is_empty() {
            break;
        }
        for i in leaves {
            left.remove(&i);
        }
    }
    let mut names: Vec<String> = left.into_iter().map(|i| vms[i].name.clone()).collect();
    names.sort();
    names
}

fn lookup<'a>(vms: &'a [VmSpec], name: &str) -> Result<&'a VmSpec, FleetError> {
    vms.iter()
        .find(|vm| vm.name == name)
        .ok_or_else(|| FleetError::Validation {
            message: format!("unknown VM '{name}'"),
        })
}

/// The named VMs plus everything they transitively start after, in
/// declaration order. No names selects the whole fleet.
pub fn with_dependencies(vms: &[VmSpec], names: &[String]) -> Result<Vec<VmSpec>, FleetError> {
    if names.is_empty() {
        return Ok(vms.to_vec());
    }
    let mut wanted: BTreeSet<String> = BTreeSet::new();
    let mut queue: Vec<String> = names.to_vec();
    while let Some(name) = queue.pop() {
        let vm = lookup(vms, &name)?;
        if wanted.insert(name) {
            queue.extend(vm.start_after.iter().cloned());
        }
    }
    Ok(vms
        .iter()
        .filter(|vm| wanted.contains(&vm.name))
        .cloned()
        .collect())
}

/// `vms` with `start_after` entries outside the selection dropped.
fn within_selection(vms: &[VmSpec]) -> Vec<VmSpec> {
    let names: BTreeSet<&str> = vms.iter().map(|vm| vm.name.as_str()).collect();
    vms.iter()
        .map(|vm| {
            let mut vm = vm.clone();
            vm.start_after.retain(|dep| names.contains(dep.as_str()));
            vm
        })
        .collect()
}

/// Only the named VMs, in declaration order. No names selects all.
pub fn named(vms: &[VmSpec], names: &[String]) -> Result<Vec<VmSpec>, FleetError> {
    for name in names {
        lookup(vms, name)?;
    }
    Ok(vms
        .iter()
        .filter(|vm| names.is_empty() || names.contains(&vm.name))
        .cloned()
        .collect())
}

pub struct FleetScheduler {
    provisioner: Arc<Provisioner>,
    max_concurrency: usize,
}

impl FleetScheduler {
    pub fn new(provisioner: Arc<Provisioner>) -> Self {
        let max_concurrency = provisioner.settings().max_concurrency.max(1);
        Self {
            provisioner,
            max_concurrency,
        }
    }

    /// Provision `vms`. Dependency problems are returned before any
    /// hypervisor call; per-VM failures end up in the report.
    pub async fn run(&self, vms: &[VmSpec]) -> Result<FleetReport, FleetError> {
        start_order(vms)?;
        tracing::info!(
            vms = vms.len(),
            max_concurrency = self.max_concurrency,
            "provisioning fleet"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut gates: HashMap<String, watch::Receiver<Gate>> = HashMap::new();
        let mut senders = Vec::with_capacity(vms.len());
        for vm in vms {
            let (tx, rx) = watch::channel(Gate::Pending);
            gates.insert(vm.name.clone(), rx);
            senders.push(tx);
        }

        let mut tasks = JoinSet::new();
        for (spec, gate) in vms.iter().zip(senders) {
            let deps: Vec<(String, watch::Receiver<Gate>)> = spec
                .start_after
                .iter()
                .filter_map(|d| gates.get(d).map(|rx| (d.clone(), rx.clone())))
                .collect();
            let spec = spec.clone();
            let provisioner = self.provisioner.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let outcome = run_one(&provisioner, &spec, deps, semaphore, &gate).await;
                (spec.name, outcome)
            });
        }

        let mut finished: HashMap<String, VmOutcome> = HashMap::new();
        let mut aborted = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, outcome)) => {
                    tracing::info!(vm = %name, outcome = outcome.label(), "VM finished");
                    finished.insert(name, outcome);
                }
                Err(e) => {
                    tracing::error!(error = %e, "provisioning task aborted");
                    aborted = Some(e.to_string());
                }
            }
        }

        let mut report = FleetReport::default();
        for vm in vms {
            // a task that died never reported back
            let outcome = finished.remove(&vm.name).unwrap_or_else(|| {
                VmOutcome::Failed(FleetError::TaskAborted {
                    name: vm.name.clone(),
                    message: aborted.clone().unwrap_or_default(),
                })
            });
            report.outcomes.push((vm.name.clone(), outcome));
        }
        Ok(report)
    }

    /// Destroy `vms` one at a time, dependents before their dependencies.
    /// Every VM is attempted even when an earlier one fails. Dependencies
    /// outside `vms` do not constrain the order.
    pub async fn teardown(
        &self,
        vms: &[VmSpec],
    ) -> Result<Vec<(String, Result<(), FleetError>)>, FleetError> {
        let mut order = start_order(&within_selection(vms))?;
        order.reverse();
        let mut results = Vec::with_capacity(order.len());
        for i in order {
            let name = &vms[i].name;
            let result = self.provisioner.destroy(name).await;
            if let Err(e) = &result {
                tracing::error!(vm = %name, error = %e, "destroy failed");
            }
            results.push((name.clone(), result));
        }
        Ok(results)
    }
}

async fn run_one(
    provisioner: &Provisioner,
    spec: &VmSpec,
    deps: Vec<(String, watch::Receiver<Gate>)>,
    semaphore: Arc<Semaphore>,
    gate: &watch::Sender<Gate>,
) -> VmOutcome {
    let cancel = provisioner.cancellation().clone();
    let cancelled = || {
        gate.send_replace(Gate::Blocked);
        VmOutcome::Failed(FleetError::Cancelled {
            what: format!("provisioning of '{}'", spec.name),
        })
    };

    for (dep, mut rx) in deps {
        let reached = tokio::select! {
            _ = cancel.cancelled() => return cancelled(),
            r = rx.wait_for(|g| *g != Gate::Pending) => r.map(|g| *g).unwrap_or(Gate::Blocked),
        };
        if reached != Gate::Started {
            tracing::warn!(vm = %spec.name, dependency = %dep, "skipping, dependency did not start");
            gate.send_replace(Gate::Blocked);
            return VmOutcome::Skipped { blocked_by: dep };
        }
    }

    let _permit = tokio::select! {
        _ = cancel.cancelled() => return cancelled(),
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return cancelled(),
        },
    };

    let launched = match provisioner.launch(spec).await {
        Ok(launched) => launched,
        Err(e) => {
            gate.send_replace(Gate::Blocked);
            return VmOutcome::Failed(e);
        }
    };
    gate.send_replace(Gate::Started);

    match provisioner.settle(spec, launched).await {
        Ok(p) if p.readiness.ready => VmOutcome::Ready(p.result),
        Ok(p) => VmOutcome::Degraded(p.result),
        Err(e) => VmOutcome::Failed(e),
    }
}
