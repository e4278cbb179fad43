//! Bounded polling for guest readiness.
//!
//! A guest is ready once it reports a global IPv4 address and the
//! completion marker file exists. Guest commands that fail are read as
//! "not yet"; only cancellation ends the loop early with an error.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::FleetError;
use crate::hypervisor::{Hypervisor, parse_guest_ipv4};

pub const ADDRESS_PROBE: &str = "ip -4 -o addr show scope global";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub interval: Duration,
    /// Guest path whose existence signals first-boot setup has finished.
    pub marker: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub ip: Option<Ipv4Addr>,
    pub ready: bool,
    pub attempts: u32,
}

pub fn marker_probe(marker: &str) -> String {
    format!("test -f '{}'", marker.replace('\'', r"'\''"))
}

/// Poll `name` until both the address and the marker are seen, or until
/// `policy.timeout` has elapsed.
#[tracing::instrument(skip(hv, policy, cancel), fields(timeout = ?policy.timeout))]
pub async fn await_ready(
    hv: &dyn Hypervisor,
    name: &str,
    policy: &ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<Readiness, FleetError> {
    let started = Instant::now();
    let marker_cmd = marker_probe(&policy.marker);
    let mut outcome = Readiness {
        ip: None,
        ready: false,
        attempts: 0,
    };

    while started.elapsed() < policy.timeout {
        outcome.attempts += 1;

        if let Some(ip) = probe(hv, name, ADDRESS_PROBE).await?.and_then(|out| parse_guest_ipv4(&out))
        {
            outcome.ip = Some(ip);
            if probe(hv, name, &marker_cmd).await?.is_some() {
                outcome.ready = true;
                tracing::info!(attempts = outcome.attempts, %ip, "guest ready");
                return Ok(outcome);
            }
        }
        tracing::debug!(attempts = outcome.attempts, ip = ?outcome.ip, "guest not ready yet");

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(FleetError::Cancelled {
                    what: format!("readiness wait for '{name}'"),
                });
            }
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }

    tracing::warn!(
        attempts = outcome.attempts,
        ip = ?outcome.ip,
        "guest did not report ready before timeout"
    );
    Ok(outcome)
}

/// Stdout of a guest command when it succeeded, `None` for any failure
/// other than cancellation.
async fn probe(hv: &dyn Hypervisor, name: &str, command: &str) -> Result<Option<String>, FleetError> {
    match hv.exec_in_guest(name, command).await {
        Ok(out) if out.success() => Ok(Some(out.stdout)),
        Ok(out) => {
            tracing::debug!(command, code = out.code, "guest probe not successful");
            Ok(None)
        }
        Err(e @ FleetError::Cancelled { .. }) => Err(e),
        Err(e) => {
            tracing::debug!(command, error = %e, "guest probe failed");
            Ok(None)
        }
    }
}
