//! Shared data model for the lifecycle engine.
//!
//! Everything that leaves the engine (per-host records, fleet summary,
//! update entries) is `Serialize`: this is the data contract consumed by
//! the reporting and dashboard layers, which live outside this workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// A host as named in the fleet configuration. The MAC address and the
/// broadcast hint are only needed for wake frames and stay `None` for hosts
/// that were never declared in the `hosts:` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub name: String,
    pub mac: Option<String>,
    pub broadcast_hint: Option<String>,
}

impl HostIdentity {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mac: None,
            broadcast_hint: None,
        }
    }
}

/// Named, ordered set of hosts. Group order is the processing order for
/// every stage of a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct HostGroup {
    pub name: String,
    pub hosts: Vec<HostIdentity>,
}

impl HostGroup {
    /// Ephemeral group built from an explicit host list. Unifies the
    /// "single host" and "host list" invocation modes with named groups:
    /// both route through the same batch paths.
    pub fn ephemeral(hosts: Vec<HostIdentity>) -> Self {
        Self {
            name: "<ephemeral>".to_string(),
            hosts,
        }
    }

    pub fn single(host: HostIdentity) -> Self {
        Self::ephemeral(vec![host])
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Outcome of one readiness probe. Produced fresh on every call, never
/// cached across cycles.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub host: String,
    pub ping_reachable: bool,
    pub mgmt_port_reachable: bool,
    pub resolved_addrs: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reachability {
    /// Ping and management port both answer: fully booted and manageable.
    Up,
    /// Answers ping but not the management port: booting or firewalled.
    PingOnly,
    /// No ping answer. The management check is never attempted here, so a
    /// "management-only" state cannot occur by construction.
    Unreachable,
}

impl ProbeResult {
    pub fn unreachable(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ping_reachable: false,
            mgmt_port_reachable: false,
            resolved_addrs: Vec::new(),
        }
    }

    pub fn classification(&self) -> Reachability {
        match (self.ping_reachable, self.mgmt_port_reachable) {
            (true, true) => Reachability::Up,
            (true, false) => Reachability::PingOnly,
            (false, _) => Reachability::Unreachable,
        }
    }

    pub fn is_up(&self) -> bool {
        self.classification() == Reachability::Up
    }
}

/// Final per-host wake classification after the batch recheck pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WakeStatus {
    /// Probe reported the host up before any frame was sent; waking is a
    /// no-op with respect to network traffic.
    AlreadyUp,
    /// Frame sent, recheck not yet run. Only visible between the send pass
    /// and the recheck pass of a batch.
    PendingVerification,
    Success,
    Failed,
}

/// Shutdown verification classification, mapped from the post-wait probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownStatus {
    /// Host failed the precondition gate; see the outcome reason.
    Excluded,
    /// No ping, no management port: host fully down.
    Success,
    /// Still answers ping but not the management port, likely mid-shutdown
    /// or firewalled.
    Warning,
    /// Both checks still answer: the power-off did not take effect.
    StillActive,
    /// Probe returned a combination that should not occur.
    Unknown,
    /// The power-off command itself could not be delivered.
    CommandFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownOutcome {
    pub host: String,
    pub status: ShutdownStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Installed,
    Failed,
    Skipped,
}

/// One update action taken during this run, or one historical update found
/// by the verification pass.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateEntry {
    pub host: String,
    pub title: String,
    pub status: UpdateStatus,
    pub timestamp: DateTime<Utc>,
}

impl UpdateEntry {
    pub fn new(host: impl Into<String>, title: impl Into<String>, status: UpdateStatus) -> Self {
        Self {
            host: host.into(),
            title: title.into(),
            status,
            timestamp: Utc::now(),
        }
    }

    /// The single entry recorded when apply or verify blows up for a host.
    pub fn error(host: impl Into<String>) -> Self {
        Self::new(host, "Error", UpdateStatus::Failed)
    }
}

/// Interactive session state sampled for one host.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub host: String,
    pub active_session: bool,
}

/// Resource load sampled for one host.
#[derive(Debug, Clone, Serialize)]
pub struct LoadSample {
    pub host: String,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub uptime_seconds: u64,
}

/// Optional hardware/OS inventory captured alongside the load sample.
#[derive(Debug, Clone, Serialize)]
pub struct InventorySnapshot {
    pub host: String,
    pub os_caption: String,
    pub manufacturer: String,
    pub model: String,
}

/// The canonical per-host aggregate. Exactly one record exists per host
/// name per run; later stages enrich the same record.
#[derive(Debug, Clone, Serialize)]
pub struct HostLifecycleRecord {
    pub host: String,
    pub wake: Option<WakeStatus>,
    pub shutdown: Option<ShutdownOutcome>,
    pub active_session: Option<bool>,
    pub load: Option<LoadSample>,
    pub updates_applied: Vec<UpdateEntry>,
    pub updates_verified: Vec<UpdateEntry>,
    pub inventory: Option<InventorySnapshot>,
}

impl HostLifecycleRecord {
    pub fn empty(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            wake: None,
            shutdown: None,
            active_session: None,
            load: None,
            updates_applied: Vec::new(),
            updates_verified: Vec::new(),
            inventory: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverallStatus {
    Success,
    PartialFailures,
}

/// Fleet-wide counts and percentages, recomputed once per run from the
/// final record set. Never updated incrementally: the summary can therefore
/// not drift from the records it summarizes.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSummary {
    pub total_hosts: usize,
    pub failed_wake: usize,
    pub failed_shutdown: usize,
    pub high_load: usize,
    pub critical_events: usize,
    pub active_sessions: usize,
    pub failed_percentage: f32,
    pub overall: OverallStatus,
}

/// Engine output for one full cycle: the data contract for the reporting
/// layer.
#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    pub group: String,
    pub generated_at: DateTime<Utc>,
    pub records: Vec<HostLifecycleRecord>,
    pub summary: FleetSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_classification_covers_reachable_states() {
        let mut probe = ProbeResult::unreachable("pc01");
        assert_eq!(probe.classification(), Reachability::Unreachable);

        probe.ping_reachable = true;
        assert_eq!(probe.classification(), Reachability::PingOnly);

        probe.mgmt_port_reachable = true;
        assert_eq!(probe.classification(), Reachability::Up);
        assert!(probe.is_up());
    }

    #[test]
    fn ephemeral_group_keeps_order() {
        let group = HostGroup::ephemeral(vec![
            HostIdentity::named("pc03"),
            HostIdentity::named("pc01"),
        ]);
        let names: Vec<&str> = group.hosts.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["pc03", "pc01"]);
    }
}
