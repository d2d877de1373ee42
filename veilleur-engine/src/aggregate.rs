//! Result aggregation: one canonical record per host, plus the fleet
//! summary.
//!
//! Records are seeded from the wake result set (every cycle begins with a
//! wake attempt) and enriched by host-name lookup. A host first seen in a
//! later stage gets its record created on sight; inconsistency between
//! stages is handled by lazy creation, never by dropping data. Summary
//! counts and percentages are computed exactly once, from the final record
//! set.

use crate::model::{
    FleetSummary, HostLifecycleRecord, InventorySnapshot, LoadSample, OverallStatus,
    SessionState, ShutdownOutcome, ShutdownStatus, UpdateEntry, UpdateStatus, WakeStatus,
};
use std::collections::HashMap;
use tracing::debug;

/// Everything the stages of one cycle produced.
#[derive(Debug, Default)]
pub struct StageInputs {
    pub wake: Vec<(String, WakeStatus)>,
    pub shutdown: Vec<ShutdownOutcome>,
    pub sessions: Vec<SessionState>,
    pub load: Vec<LoadSample>,
    pub updates: Vec<UpdateEntry>,
    pub verified: Vec<UpdateEntry>,
    pub inventory: Vec<InventorySnapshot>,
}

pub struct ResultAggregator {
    high_load_cpu_percent: f32,
}

/// Insertion-ordered record set keyed by host name.
struct RecordSet {
    records: Vec<HostLifecycleRecord>,
    index: HashMap<String, usize>,
}

impl RecordSet {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn entry(&mut self, host: &str) -> &mut HostLifecycleRecord {
        let idx = match self.index.get(host) {
            Some(&idx) => idx,
            None => {
                debug!("creating record for {} on first sight", host);
                self.records.push(HostLifecycleRecord::empty(host));
                let idx = self.records.len() - 1;
                self.index.insert(host.to_string(), idx);
                idx
            }
        };
        &mut self.records[idx]
    }
}

impl ResultAggregator {
    pub fn new(high_load_cpu_percent: f32) -> Self {
        Self {
            high_load_cpu_percent,
        }
    }

    pub fn aggregate(&self, inputs: StageInputs) -> (Vec<HostLifecycleRecord>, FleetSummary) {
        let mut set = RecordSet::new();

        for (host, status) in inputs.wake {
            set.entry(&host).wake = Some(status);
        }
        for outcome in inputs.shutdown {
            let host = outcome.host.clone();
            set.entry(&host).shutdown = Some(outcome);
        }
        for session in inputs.sessions {
            set.entry(&session.host).active_session = Some(session.active_session);
        }
        for sample in inputs.load {
            let host = sample.host.clone();
            set.entry(&host).load = Some(sample);
        }
        for entry in inputs.updates {
            let host = entry.host.clone();
            set.entry(&host).updates_applied.push(entry);
        }
        for entry in inputs.verified {
            let host = entry.host.clone();
            set.entry(&host).updates_verified.push(entry);
        }
        for snapshot in inputs.inventory {
            let host = snapshot.host.clone();
            set.entry(&host).inventory = Some(snapshot);
        }

        let summary = self.summarize(&set.records);
        (set.records, summary)
    }

    /// Derived counts, computed once from the final record set.
    fn summarize(&self, records: &[HostLifecycleRecord]) -> FleetSummary {
        let total_hosts = records.len();
        let failed_wake = records
            .iter()
            .filter(|r| r.wake == Some(WakeStatus::Failed))
            .count();
        let failed_shutdown = records
            .iter()
            .filter(|r| {
                matches!(
                    r.shutdown.as_ref().map(|s| s.status),
                    Some(ShutdownStatus::StillActive)
                        | Some(ShutdownStatus::CommandFailed)
                        | Some(ShutdownStatus::Unknown)
                )
            })
            .count();
        let high_load = records
            .iter()
            .filter(|r| {
                r.load
                    .as_ref()
                    .map(|l| l.cpu_percent >= self.high_load_cpu_percent)
                    .unwrap_or(false)
            })
            .count();
        let active_sessions = records
            .iter()
            .filter(|r| r.active_session == Some(true))
            .count();

        // A failed update or a shutdown that did not take effect counts as
        // a critical event for the overall verdict.
        let critical_events = records
            .iter()
            .map(|r| {
                let failed_updates = r
                    .updates_applied
                    .iter()
                    .filter(|u| u.status == UpdateStatus::Failed)
                    .count();
                let stuck = usize::from(
                    r.shutdown.as_ref().map(|s| s.status) == Some(ShutdownStatus::StillActive),
                );
                failed_updates + stuck
            })
            .sum();

        let failed_hosts = failed_wake + failed_shutdown;
        let failed_percentage = if total_hosts == 0 {
            0.0
        } else {
            (failed_hosts as f32 / total_hosts as f32) * 100.0
        };

        let overall = if failed_hosts == 0 && critical_events == 0 {
            OverallStatus::Success
        } else {
            OverallStatus::PartialFailures
        };

        FleetSummary {
            total_hosts,
            failed_wake,
            failed_shutdown,
            high_load,
            critical_events,
            active_sessions,
            failed_percentage,
            overall,
        }
    }
}
