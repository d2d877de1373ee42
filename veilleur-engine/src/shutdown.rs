//! Shutdown orchestration.
//!
//! Per candidate: `Candidate -> ShutdownIssued -> (wait) -> Verify ->
//! {Success | Warning | StillActive | Unknown}`. Before anything is issued,
//! a precondition gate drops hosts with an active interactive session and
//! hosts that are not currently up, both recorded with their reason, never
//! silently dropped. One power-off and one verification pass per host per
//! run.

use crate::config::RecheckPolicy;
use crate::model::{HostGroup, ProbeResult, ShutdownOutcome, ShutdownStatus};
use crate::pool::run_bounded;
use crate::probe::Prober;
use crate::remote::{Credential, RemoteExecutor};
use crate::session::SessionInspector;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const REASON_ACTIVE_SESSION: &str = "active session";
pub const REASON_UNREACHABLE: &str = "unreachable";

/// Forced remote power-off, no grace period.
const POWER_OFF: &str = "shutdown /s /f /t 0";

/// Map the post-wait probe onto a verification verdict. Every combination
/// of the two probe booleans maps to exactly one verdict.
pub fn classify_verification(probe: &ProbeResult) -> ShutdownStatus {
    match (probe.ping_reachable, probe.mgmt_port_reachable) {
        (false, false) => ShutdownStatus::Success,
        (true, false) => ShutdownStatus::Warning,
        (true, true) => ShutdownStatus::StillActive,
        // Cannot be produced by the probe (management is never tested when
        // ping fails), but the mapping stays total.
        (false, true) => ShutdownStatus::Unknown,
    }
}

/// Gate decision for one host, in group order.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub host: String,
    pub excluded_reason: Option<String>,
}

pub struct ShutdownOrchestrator {
    probe: Arc<dyn Prober>,
    sessions: Arc<dyn SessionInspector>,
    executor: Arc<dyn RemoteExecutor>,
    credential: Credential,
    policy: RecheckPolicy,
    parallelism: usize,
    use_dns: bool,
}

impl ShutdownOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        probe: Arc<dyn Prober>,
        sessions: Arc<dyn SessionInspector>,
        executor: Arc<dyn RemoteExecutor>,
        credential: Credential,
        policy: RecheckPolicy,
        parallelism: usize,
        use_dns: bool,
    ) -> Self {
        Self {
            probe,
            sessions,
            executor,
            credential,
            policy,
            parallelism,
            use_dns,
        }
    }

    /// Precondition gate. Probes fresh (never trusting probe state left
    /// over from an earlier stage), then queries the session inspector for
    /// hosts that are up.
    pub async fn plan(&self, group: &HostGroup) -> Vec<GateDecision> {
        let probe = self.probe.clone();
        let sessions = self.sessions.clone();
        let use_dns = self.use_dns;

        run_bounded(
            self.parallelism,
            group.hosts.iter().map(|h| h.name.clone()).collect(),
            move |host: String| {
                let probe = probe.clone();
                let sessions = sessions.clone();
                async move {
                    if !probe.probe(&host, use_dns).await.is_up() {
                        return GateDecision {
                            host,
                            excluded_reason: Some(REASON_UNREACHABLE.to_string()),
                        };
                    }
                    // A session query failure counts as "occupied": better
                    // to leave a host on than to pull it out from under a
                    // user we could not see.
                    let active = match sessions.has_active_session(&host).await {
                        Ok(active) => active,
                        Err(e) => {
                            warn!("session check on {} failed, keeping host up: {}", host, e);
                            true
                        }
                    };
                    GateDecision {
                        host,
                        excluded_reason: active.then(|| REASON_ACTIVE_SESSION.to_string()),
                    }
                }
            },
        )
        .await
    }

    /// Gate, issue, wait, verify. Outcomes come back in group order, one
    /// per host, excluded hosts included.
    pub async fn shutdown_batch(&self, group: &HostGroup) -> Vec<ShutdownOutcome> {
        let decisions = self.plan(group).await;
        let candidates: Vec<String> = decisions
            .iter()
            .filter(|d| d.excluded_reason.is_none())
            .map(|d| d.host.clone())
            .collect();
        info!(
            "shutdown: {} candidate(s), {} excluded",
            candidates.len(),
            decisions.len() - candidates.len()
        );

        // Issue pass.
        let executor = self.executor.clone();
        let credential = self.credential.clone();
        let issued = run_bounded(self.parallelism, candidates, move |host: String| {
            let executor = executor.clone();
            let credential = credential.clone();
            async move {
                match executor.run(&host, &credential, POWER_OFF).await {
                    Ok(out) if out.success() => {
                        info!("power-off issued to {}", host);
                        (host, None)
                    }
                    Ok(out) => {
                        let reason = format!("power-off exited {}: {}", out.exit_code, out.stderr.trim());
                        warn!("{}: {}", host, reason);
                        (host, Some(reason))
                    }
                    Err(e) => {
                        warn!("power-off delivery to {} failed: {}", host, e);
                        (host, Some(e.to_string()))
                    }
                }
            }
        })
        .await;

        let mut verdicts: Vec<ShutdownOutcome> = Vec::new();
        let mut pending: Vec<String> = Vec::new();
        for (host, failure) in issued {
            match failure {
                Some(reason) => verdicts.push(ShutdownOutcome {
                    host,
                    status: ShutdownStatus::CommandFailed,
                    reason: Some(reason),
                }),
                None => pending.push(host),
            }
        }

        // Verification pass(es): wait, re-probe, classify.
        for attempt in 1..=self.policy.max_attempts {
            if pending.is_empty() {
                break;
            }
            info!(
                "waiting {:?} before verifying {} shutdown(s)",
                self.policy.wait,
                pending.len()
            );
            tokio::time::sleep(self.policy.wait).await;

            let probe = self.probe.clone();
            let use_dns = self.use_dns;
            let checked = run_bounded(self.parallelism, pending.clone(), move |host: String| {
                let probe = probe.clone();
                async move {
                    let result = probe.probe(&host, use_dns).await;
                    (host, classify_verification(&result))
                }
            })
            .await;

            let last = attempt == self.policy.max_attempts;
            pending.clear();
            for (host, status) in checked {
                if status != ShutdownStatus::Success && !last {
                    // Not down yet and the policy grants another look.
                    pending.push(host);
                    continue;
                }
                let reason = match status {
                    ShutdownStatus::Warning => {
                        warn!("{} still answers ping, likely mid-shutdown or firewalled", host);
                        Some("still answers ping but not management".to_string())
                    }
                    ShutdownStatus::StillActive => {
                        error!("shutdown of {} did not take effect", host);
                        Some("still fully reachable after power-off".to_string())
                    }
                    _ => None,
                };
                verdicts.push(ShutdownOutcome {
                    host,
                    status,
                    reason,
                });
            }
        }

        self.merge_in_group_order(decisions, verdicts)
    }

    fn merge_in_group_order(
        &self,
        decisions: Vec<GateDecision>,
        verdicts: Vec<ShutdownOutcome>,
    ) -> Vec<ShutdownOutcome> {
        decisions
            .into_iter()
            .map(|d| match d.excluded_reason {
                Some(reason) => ShutdownOutcome {
                    host: d.host,
                    status: ShutdownStatus::Excluded,
                    reason: Some(reason),
                },
                None => verdicts
                    .iter()
                    .find(|v| v.host == d.host)
                    .cloned()
                    .unwrap_or(ShutdownOutcome {
                        host: d.host,
                        status: ShutdownStatus::Unknown,
                        reason: None,
                    }),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::model::HostIdentity;
    use crate::remote::ExecOutput;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn every_probe_combination_maps_to_exactly_one_verdict() {
        let combos = [
            (false, false, ShutdownStatus::Success),
            (true, false, ShutdownStatus::Warning),
            (true, true, ShutdownStatus::StillActive),
            (false, true, ShutdownStatus::Unknown),
        ];
        for (ping, mgmt, expected) in combos {
            let probe = ProbeResult {
                host: "pc01".to_string(),
                ping_reachable: ping,
                mgmt_port_reachable: mgmt,
                resolved_addrs: Vec::new(),
            };
            assert_eq!(classify_verification(&probe), expected, "({ping}, {mgmt})");
        }
    }

    /// Prober answering from a fixed table; hosts the executor has powered
    /// off stop answering both checks.
    struct TableProbe {
        up: HashSet<String>,
        powered_off: Arc<Mutex<HashSet<String>>>,
    }

    #[async_trait]
    impl Prober for TableProbe {
        async fn probe(&self, host: &str, _use_dns: bool) -> ProbeResult {
            let down = self.powered_off.lock().unwrap().contains(host);
            let up = self.up.contains(host) && !down;
            ProbeResult {
                host: host.to_string(),
                ping_reachable: up,
                mgmt_port_reachable: up,
                resolved_addrs: Vec::new(),
            }
        }
    }

    struct TableSessions {
        active: HashSet<String>,
    }

    #[async_trait]
    impl SessionInspector for TableSessions {
        async fn has_active_session(&self, host: &str) -> Result<bool, EngineError> {
            Ok(self.active.contains(host))
        }
    }

    /// Executor recording power-offs; hosts in `refuse` return exit 1 and
    /// hosts in `ignore` accept the command but never go down.
    struct TableExecutor {
        powered_off: Arc<Mutex<HashSet<String>>>,
        refuse: HashSet<String>,
        ignore: HashSet<String>,
    }

    #[async_trait]
    impl RemoteExecutor for TableExecutor {
        async fn run(
            &self,
            host: &str,
            _credential: &Credential,
            _script: &str,
        ) -> Result<ExecOutput, EngineError> {
            if self.refuse.contains(host) {
                return Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: "access denied".to_string(),
                    exit_code: 1,
                    execution_time_ms: 1,
                });
            }
            if !self.ignore.contains(host) {
                self.powered_off.lock().unwrap().insert(host.to_string());
            }
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                execution_time_ms: 1,
            })
        }
    }

    fn orchestrator(
        up: &[&str],
        active: &[&str],
        refuse: &[&str],
        ignore: &[&str],
    ) -> ShutdownOrchestrator {
        let powered_off = Arc::new(Mutex::new(HashSet::new()));
        ShutdownOrchestrator::new(
            Arc::new(TableProbe {
                up: up.iter().map(|s| s.to_string()).collect(),
                powered_off: powered_off.clone(),
            }),
            Arc::new(TableSessions {
                active: active.iter().map(|s| s.to_string()).collect(),
            }),
            Arc::new(TableExecutor {
                powered_off,
                refuse: refuse.iter().map(|s| s.to_string()).collect(),
                ignore: ignore.iter().map(|s| s.to_string()).collect(),
            }),
            Credential::new("fleet-admin", "secret"),
            RecheckPolicy::single(Duration::from_millis(5)),
            2,
            false,
        )
    }

    fn group(names: &[&str]) -> HostGroup {
        HostGroup::ephemeral(names.iter().map(|n| HostIdentity::named(*n)).collect())
    }

    #[tokio::test]
    async fn session_gate_excludes_exactly_the_occupied_host() {
        let orchestrator = orchestrator(&["A", "B", "C"], &["B"], &[], &[]);
        let decisions = orchestrator.plan(&group(&["A", "B", "C"])).await;

        let candidates: Vec<&str> = decisions
            .iter()
            .filter(|d| d.excluded_reason.is_none())
            .map(|d| d.host.as_str())
            .collect();
        assert_eq!(candidates, vec!["A", "C"]);

        let b = decisions.iter().find(|d| d.host == "B").unwrap();
        assert_eq!(b.excluded_reason.as_deref(), Some(REASON_ACTIVE_SESSION));
    }

    #[tokio::test]
    async fn unreachable_host_is_excluded_with_reason() {
        let orchestrator = orchestrator(&["A"], &[], &[], &[]);
        let outcomes = orchestrator.shutdown_batch(&group(&["A", "Z"])).await;

        assert_eq!(outcomes[1].host, "Z");
        assert_eq!(outcomes[1].status, ShutdownStatus::Excluded);
        assert_eq!(outcomes[1].reason.as_deref(), Some(REASON_UNREACHABLE));
        // A went through the whole machine and verified down.
        assert_eq!(outcomes[0].status, ShutdownStatus::Success);
    }

    #[tokio::test]
    async fn refused_command_and_ignored_command_classify_differently() {
        let orchestrator = orchestrator(&["A", "B"], &[], &["A"], &["B"]);
        let outcomes = orchestrator.shutdown_batch(&group(&["A", "B"])).await;

        assert_eq!(outcomes[0].status, ShutdownStatus::CommandFailed);
        // B accepted the command but stayed fully reachable.
        assert_eq!(outcomes[1].status, ShutdownStatus::StillActive);
    }
}
