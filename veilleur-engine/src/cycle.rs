//! One full fleet-management cycle.
//!
//! Resolve the group, wake everything (including the recheck), sample
//! session state and load for the hosts that are confirmed up, optionally
//! apply and verify updates, attempt shutdown for session-free hosts, then
//! hand every stage's output to the aggregator. Stage order is a hard
//! barrier: the wake recheck finishes before any later stage reads a
//! host's state, and the shutdown gate re-probes instead of trusting
//! probe results left over from the wake stage.

use crate::aggregate::{ResultAggregator, StageInputs};
use crate::config::FleetConfig;
use crate::error::EngineError;
use crate::load::LoadCollector;
use crate::model::{FleetReport, HostGroup, SessionState, WakeStatus};
use crate::pool::run_bounded;
use crate::probe::{Prober, ReadinessProbe};
use crate::remote::{Credential, CredentialProvider, PowerShellExecutor, RemoteExecutor};
use crate::session::{QuserSessionInspector, SessionInspector};
use crate::shutdown::ShutdownOrchestrator;
use crate::update::{
    ExtendedUpdateProvider, NativeUpdateProvider, UpdateOrchestrator, UpdateProvider,
};
use crate::wake::{UdpWakeSender, WakeOrchestrator, WakeSender};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Everything the engine talks to. Production wiring comes from
/// [`Collaborators::standard`]; tests inject scripted implementations.
#[derive(Clone)]
pub struct Collaborators {
    pub probe: Arc<dyn Prober>,
    pub wake_sender: Arc<dyn WakeSender>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub sessions: Arc<dyn SessionInspector>,
    pub provider: Arc<dyn UpdateProvider>,
    pub credential: Credential,
}

impl Collaborators {
    /// Default production wiring. Fetching the credential happens here, so
    /// a missing credential aborts before any host is touched.
    pub fn standard(
        config: &FleetConfig,
        credentials: &dyn CredentialProvider,
    ) -> Result<Self, EngineError> {
        let credential = credentials.credential()?;
        let timeout = Duration::from_secs(config.remote.timeout_secs);
        let executor: Arc<dyn RemoteExecutor> = Arc::new(PowerShellExecutor::new(timeout));
        let provider: Arc<dyn UpdateProvider> = match config.update.provider {
            crate::config::ProviderKind::Native => Arc::new(NativeUpdateProvider::new(
                executor.clone(),
                credential.clone(),
                timeout,
            )),
            crate::config::ProviderKind::Extended => Arc::new(ExtendedUpdateProvider::new(
                executor.clone(),
                credential.clone(),
                timeout,
            )),
        };
        Ok(Self {
            probe: Arc::new(ReadinessProbe::new(&config.probe)),
            wake_sender: Arc::new(UdpWakeSender),
            sessions: Arc::new(QuserSessionInspector::new(
                executor.clone(),
                credential.clone(),
            )),
            executor,
            provider,
            credential,
        })
    }
}

/// What one cycle should do beyond waking and aggregating.
#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    pub apply_updates: bool,
    pub force_updates: bool,
    pub verify_window_days: Option<u32>,
    pub shutdown: bool,
    pub collect_inventory: bool,
}

pub struct FleetCycle {
    config: FleetConfig,
    collaborators: Collaborators,
    wake: WakeOrchestrator,
    shutdown: ShutdownOrchestrator,
    update: UpdateOrchestrator,
    load: LoadCollector,
    aggregator: ResultAggregator,
}

impl FleetCycle {
    pub fn new(config: FleetConfig, collaborators: Collaborators) -> Self {
        let timeout = Duration::from_secs(config.remote.timeout_secs);
        let wake = WakeOrchestrator::new(
            collaborators.probe.clone(),
            collaborators.wake_sender.clone(),
            config.wake_policy(),
            config.parallelism,
            config.probe.use_dns,
        );
        let shutdown = ShutdownOrchestrator::new(
            collaborators.probe.clone(),
            collaborators.sessions.clone(),
            collaborators.executor.clone(),
            collaborators.credential.clone(),
            config.shutdown_policy(),
            config.parallelism,
            config.probe.use_dns,
        );
        let update = UpdateOrchestrator::new(collaborators.sessions.clone(), config.parallelism);
        let load = LoadCollector::new(
            collaborators.executor.clone(),
            collaborators.credential.clone(),
            timeout,
            config.parallelism,
        );
        let aggregator = ResultAggregator::new(config.high_load_cpu_percent);
        Self {
            config,
            collaborators,
            wake,
            shutdown,
            update,
            load,
            aggregator,
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Run one cycle against a named group.
    pub async fn run(&self, group_name: &str, opts: &CycleOptions) -> Result<FleetReport, EngineError> {
        let group = self.config.resolve_group(group_name)?;
        let (mac_group, missing_macs) = self.config.resolve_mac_group(group_name)?;
        info!(
            "cycle for group '{}': {} host(s), {} without mac",
            group_name,
            group.hosts.len(),
            missing_macs.len()
        );

        // Stage 1: wake, including the single recheck pass.
        let batch = self.wake.wake_batch(&mac_group).await;
        let mut wake_results: Vec<(String, WakeStatus)> = Vec::with_capacity(group.hosts.len());
        for host in &group.hosts {
            if let Some((_, status)) = batch.iter().find(|(h, _)| *h == host.name) {
                wake_results.push((host.name.clone(), *status));
            } else {
                warn!("{} has no mac on file, cannot be woken", host.name);
                wake_results.push((host.name.clone(), WakeStatus::Failed));
            }
        }

        // Hosts confirmed up after the recheck, in group order.
        let up_group = HostGroup::ephemeral(
            group
                .hosts
                .iter()
                .filter(|h| {
                    wake_results.iter().any(|(name, status)| {
                        *name == h.name
                            && matches!(status, WakeStatus::AlreadyUp | WakeStatus::Success)
                    })
                })
                .cloned()
                .collect(),
        );

        // Stage 2: session and load samples for the up hosts.
        let sessions = self.sample_sessions(&up_group).await;
        let load = self.load.sample_group(&up_group).await;
        let inventory = if opts.collect_inventory {
            self.load.inventory_group(&up_group).await
        } else {
            Vec::new()
        };

        // Stage 3: updates, if requested.
        let updates = if opts.apply_updates {
            self.update
                .apply(&up_group, self.collaborators.provider.clone(), opts.force_updates)
                .await
        } else {
            Vec::new()
        };
        let verified = match opts.verify_window_days {
            Some(days) => {
                self.update
                    .verify(&up_group, self.collaborators.provider.clone(), days)
                    .await
            }
            None => Vec::new(),
        };

        // Stage 4: shutdown over the full group, so unreachable hosts get
        // recorded with their exclusion reason. The gate re-probes.
        let shutdown = if opts.shutdown {
            self.shutdown.shutdown_batch(&group).await
        } else {
            Vec::new()
        };

        let (records, summary) = self.aggregator.aggregate(StageInputs {
            wake: wake_results,
            shutdown,
            sessions,
            load,
            updates,
            verified,
            inventory,
        });
        info!(
            "cycle for group '{}' done: {} host(s), overall {:?}",
            group_name, summary.total_hosts, summary.overall
        );
        Ok(FleetReport {
            group: group_name.to_string(),
            generated_at: Utc::now(),
            records,
            summary,
        })
    }

    async fn sample_sessions(&self, group: &HostGroup) -> Vec<SessionState> {
        let sessions = self.collaborators.sessions.clone();
        run_bounded(
            self.config.parallelism,
            group.hosts.iter().map(|h| h.name.clone()).collect(),
            move |host: String| {
                let sessions = sessions.clone();
                async move {
                    match sessions.has_active_session(&host).await {
                        Ok(active) => Some(SessionState {
                            host,
                            active_session: active,
                        }),
                        Err(e) => {
                            warn!("session sample on {} failed: {}", host, e);
                            None
                        }
                    }
                }
            },
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }
}
