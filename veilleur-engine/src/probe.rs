//! Readiness probing: is a host alive, and is it manageable?
//!
//! Two-step check shared by every orchestrator. Step one is an ICMP-style
//! reachability test with a single-attempt timeout; step two is a TCP
//! connect against the Windows RPC endpoint-mapper port. An unreachable
//! host short-circuits step two.

use crate::config::ProbeConf;
use crate::error::EngineError;
use crate::model::ProbeResult;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::process::Command;
use tracing::{debug, warn};

/// Seam for the orchestrators: production code uses [`ReadinessProbe`],
/// tests substitute scripted probers.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe one host. Never fails: network errors during either step are
    /// logged and reported as a negative result for that step.
    async fn probe(&self, host: &str, use_dns: bool) -> ProbeResult;
}

pub struct ReadinessProbe {
    ping_timeout: Duration,
    connect_timeout: Duration,
    mgmt_port: u16,
}

impl ReadinessProbe {
    pub fn new(conf: &ProbeConf) -> Self {
        Self {
            ping_timeout: Duration::from_millis(conf.ping_timeout_ms),
            connect_timeout: Duration::from_millis(conf.connect_timeout_ms),
            mgmt_port: conf.mgmt_port,
        }
    }

    /// One ping, one attempt, fixed timeout. Shells out to the platform
    /// ping binary rather than opening raw ICMP sockets, which would need
    /// elevation.
    async fn ping(&self, host: &str) -> bool {
        let mut cmd = Command::new("ping");
        if cfg!(target_os = "windows") {
            cmd.args(["-n", "1", "-w", &self.ping_timeout.as_millis().to_string()]);
        } else {
            let secs = self.ping_timeout.as_secs().max(1);
            cmd.args(["-c", "1", "-W", &secs.to_string()]);
        }
        cmd.arg(host);

        match cmd.output().await {
            Ok(out) => out.status.success(),
            Err(e) => {
                warn!("ping {} failed to execute: {}", host, e);
                false
            }
        }
    }

    async fn connect(&self, target: &str) -> bool {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("connect {} refused: {}", target, e);
                false
            }
            Err(_) => {
                debug!("connect {} timed out", target);
                false
            }
        }
    }

    /// All IPv4 addresses for the name. Resolution failure is a negative
    /// result, not an error: the caller's loop over remaining hosts must
    /// keep going.
    async fn resolve_v4(&self, host: &str) -> Vec<Ipv4Addr> {
        match lookup_host((host, self.mgmt_port)).await {
            Ok(addrs) => addrs
                .filter_map(|a| match a {
                    SocketAddr::V4(v4) => Some(*v4.ip()),
                    SocketAddr::V6(_) => None,
                })
                .collect(),
            Err(e) => {
                warn!("dns resolution for {} failed: {}", host, e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Prober for ReadinessProbe {
    async fn probe(&self, host: &str, use_dns: bool) -> ProbeResult {
        if !self.ping(host).await {
            debug!("{} does not answer ping, skipping management check", host);
            return ProbeResult::unreachable(host);
        }

        let mut result = ProbeResult {
            host: host.to_string(),
            ping_reachable: true,
            mgmt_port_reachable: false,
            resolved_addrs: Vec::new(),
        };

        if use_dns {
            // Multi-homed hosts: test every interface, first positive wins.
            result.resolved_addrs = self.resolve_v4(host).await;
            for addr in &result.resolved_addrs {
                if self.connect(&format!("{addr}:{}", self.mgmt_port)).await {
                    result.mgmt_port_reachable = true;
                    break;
                }
            }
        } else {
            result.mgmt_port_reachable = self.connect(&format!("{host}:{}", self.mgmt_port)).await;
        }

        debug!(
            "probe {}: ping={} mgmt={}",
            host, result.ping_reachable, result.mgmt_port_reachable
        );
        result
    }
}
