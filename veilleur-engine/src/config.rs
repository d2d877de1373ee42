//! Fleet configuration: group membership, MAC addresses, timings.
//!
//! Loaded once per run from a YAML file and passed by reference into every
//! orchestrator constructor; there is no ambient global configuration.
//! Unlike host-level problems, anything wrong here (unreadable file, bad
//! YAML, unknown group) is fatal and aborts before any host is touched.

use crate::error::EngineError;
use crate::model::{HostGroup, HostIdentity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Group name → ordered host list.
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
    /// Host name → wake data (MAC, optional broadcast hint).
    #[serde(default)]
    pub hosts: HashMap<String, HostConf>,
    #[serde(default)]
    pub probe: ProbeConf,
    #[serde(default)]
    pub wake: WaitConf,
    #[serde(default)]
    pub shutdown: WaitConf,
    #[serde(default)]
    pub update: UpdateConf,
    #[serde(default)]
    pub remote: RemoteConf,
    /// Worker pool width per stage. 1 keeps strictly sequential,
    /// in-group-order processing.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// CPU percentage above which a host counts as high-load in the
    /// fleet summary.
    #[serde(default = "default_high_load")]
    pub high_load_cpu_percent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConf {
    pub mac: String,
    /// Broadcast address for the wake frame, ex: "192.168.10.255".
    /// Defaults to the limited broadcast when absent.
    pub broadcast: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConf {
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Windows RPC endpoint-mapper port, the "is it manageable" proxy.
    #[serde(default = "default_mgmt_port")]
    pub mgmt_port: u16,
    /// Resolve every IPv4 address of a name and test each one, instead of
    /// connecting to the name directly. Useful for multi-homed lab hosts.
    #[serde(default)]
    pub use_dns: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConf {
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Platform built-in update session/searcher.
    Native,
    /// Third-party update-management module with richer control.
    Extended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConf {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConf {
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
    /// Account used for remoting; the secret comes from the credential
    /// provider, never from this file.
    #[serde(default = "default_remote_user")]
    pub username: String,
}

fn default_parallelism() -> usize {
    1
}
fn default_high_load() -> f32 {
    90.0
}
fn default_ping_timeout_ms() -> u64 {
    1_000
}
fn default_connect_timeout_ms() -> u64 {
    2_000
}
fn default_mgmt_port() -> u16 {
    135
}
fn default_wait_secs() -> u64 {
    60
}
fn default_provider() -> ProviderKind {
    ProviderKind::Native
}
fn default_remote_timeout_secs() -> u64 {
    120
}
fn default_remote_user() -> String {
    "fleet-admin".to_string()
}

impl Default for ProbeConf {
    fn default() -> Self {
        Self {
            ping_timeout_ms: default_ping_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            mgmt_port: default_mgmt_port(),
            use_dns: false,
        }
    }
}

impl Default for WaitConf {
    fn default() -> Self {
        Self {
            wait_secs: default_wait_secs(),
        }
    }
}

impl Default for UpdateConf {
    fn default() -> Self {
        Self {
            provider: default_provider(),
        }
    }
}

impl Default for RemoteConf {
    fn default() -> Self {
        Self {
            timeout_secs: default_remote_timeout_secs(),
            username: default_remote_user(),
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            groups: HashMap::new(),
            hosts: HashMap::new(),
            probe: ProbeConf::default(),
            wake: WaitConf::default(),
            shutdown: WaitConf::default(),
            update: UpdateConf::default(),
            remote: RemoteConf::default(),
            parallelism: default_parallelism(),
            high_load_cpu_percent: default_high_load(),
        }
    }
}

/// Post-action recheck behavior: issue the action, sleep `wait`, re-probe.
/// `max_attempts` is 1 everywhere today; the knob exists so a bounded
/// backoff can later be introduced without touching call sites.
#[derive(Debug, Clone, Copy)]
pub struct RecheckPolicy {
    pub wait: Duration,
    pub max_attempts: u32,
}

impl RecheckPolicy {
    pub fn single(wait: Duration) -> Self {
        Self {
            wait,
            max_attempts: 1,
        }
    }
}

impl FleetConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let txt = fs::read_to_string(path).await.map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&txt).map_err(|e| {
            EngineError::Configuration(format!("invalid fleet file {}: {e}", path.display()))
        })
    }

    /// The identity for one host name, with MAC and broadcast hint filled
    /// in when the host is declared in the `hosts:` section.
    pub fn identity(&self, name: &str) -> HostIdentity {
        let mut id = HostIdentity::named(name);
        if let Some(conf) = self.hosts.get(name) {
            id.mac = Some(conf.mac.clone());
            id.broadcast_hint = conf.broadcast.clone();
        }
        id
    }

    /// Resolve a named group. Unknown names are a caller-visible error,
    /// never a crash or an empty fallback.
    pub fn resolve_group(&self, name: &str) -> Result<HostGroup, EngineError> {
        let members = self
            .groups
            .get(name)
            .ok_or_else(|| EngineError::Configuration(format!("unknown group '{name}'")))?;
        Ok(HostGroup {
            name: name.to_string(),
            hosts: members.iter().map(|h| self.identity(h)).collect(),
        })
    }

    /// Resolve a named group keeping only hosts with a known MAC. Hosts
    /// without one are returned separately so the wake stage can record
    /// them as failed instead of silently dropping them.
    pub fn resolve_mac_group(&self, name: &str) -> Result<(HostGroup, Vec<String>), EngineError> {
        let group = self.resolve_group(name)?;
        let (with_mac, without): (Vec<_>, Vec<_>) =
            group.hosts.into_iter().partition(|h| h.mac.is_some());
        Ok((
            HostGroup {
                name: name.to_string(),
                hosts: with_mac,
            },
            without.into_iter().map(|h| h.name).collect(),
        ))
    }

    /// Ephemeral group from an explicit host list (or a single name).
    pub fn ephemeral_group(&self, hosts: &[String]) -> HostGroup {
        HostGroup::ephemeral(hosts.iter().map(|h| self.identity(h)).collect())
    }

    pub fn wake_policy(&self) -> RecheckPolicy {
        RecheckPolicy::single(Duration::from_secs(self.wake.wait_secs))
    }

    pub fn shutdown_policy(&self) -> RecheckPolicy {
        RecheckPolicy::single(Duration::from_secs(self.shutdown.wait_secs))
    }
}
