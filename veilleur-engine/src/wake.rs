//! Wake orchestration.
//!
//! Per-host machine: `Unknown -> {AlreadyUp | PacketSent ->
//! PendingVerification -> {Success | Failed}}`. A batch probes every host,
//! sends one magic packet to each host that is not already up, sleeps one
//! fleet-wide interval, then re-probes the pending hosts exactly once. One
//! attempt and one recheck is the whole contract, no retry loop.

use crate::config::RecheckPolicy;
use crate::error::EngineError;
use crate::model::{HostGroup, HostIdentity, WakeStatus};
use crate::pool::run_bounded;
use crate::probe::Prober;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use tracing::{info, warn};

fn parse_mac(mac: &str) -> Result<[u8; 6], EngineError> {
    let hex: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() != 12 {
        return Err(EngineError::Configuration(format!("invalid mac '{mac}'")));
    }
    let mut out = [0u8; 6];
    for i in 0..6 {
        out[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| EngineError::Configuration(format!("invalid mac '{mac}'")))?;
    }
    Ok(out)
}

/// 6 x 0xFF puis 16 fois l'adresse MAC.
fn magic_packet(mac: [u8; 6]) -> [u8; 102] {
    let mut pkt = [0u8; 102];
    for b in pkt.iter_mut().take(6) {
        *b = 0xFF;
    }
    for i in 0..16 {
        let base = 6 + i * 6;
        pkt[base..base + 6].copy_from_slice(&mac);
    }
    pkt
}

fn parse_broadcast(hint: Option<&str>) -> Ipv4Addr {
    hint.and_then(|s| s.parse().ok())
        .unwrap_or(Ipv4Addr::new(255, 255, 255, 255))
}

/// Seam for the wake-frame transmission. The idempotence property ("no
/// packet for an already-up host") is tested against this trait.
#[async_trait]
pub trait WakeSender: Send + Sync {
    async fn send(&self, host: &HostIdentity) -> Result<(), EngineError>;
}

/// Broadcasts the magic packet over UDP, ports 9 then 7; either send
/// reaching the wire counts as success.
pub struct UdpWakeSender;

#[async_trait]
impl WakeSender for UdpWakeSender {
    async fn send(&self, host: &HostIdentity) -> Result<(), EngineError> {
        let mac = host
            .mac
            .as_deref()
            .ok_or_else(|| EngineError::Configuration(format!("no mac for '{}'", host.name)))?;
        let pkt = magic_packet(parse_mac(mac)?);
        let bcast = parse_broadcast(host.broadcast_hint.as_deref());

        let sock = UdpSocket::bind(("0.0.0.0", 0))?;
        sock.set_broadcast(true)?;

        let mut delivered = false;
        for port in [9u16, 7u16] {
            let addr = SocketAddrV4::new(bcast, port);
            match sock.send_to(&pkt, addr) {
                Ok(_) => delivered = true,
                Err(e) => warn!("wake send to {}:{} failed: {}", bcast, port, e),
            }
        }
        if delivered {
            Ok(())
        } else {
            Err(EngineError::remote(&host.name, "wake frame not delivered"))
        }
    }
}

pub struct WakeOrchestrator {
    probe: Arc<dyn Prober>,
    sender: Arc<dyn WakeSender>,
    policy: RecheckPolicy,
    parallelism: usize,
    use_dns: bool,
}

impl WakeOrchestrator {
    pub fn new(
        probe: Arc<dyn Prober>,
        sender: Arc<dyn WakeSender>,
        policy: RecheckPolicy,
        parallelism: usize,
        use_dns: bool,
    ) -> Self {
        Self {
            probe,
            sender,
            policy,
            parallelism,
            use_dns,
        }
    }

    /// Wake a single host by routing it through the batch path as a
    /// one-element ephemeral group. A host that is already reachable
    /// returns `AlreadyUp`: the no-op success variant, with no frame sent
    /// and no recheck wait.
    pub async fn wake_one(&self, host: HostIdentity) -> WakeStatus {
        let name = host.name.clone();
        let results = self.wake_batch(&HostGroup::single(host)).await;
        results
            .into_iter()
            .find(|(h, _)| *h == name)
            .map(|(_, s)| s)
            .unwrap_or(WakeStatus::Failed)
    }

    /// Wake every host of the group. Returns one final status per host in
    /// group order, after the single fleet-wide wait and recheck pass.
    pub async fn wake_batch(&self, group: &HostGroup) -> Vec<(String, WakeStatus)> {
        let probe = self.probe.clone();
        let sender = self.sender.clone();
        let use_dns = self.use_dns;

        let mut results: Vec<(String, WakeStatus)> = run_bounded(
            self.parallelism,
            group.hosts.clone(),
            move |host: HostIdentity| {
                let probe = probe.clone();
                let sender = sender.clone();
                async move {
                    // Probe first: waking an already-up host must be a
                    // no-op on the wire.
                    if probe.probe(&host.name, use_dns).await.is_up() {
                        info!("{} already up, no wake frame sent", host.name);
                        return (host.name, WakeStatus::AlreadyUp);
                    }
                    match sender.send(&host).await {
                        Ok(()) => {
                            info!("wake frame sent to {}", host.name);
                            (host.name, WakeStatus::PendingVerification)
                        }
                        Err(e) => {
                            warn!("wake of {} failed: {}", host.name, e);
                            (host.name, WakeStatus::Failed)
                        }
                    }
                }
            },
        )
        .await;

        let mut pending: Vec<String> = results
            .iter()
            .filter(|(_, s)| *s == WakeStatus::PendingVerification)
            .map(|(h, _)| h.clone())
            .collect();

        for _attempt in 0..self.policy.max_attempts {
            if pending.is_empty() {
                break;
            }
            info!(
                "waiting {:?} before rechecking {} pending host(s)",
                self.policy.wait,
                pending.len()
            );
            tokio::time::sleep(self.policy.wait).await;

            let probe = self.probe.clone();
            let rechecked = run_bounded(self.parallelism, pending.clone(), move |host: String| {
                let probe = probe.clone();
                async move {
                    let up = probe.probe(&host, use_dns).await.is_up();
                    (host, up)
                }
            })
            .await;

            pending.clear();
            for (host, up) in rechecked {
                if up {
                    resolve(&mut results, &host, WakeStatus::Success);
                } else {
                    pending.push(host);
                }
            }
        }

        // Whatever is still pending after the last recheck failed to come up.
        for host in pending {
            warn!("{} did not come up after wake", host);
            resolve(&mut results, &host, WakeStatus::Failed);
        }
        results
    }
}

fn resolve(results: &mut [(String, WakeStatus)], host: &str, status: WakeStatus) {
    if let Some(entry) = results.iter_mut().find(|(h, _)| h == host) {
        entry.1 = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProbeResult;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn magic_packet_layout() {
        let mac = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01];
        let pkt = magic_packet(mac);
        assert_eq!(&pkt[..6], &[0xFF; 6]);
        for i in 0..16 {
            assert_eq!(&pkt[6 + i * 6..12 + i * 6], &mac);
        }
    }

    #[test]
    fn mac_parsing_accepts_common_separators() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:01").unwrap(),
            [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]
        );
        assert_eq!(parse_mac("AA-BB-CC-DD-EE-01").unwrap(), parse_mac("aabbccddee01").unwrap());
        assert!(parse_mac("aa:bb:cc").is_err());
        assert!(parse_mac("zz:bb:cc:dd:ee:01").is_err());
    }

    #[test]
    fn broadcast_hint_falls_back_to_limited_broadcast() {
        assert_eq!(
            parse_broadcast(Some("192.168.10.255")),
            Ipv4Addr::new(192, 168, 10, 255)
        );
        assert_eq!(parse_broadcast(Some("not-an-ip")), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(parse_broadcast(None), Ipv4Addr::new(255, 255, 255, 255));
    }

    /// Prober scripted per host: `up_now` answer first, then `up_later`
    /// for every probe after a wake frame was recorded for that host.
    struct ScriptedProbe {
        up_now: HashSet<String>,
        up_after_wake: HashSet<String>,
        woken: Arc<Mutex<HashSet<String>>>,
    }

    #[async_trait]
    impl Prober for ScriptedProbe {
        async fn probe(&self, host: &str, _use_dns: bool) -> ProbeResult {
            let woken = self.woken.lock().unwrap().contains(host);
            let up = self.up_now.contains(host) || (woken && self.up_after_wake.contains(host));
            ProbeResult {
                host: host.to_string(),
                ping_reachable: up,
                mgmt_port_reachable: up,
                resolved_addrs: Vec::new(),
            }
        }
    }

    struct RecordingSender {
        sent: Arc<Mutex<HashSet<String>>>,
        count: AtomicUsize,
    }

    #[async_trait]
    impl WakeSender for RecordingSender {
        async fn send(&self, host: &HostIdentity) -> Result<(), EngineError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().unwrap().insert(host.name.clone());
            Ok(())
        }
    }

    fn orchestrator(
        up_now: &[&str],
        up_after_wake: &[&str],
    ) -> (WakeOrchestrator, Arc<RecordingSender>) {
        let woken = Arc::new(Mutex::new(HashSet::new()));
        let probe = Arc::new(ScriptedProbe {
            up_now: up_now.iter().map(|s| s.to_string()).collect(),
            up_after_wake: up_after_wake.iter().map(|s| s.to_string()).collect(),
            woken: woken.clone(),
        });
        let sender = Arc::new(RecordingSender {
            sent: woken,
            count: AtomicUsize::new(0),
        });
        let orchestrator = WakeOrchestrator::new(
            probe,
            sender.clone(),
            RecheckPolicy::single(Duration::from_millis(5)),
            2,
            false,
        );
        (orchestrator, sender)
    }

    fn ids(names: &[&str]) -> HostGroup {
        HostGroup::ephemeral(
            names
                .iter()
                .map(|n| HostIdentity {
                    name: n.to_string(),
                    mac: Some("aa:bb:cc:dd:ee:01".to_string()),
                    broadcast_hint: None,
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn already_up_host_gets_no_wake_frame() {
        let (orchestrator, sender) = orchestrator(&["pc02"], &[]);
        let status = orchestrator
            .wake_one(HostIdentity {
                name: "pc02".to_string(),
                mac: Some("aa:bb:cc:dd:ee:02".to_string()),
                broadcast_hint: None,
            })
            .await;
        assert_eq!(status, WakeStatus::AlreadyUp);
        assert_eq!(sender.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn batch_resolves_pending_hosts_after_recheck() {
        let (orchestrator, sender) = orchestrator(&["pc02"], &["pc01"]);
        let results = orchestrator.wake_batch(&ids(&["pc01", "pc02", "pc03"])).await;

        assert_eq!(
            results,
            vec![
                ("pc01".to_string(), WakeStatus::Success),
                ("pc02".to_string(), WakeStatus::AlreadyUp),
                ("pc03".to_string(), WakeStatus::Failed),
            ]
        );
        // frames for pc01 and pc03 only
        assert_eq!(sender.count.load(Ordering::SeqCst), 2);
    }

    struct FailingSender;

    #[async_trait]
    impl WakeSender for FailingSender {
        async fn send(&self, host: &HostIdentity) -> Result<(), EngineError> {
            host.mac
                .as_deref()
                .ok_or_else(|| EngineError::Configuration(format!("no mac for '{}'", host.name)))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_error_resolves_to_failed_without_recheck() {
        let probe = Arc::new(ScriptedProbe {
            up_now: HashSet::new(),
            up_after_wake: HashSet::new(),
            woken: Arc::new(Mutex::new(HashSet::new())),
        });
        let orchestrator = WakeOrchestrator::new(
            probe,
            Arc::new(FailingSender),
            RecheckPolicy::single(Duration::from_millis(5)),
            1,
            false,
        );
        let group = HostGroup::single(HostIdentity::named("pc09"));
        let results = orchestrator.wake_batch(&group).await;
        assert_eq!(results, vec![("pc09".to_string(), WakeStatus::Failed)]);
    }
}
