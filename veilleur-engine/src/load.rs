//! Per-host load sampling and optional inventory capture.
//!
//! Local targets are sampled in-process with sysinfo; remote targets run a
//! small CIM query through the executor and report one pipe-separated
//! line. Sampling failures surface as `None` samples, never as batch
//! aborts.

use crate::error::EngineError;
use crate::model::{HostGroup, InventorySnapshot, LoadSample};
use crate::pool::run_bounded;
use crate::remote::{self, Credential, RemoteExecutor};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tracing::warn;

const LOAD_SCRIPT: &str = r#"
$cpu = (Get-CimInstance Win32_Processor | Measure-Object -Property LoadPercentage -Average).Average
$os = Get-CimInstance Win32_OperatingSystem
$memPct = [math]::Round((($os.TotalVisibleMemorySize - $os.FreePhysicalMemory) / $os.TotalVisibleMemorySize) * 100, 1)
$uptime = [int]((Get-Date) - $os.LastBootUpTime).TotalSeconds
Write-Output "$cpu|$memPct|$uptime"
"#;

const INVENTORY_SCRIPT: &str = r#"
$os = Get-CimInstance Win32_OperatingSystem
$cs = Get-CimInstance Win32_ComputerSystem
Write-Output "$($os.Caption)|$($cs.Manufacturer)|$($cs.Model)"
"#;

fn parse_load(host: &str, line: &str) -> Option<LoadSample> {
    let mut cols = line.trim().splitn(3, '|');
    Some(LoadSample {
        host: host.to_string(),
        cpu_percent: cols.next()?.trim().parse().ok()?,
        memory_percent: cols.next()?.trim().parse().ok()?,
        uptime_seconds: cols.next()?.trim().parse().ok()?,
    })
}

fn parse_inventory(host: &str, line: &str) -> Option<InventorySnapshot> {
    let mut cols = line.trim().splitn(3, '|');
    Some(InventorySnapshot {
        host: host.to_string(),
        os_caption: cols.next()?.trim().to_string(),
        manufacturer: cols.next()?.trim().to_string(),
        model: cols.next()?.trim().to_string(),
    })
}

#[derive(Clone)]
pub struct LoadCollector {
    executor: Arc<dyn RemoteExecutor>,
    credential: Credential,
    timeout: Duration,
    parallelism: usize,
}

impl LoadCollector {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        credential: Credential,
        timeout: Duration,
        parallelism: usize,
    ) -> Self {
        Self {
            executor,
            credential,
            timeout,
            parallelism,
        }
    }

    fn sample_local(host: &str) -> LoadSample {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        let total = sys.total_memory().max(1);
        LoadSample {
            host: host.to_string(),
            cpu_percent: sys.global_cpu_info().cpu_usage(),
            memory_percent: (sys.used_memory() as f32 / total as f32) * 100.0,
            uptime_seconds: System::uptime(),
        }
    }

    pub async fn sample(&self, host: &str) -> Result<LoadSample, EngineError> {
        if remote::is_local_host(host) {
            return Ok(Self::sample_local(host));
        }
        let out = self.executor.run(host, &self.credential, LOAD_SCRIPT).await?;
        if !out.success() {
            return Err(EngineError::remote(
                host,
                format!("load query exited {}", out.exit_code),
            ));
        }
        parse_load(host, &out.stdout)
            .ok_or_else(|| EngineError::remote(host, "unparsable load output"))
    }

    pub async fn inventory(&self, host: &str) -> Result<InventorySnapshot, EngineError> {
        let out = if remote::is_local_host(host) {
            remote::run_local(INVENTORY_SCRIPT, self.timeout).await?
        } else {
            self.executor
                .run(host, &self.credential, INVENTORY_SCRIPT)
                .await?
        };
        if !out.success() {
            return Err(EngineError::remote(
                host,
                format!("inventory query exited {}", out.exit_code),
            ));
        }
        parse_inventory(host, &out.stdout)
            .ok_or_else(|| EngineError::remote(host, "unparsable inventory output"))
    }

    /// Sample every host of the group; hosts that cannot be sampled are
    /// logged and omitted.
    pub async fn sample_group(&self, group: &HostGroup) -> Vec<LoadSample> {
        let collector = self.clone();
        run_bounded(
            self.parallelism,
            group.hosts.iter().map(|h| h.name.clone()).collect(),
            move |host: String| {
                let collector = collector.clone();
                async move {
                    match collector.sample(&host).await {
                        Ok(sample) => Some(sample),
                        Err(e) => {
                            warn!("load sampling on {} failed: {}", host, e);
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

    /// Inventory for every host of the group, same omission rule.
    pub async fn inventory_group(&self, group: &HostGroup) -> Vec<InventorySnapshot> {
        let collector = self.clone();
        run_bounded(
            self.parallelism,
            group.hosts.iter().map(|h| h.name.clone()).collect(),
            move |host: String| {
                let collector = collector.clone();
                async move {
                    match collector.inventory(&host).await {
                        Ok(snapshot) => Some(snapshot),
                        Err(e) => {
                            warn!("inventory on {} failed: {}", host, e);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_line_parses() {
        let sample = parse_load("pc01", "12.5|63.2|86400\n").unwrap();
        assert_eq!(sample.cpu_percent, 12.5);
        assert_eq!(sample.memory_percent, 63.2);
        assert_eq!(sample.uptime_seconds, 86_400);
    }

    #[test]
    fn malformed_load_line_is_rejected() {
        assert!(parse_load("pc01", "12.5|not-a-number|3").is_none());
        assert!(parse_load("pc01", "12.5").is_none());
    }

    #[test]
    fn inventory_line_parses() {
        let inv =
            parse_inventory("pc01", "Microsoft Windows 11 Pro|Dell Inc.|OptiPlex 7010\n").unwrap();
        assert_eq!(inv.os_caption, "Microsoft Windows 11 Pro");
        assert_eq!(inv.manufacturer, "Dell Inc.");
        assert_eq!(inv.model, "OptiPlex 7010");
    }

    #[test]
    fn local_sampling_reports_something_plausible() {
        let sample = LoadCollector::sample_local("localhost");
        assert!(sample.memory_percent >= 0.0 && sample.memory_percent <= 100.0);
    }
}
