//! Update orchestration.
//!
//! Two interchangeable provider strategies behind one trait: the native
//! platform update session/searcher, and the extended PSWindowsUpdate
//! module with richer control. Both dispatch in-process when the target is
//! the orchestrating machine and through the remote executor otherwise,
//! and both emit the same `UpdateEntry` shape, so the aggregator never
//! cares where the work ran.
//!
//! Apply and verify are independent passes: apply records what this run
//! installed, verify queries update history inside a lookback window and
//! may surface updates installed outside this tool's control.

use crate::error::EngineError;
use crate::model::{HostGroup, UpdateEntry, UpdateStatus};
use crate::pool::run_bounded;
use crate::remote::{self, Credential, ExecOutput, RemoteExecutor};
use crate::session::SessionInspector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait UpdateProvider: Send + Sync {
    fn name(&self) -> &'static str;
    /// Search, download and install pending updates on one host.
    async fn apply(&self, host: &str) -> Result<Vec<UpdateEntry>, EngineError>;
    /// Update history entries dated within the last `window_days` days.
    async fn query_history(&self, host: &str, window_days: u32)
        -> Result<Vec<UpdateEntry>, EngineError>;
}

/// Providers emit one `title|result[|iso-date]` line per update; anything
/// else on stdout is ignored.
fn parse_update_lines(host: &str, out: &ExecOutput) -> Result<Vec<UpdateEntry>, EngineError> {
    if !out.success() {
        return Err(EngineError::remote(
            host,
            format!("update command exited {}: {}", out.exit_code, out.stderr.trim()),
        ));
    }
    let entries = out
        .stdout
        .lines()
        .filter_map(|line| {
            let mut cols = line.trim().splitn(3, '|');
            let title = cols.next()?.trim();
            let result = cols.next()?.trim();
            if title.is_empty() {
                return None;
            }
            let status = match result.to_ascii_lowercase().as_str() {
                "installed" | "succeeded" => UpdateStatus::Installed,
                "failed" | "error" => UpdateStatus::Failed,
                _ => UpdateStatus::Skipped,
            };
            let mut entry = UpdateEntry::new(host, title, status);
            if let Some(stamp) = cols.next() {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(stamp.trim()) {
                    entry.timestamp = parsed.with_timezone(&Utc);
                }
            }
            Some(entry)
        })
        .collect();
    Ok(entries)
}

/// Local or remote execution of a provider script, decided by the target.
async fn dispatch(
    executor: &Arc<dyn RemoteExecutor>,
    host: &str,
    credential: &Credential,
    script: &str,
    timeout: Duration,
) -> Result<ExecOutput, EngineError> {
    if remote::is_local_host(host) {
        remote::run_local(script, timeout).await
    } else {
        executor.run(host, credential, script).await
    }
}

/// Built-in update facility: COM update session, searcher, downloader,
/// installer.
pub struct NativeUpdateProvider {
    executor: Arc<dyn RemoteExecutor>,
    credential: Credential,
    timeout: Duration,
}

impl NativeUpdateProvider {
    pub fn new(executor: Arc<dyn RemoteExecutor>, credential: Credential, timeout: Duration) -> Self {
        Self {
            executor,
            credential,
            timeout,
        }
    }
}

const NATIVE_APPLY: &str = r#"
$session = New-Object -ComObject Microsoft.Update.Session
$searcher = $session.CreateUpdateSearcher()
$pending = $searcher.Search("IsInstalled=0 and Type='Software'").Updates
if ($pending.Count -eq 0) { exit 0 }
$downloader = $session.CreateUpdateDownloader(); $downloader.Updates = $pending; $null = $downloader.Download()
$installer = $session.CreateUpdateInstaller(); $installer.Updates = $pending
$result = $installer.Install()
for ($i = 0; $i -lt $pending.Count; $i++) {
  $verdict = if ($result.GetUpdateResult($i).ResultCode -eq 2) { 'Installed' } else { 'Failed' }
  Write-Output "$($pending.Item($i).Title)|$verdict"
}
"#;

fn native_history_script(window_days: u32) -> String {
    format!(
        r#"
$searcher = (New-Object -ComObject Microsoft.Update.Session).CreateUpdateSearcher()
$cutoff = (Get-Date).AddDays(-{window_days})
$total = $searcher.GetTotalHistoryCount()
if ($total -gt 0) {{
  $searcher.QueryHistory(0, $total) | Where-Object {{ $_.Date -ge $cutoff }} | ForEach-Object {{
    $verdict = if ($_.ResultCode -eq 2) {{ 'Installed' }} else {{ 'Failed' }}
    Write-Output "$($_.Title)|$verdict|$($_.Date.ToString('o'))"
  }}
}}
"#
    )
}

#[async_trait]
impl UpdateProvider for NativeUpdateProvider {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn apply(&self, host: &str) -> Result<Vec<UpdateEntry>, EngineError> {
        let out = dispatch(&self.executor, host, &self.credential, NATIVE_APPLY, self.timeout).await?;
        parse_update_lines(host, &out)
    }

    async fn query_history(
        &self,
        host: &str,
        window_days: u32,
    ) -> Result<Vec<UpdateEntry>, EngineError> {
        let script = native_history_script(window_days);
        let out = dispatch(&self.executor, host, &self.credential, &script, self.timeout).await?;
        parse_update_lines(host, &out)
    }
}

/// PSWindowsUpdate-backed provider. Its own apply/verify cmdlets run
/// through the same executor as everything else.
pub struct ExtendedUpdateProvider {
    executor: Arc<dyn RemoteExecutor>,
    credential: Credential,
    timeout: Duration,
}

impl ExtendedUpdateProvider {
    pub fn new(executor: Arc<dyn RemoteExecutor>, credential: Credential, timeout: Duration) -> Self {
        Self {
            executor,
            credential,
            timeout,
        }
    }
}

const EXTENDED_APPLY: &str = r#"
Import-Module PSWindowsUpdate
Install-WindowsUpdate -AcceptAll -IgnoreReboot | ForEach-Object {
  Write-Output "$($_.Title)|$($_.Result)"
}
"#;

fn extended_history_script(window_days: u32) -> String {
    format!(
        r#"
Import-Module PSWindowsUpdate
$cutoff = (Get-Date).AddDays(-{window_days})
Get-WUHistory | Where-Object {{ $_.Date -ge $cutoff }} | ForEach-Object {{
  Write-Output "$($_.Title)|$($_.Result)|$($_.Date.ToString('o'))"
}}
"#
    )
}

#[async_trait]
impl UpdateProvider for ExtendedUpdateProvider {
    fn name(&self) -> &'static str {
        "extended"
    }

    async fn apply(&self, host: &str) -> Result<Vec<UpdateEntry>, EngineError> {
        let out =
            dispatch(&self.executor, host, &self.credential, EXTENDED_APPLY, self.timeout).await?;
        parse_update_lines(host, &out)
    }

    async fn query_history(
        &self,
        host: &str,
        window_days: u32,
    ) -> Result<Vec<UpdateEntry>, EngineError> {
        let script = extended_history_script(window_days);
        let out = dispatch(&self.executor, host, &self.credential, &script, self.timeout).await?;
        parse_update_lines(host, &out)
    }
}

pub struct UpdateOrchestrator {
    sessions: Arc<dyn SessionInspector>,
    parallelism: usize,
}

impl UpdateOrchestrator {
    pub fn new(sessions: Arc<dyn SessionInspector>, parallelism: usize) -> Self {
        Self {
            sessions,
            parallelism,
        }
    }

    /// Apply updates to every host of the group. Without `force`, a host
    /// with an active interactive session is skipped entirely (nothing is
    /// recorded for it); with `force`, the session inspector is never
    /// consulted. A failing host yields one Failed "Error" entry and the
    /// batch continues.
    pub async fn apply(
        &self,
        group: &HostGroup,
        provider: Arc<dyn UpdateProvider>,
        force: bool,
    ) -> Vec<UpdateEntry> {
        let sessions = self.sessions.clone();
        let per_host = run_bounded(
            self.parallelism,
            group.hosts.iter().map(|h| h.name.clone()).collect(),
            move |host: String| {
                let sessions = sessions.clone();
                let provider = provider.clone();
                async move {
                    if !force {
                        // Errors count as occupied: never interrupt a user
                        // we could not see.
                        let occupied = sessions.has_active_session(&host).await.unwrap_or(true);
                        if occupied {
                            warn!("{} has an active session, skipping updates", host);
                            return Vec::new();
                        }
                    }
                    match provider.apply(&host).await {
                        Ok(entries) => {
                            info!("{}: {} update entr(ies) applied", host, entries.len());
                            entries
                        }
                        Err(e) => {
                            warn!("update apply on {} failed: {}", host, e);
                            vec![UpdateEntry::error(&host)]
                        }
                    }
                }
            },
        )
        .await;
        per_host.into_iter().flatten().collect()
    }

    /// History pass: independent of apply, read-only, no session gate.
    pub async fn verify(
        &self,
        group: &HostGroup,
        provider: Arc<dyn UpdateProvider>,
        window_days: u32,
    ) -> Vec<UpdateEntry> {
        let per_host = run_bounded(
            self.parallelism,
            group.hosts.iter().map(|h| h.name.clone()).collect(),
            move |host: String| {
                let provider = provider.clone();
                async move {
                    match provider.query_history(&host, window_days).await {
                        Ok(entries) => entries,
                        Err(e) => {
                            warn!("update verification on {} failed: {}", host, e);
                            vec![UpdateEntry::error(&host)]
                        }
                    }
                }
            },
        )
        .await;
        per_host.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HostIdentity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn exec_out(stdout: &str, exit_code: i32) -> ExecOutput {
        ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code,
            execution_time_ms: 1,
        }
    }

    #[test]
    fn update_lines_parse_into_entries() {
        let out = exec_out(
            "KB5031354 Cumulative Update|Installed\n\
             Defender Definitions|Failed\n\
             Optional Driver|NotStarted\n\
             noise without separator\n",
            0,
        );
        let entries = parse_update_lines("pc01", &out).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].status, UpdateStatus::Installed);
        assert_eq!(entries[1].status, UpdateStatus::Failed);
        assert_eq!(entries[2].status, UpdateStatus::Skipped);
        assert!(entries.iter().all(|e| e.host == "pc01"));
    }

    #[test]
    fn history_timestamp_column_is_honored() {
        let out = exec_out("KB5031354|Installed|2026-08-20T10:30:00+00:00\n", 0);
        let entries = parse_update_lines("pc01", &out).unwrap();
        assert_eq!(entries[0].timestamp.to_rfc3339(), "2026-08-20T10:30:00+00:00");
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let out = exec_out("", 1);
        assert!(parse_update_lines("pc01", &out).is_err());
    }

    struct CountingSessions {
        calls: AtomicUsize,
        active: bool,
    }

    #[async_trait]
    impl SessionInspector for CountingSessions {
        async fn has_active_session(&self, _host: &str) -> Result<bool, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.active)
        }
    }

    struct StubProvider {
        fail_hosts: Vec<String>,
    }

    #[async_trait]
    impl UpdateProvider for StubProvider {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn apply(&self, host: &str) -> Result<Vec<UpdateEntry>, EngineError> {
            if self.fail_hosts.iter().any(|h| h == host) {
                return Err(EngineError::remote(host, "boom"));
            }
            Ok(vec![UpdateEntry::new(host, "KB0001", UpdateStatus::Installed)])
        }

        async fn query_history(
            &self,
            host: &str,
            _window_days: u32,
        ) -> Result<Vec<UpdateEntry>, EngineError> {
            Ok(vec![UpdateEntry::new(host, "KB0000", UpdateStatus::Installed)])
        }
    }

    fn group(names: &[&str]) -> HostGroup {
        HostGroup::ephemeral(names.iter().map(|n| HostIdentity::named(*n)).collect())
    }

    #[tokio::test]
    async fn force_never_consults_the_session_inspector() {
        let sessions = Arc::new(CountingSessions {
            calls: AtomicUsize::new(0),
            active: true,
        });
        let orchestrator = UpdateOrchestrator::new(sessions.clone(), 2);
        let entries = orchestrator
            .apply(&group(&["a", "b", "c"]), Arc::new(StubProvider { fail_hosts: vec![] }), true)
            .await;

        assert_eq!(sessions.calls.load(Ordering::SeqCst), 0);
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn without_force_every_host_is_checked_and_occupied_hosts_record_nothing() {
        let sessions = Arc::new(CountingSessions {
            calls: AtomicUsize::new(0),
            active: true,
        });
        let orchestrator = UpdateOrchestrator::new(sessions.clone(), 2);
        let entries = orchestrator
            .apply(&group(&["a", "b", "c"]), Arc::new(StubProvider { fail_hosts: vec![] }), false)
            .await;

        assert_eq!(sessions.calls.load(Ordering::SeqCst), 3);
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn provider_failure_records_one_error_entry_and_continues() {
        let sessions = Arc::new(CountingSessions {
            calls: AtomicUsize::new(0),
            active: false,
        });
        let orchestrator = UpdateOrchestrator::new(sessions, 1);
        let entries = orchestrator
            .apply(
                &group(&["a", "b"]),
                Arc::new(StubProvider {
                    fail_hosts: vec!["a".to_string()],
                }),
                false,
            )
            .await;

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].host, "a");
        assert_eq!(entries[0].title, "Error");
        assert_eq!(entries[0].status, UpdateStatus::Failed);
        assert_eq!(entries[1].host, "b");
        assert_eq!(entries[1].status, UpdateStatus::Installed);
    }

    #[tokio::test]
    async fn verify_is_independent_of_apply() {
        let sessions = Arc::new(CountingSessions {
            calls: AtomicUsize::new(0),
            active: true,
        });
        let orchestrator = UpdateOrchestrator::new(sessions.clone(), 1);
        let entries = orchestrator
            .verify(&group(&["a"]), Arc::new(StubProvider { fail_hosts: vec![] }), 7)
            .await;

        // read-only pass: no session gate, history comes back even though
        // the host is occupied
        assert_eq!(sessions.calls.load(Ordering::SeqCst), 0);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "KB0000");
    }
}
