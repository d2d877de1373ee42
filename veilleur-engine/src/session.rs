//! Interactive session detection.
//!
//! Shutdown and (non-forced) update orchestration both gate on "is someone
//! logged in right now". The default inspector runs `quser` on the target
//! through the remote executor and scans the session table for an active
//! row.

use crate::error::EngineError;
use crate::remote::{Credential, RemoteExecutor};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait SessionInspector: Send + Sync {
    async fn has_active_session(&self, host: &str) -> Result<bool, EngineError>;
}

pub struct QuserSessionInspector {
    executor: Arc<dyn RemoteExecutor>,
    credential: Credential,
}

impl QuserSessionInspector {
    pub fn new(executor: Arc<dyn RemoteExecutor>, credential: Credential) -> Self {
        Self {
            executor,
            credential,
        }
    }
}

/// `quser` output: a header row, then one row per session. The STATE value
/// is read at the header's STATE column offset, since SESSIONNAME is blank
/// for disconnected rows and shifts whitespace-split columns. "No User
/// exists" comes back on exit code 1 and means nobody is logged in.
fn parse_quser(stdout: &str, exit_code: i32) -> bool {
    if exit_code != 0 {
        return false;
    }
    let mut lines = stdout.lines();
    let header = match lines.next() {
        Some(h) => h,
        None => return false,
    };
    let state_offset = match header.to_ascii_uppercase().find("STATE") {
        Some(offset) => offset,
        None => return false,
    };
    lines.any(|line| {
        line.get(state_offset..)
            .and_then(|rest| rest.split_whitespace().next())
            .map(|state| state.eq_ignore_ascii_case("Active"))
            .unwrap_or(false)
    })
}

#[async_trait]
impl SessionInspector for QuserSessionInspector {
    async fn has_active_session(&self, host: &str) -> Result<bool, EngineError> {
        let out = self.executor.run(host, &self.credential, "quser").await?;
        let active = parse_quser(&out.stdout, out.exit_code);
        debug!("session check {}: active={}", host, active);
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WITH_ACTIVE: &str = "\
 USERNAME              SESSIONNAME        ID  STATE   IDLE TIME  LOGON TIME
 mdupont               console             1  Active      none   25/08/2026 08:12";

    const DISCONNECTED_ONLY: &str = "\
 USERNAME              SESSIONNAME        ID  STATE   IDLE TIME  LOGON TIME
 mdupont                                   2  Disc        1:03   25/08/2026 07:01";

    /// A user literally named "active", disconnected. Only the STATE
    /// column decides.
    const ACTIVE_USERNAME_DISC: &str = "\
 USERNAME              SESSIONNAME        ID  STATE   IDLE TIME  LOGON TIME
 active                                    2  Disc        1:03   25/08/2026 07:01";

    #[test]
    fn active_row_is_detected() {
        assert!(parse_quser(WITH_ACTIVE, 0));
    }

    #[test]
    fn disconnected_sessions_do_not_count() {
        assert!(!parse_quser(DISCONNECTED_ONLY, 0));
    }

    #[test]
    fn username_named_active_is_not_a_session() {
        assert!(!parse_quser(ACTIVE_USERNAME_DISC, 0));
    }

    #[test]
    fn no_user_exists_means_no_session() {
        assert!(!parse_quser("No User exists for *\n", 1));
    }
}
