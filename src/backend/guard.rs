//! Scoped ownership of a spawned stdio backend's process and MCP session.
//!
//! `StdioGuard` is the single place that knows how to tear one of these down.
//! Every exit path of `connect()` and every call to `disconnect()` goes
//! through `teardown()` rather than dropping the pieces ad hoc.

use rmcp::RoleClient;
use rmcp::service::RunningService;
use std::time::Duration;
use tokio::process::Child;

const GRACE_PERIOD: Duration = Duration::from_millis(500);

pub struct StdioGuard {
    child: Child,
    session: RunningService<RoleClient, ()>,
}

impl StdioGuard {
    pub fn new(child: Child, session: RunningService<RoleClient, ()>) -> Self {
        Self { child, session }
    }

    pub fn session(&self) -> &RunningService<RoleClient, ()> {
        &self.session
    }

    /// Cancel the MCP session, then terminate the child's process group,
    /// falling back to a direct kill if it doesn't exit within the grace
    /// period.
    pub async fn teardown(self) {
        let Self {
            mut child,
            session,
        } = self;

        if let Err(e) = session.cancel().await {
            tracing::warn!(error = %e, "error cancelling stdio session");
        }

        let Some(pid) = child.id() else {
            return;
        };

        terminate_process_group(pid as i32);

        let exited = tokio::time::timeout(GRACE_PERIOD, child.wait()).await;
        if exited.is_err() {
            tracing::warn!(pid, "child did not exit after SIGTERM, killing");
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

#[cfg(unix)]
fn terminate_process_group(pid: i32) {
    unsafe {
        libc::kill(-pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_process_group(_pid: i32) {}
