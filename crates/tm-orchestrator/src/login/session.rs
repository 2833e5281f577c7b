//! A single login attempt

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::watch;

use tm_core::api::{LoginSnapshot, LoginStatus};
use tm_core::LoginSessionId;

use crate::process::{ExitInfo, OutputBuffer};

/// State of one login attempt
///
/// Only the session's driver task writes to it; any number of pollers read
/// snapshots concurrently.
pub struct LoginSession {
    pub id: LoginSessionId,
    pub cert_path: PathBuf,
    state: watch::Sender<LoginSnapshot>,
    output: Mutex<OutputBuffer>,
}

impl LoginSession {
    pub(crate) fn new(id: LoginSessionId, cert_path: PathBuf, output_limit: usize) -> Self {
        let (state, _) = watch::channel(LoginSnapshot {
            session_id: id.clone(),
            status: LoginStatus::Starting,
            login_url: None,
            pid: None,
            started_at: Utc::now(),
            connected_at: None,
            exited_at: None,
            exit_code: None,
            signal: None,
            error: None,
        });
        Self {
            id,
            cert_path,
            state,
            output: Mutex::new(OutputBuffer::new(output_limit)),
        }
    }

    pub fn snapshot(&self) -> LoginSnapshot {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> LoginStatus {
        self.state.borrow().status
    }

    /// Captured login output, oldest first
    pub fn output(&self) -> Vec<String> {
        self.output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .chunks()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LoginSnapshot> {
        self.state.subscribe()
    }

    pub(crate) fn record_output(&self, chunk: String) {
        self.output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(chunk);
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        self.state.send_modify(|s| s.pid = pid);
    }

    /// Move to `awaiting_auth` on the first login URL; later URLs are ignored
    pub(crate) fn observe_url(&self, url: String) -> bool {
        self.state.send_if_modified(|s| {
            if s.login_url.is_some() || s.status.is_terminal() {
                return false;
            }
            s.login_url = Some(url);
            s.status = LoginStatus::AwaitingAuth;
            true
        })
    }

    pub(crate) fn has_login_url(&self) -> bool {
        self.state.borrow().login_url.is_some()
    }

    /// Record a failure before any process ran
    pub(crate) fn fail(&self, message: String) {
        self.state.send_modify(|s| {
            if s.status != LoginStatus::Connected {
                s.status = LoginStatus::Error;
                s.error = Some(message);
            }
        });
    }

    /// Resolve the final state from the process exit and the certificate on disk
    pub(crate) fn finish(&self, exit: ExitInfo, cert_present: bool) {
        self.state.send_modify(|s| {
            let now = Utc::now();
            s.exited_at = Some(now);
            s.exit_code = exit.code;
            s.signal = exit.signal;

            if s.status == LoginStatus::Connected {
                return;
            }
            if exit.success() && cert_present {
                s.status = LoginStatus::Connected;
                s.connected_at = Some(now);
                s.error = None;
            } else if exit.success() && s.login_url.is_some() {
                s.status = LoginStatus::AwaitingAuth;
            } else {
                s.status = LoginStatus::Error;
                if s.error.is_none() {
                    s.error = Some(if s.login_url.is_some() {
                        format!(
                            "cloudflared login exited with code {}.",
                            exit.code
                                .map(|c| c.to_string())
                                .unwrap_or_else(|| "unknown".to_string())
                        )
                    } else {
                        "cloudflared login exited before a login URL was detected.".to_string()
                    });
                }
            }
        });
    }
}

/// Whether certificate material exists at `path`
pub fn cert_present(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> LoginSession {
        LoginSession::new(LoginSessionId::new("login_a"), PathBuf::from("/tmp/none.pem"), 10)
    }

    fn exit(code: i32) -> ExitInfo {
        ExitInfo {
            code: Some(code),
            signal: None,
        }
    }

    #[test]
    fn test_first_url_moves_to_awaiting_auth() {
        let session = session();
        assert!(session.observe_url("https://dash.cloudflare.com/a".to_string()));
        assert!(!session.observe_url("https://dash.cloudflare.com/b".to_string()));
        let snap = session.snapshot();
        assert_eq!(snap.status, LoginStatus::AwaitingAuth);
        assert_eq!(snap.login_url.as_deref(), Some("https://dash.cloudflare.com/a"));
    }

    #[test]
    fn test_success_with_cert_connects() {
        let session = session();
        session.observe_url("https://dash.cloudflare.com/a".to_string());
        session.finish(exit(0), true);
        let snap = session.snapshot();
        assert_eq!(snap.status, LoginStatus::Connected);
        assert!(snap.connected_at.is_some());
        assert_eq!(snap.exit_code, Some(0));
    }

    #[test]
    fn test_success_without_cert_keeps_awaiting() {
        let session = session();
        session.observe_url("https://dash.cloudflare.com/a".to_string());
        session.finish(exit(0), false);
        assert_eq!(session.status(), LoginStatus::AwaitingAuth);
    }

    #[test]
    fn test_failure_messages() {
        let with_url = session();
        with_url.observe_url("https://dash.cloudflare.com/a".to_string());
        with_url.finish(exit(2), false);
        assert_eq!(
            with_url.snapshot().error.as_deref(),
            Some("cloudflared login exited with code 2.")
        );

        let without_url = session();
        without_url.finish(exit(1), false);
        let snap = without_url.snapshot();
        assert_eq!(snap.status, LoginStatus::Error);
        assert_eq!(
            snap.error.as_deref(),
            Some("cloudflared login exited before a login URL was detected.")
        );
    }

    #[test]
    fn test_connected_never_reverts() {
        let session = session();
        session.finish(exit(0), true);
        session.fail("late failure".to_string());
        session.finish(exit(1), false);
        assert!(!session.observe_url("https://x.example".to_string()));
        let snap = session.snapshot();
        assert_eq!(snap.status, LoginStatus::Connected);
        assert!(snap.error.is_none());
    }
}
