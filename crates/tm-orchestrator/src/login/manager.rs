//! Login session manager
//!
//! Runs `cloudflared tunnel login` with `TUNNEL_ORIGIN_CERT` pointed at a
//! per-account certificate path and tracks each attempt as a
//! [`LoginSession`]. Callers poll [`LoginSessionManager::status`]; nothing
//! is pushed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use tm_core::api::{LoginSnapshot, LoginStatus};
use tm_core::config::OrchestratorConfig;
use tm_core::LoginSessionId;

use super::session::{cert_present, LoginSession};
use crate::error::{OrchestratorError, Result};
use crate::patterns::{extract_login_url, is_flag_rejection};
use crate::process::{ExitInfo, ProcessEvent, ProcessSupervisor, SpawnSpec};

/// Startup flag some client versions do not accept
const NO_AUTOUPDATE_FLAG: &str = "--no-autoupdate";

/// Tracks interactive login attempts
pub struct LoginSessionManager {
    supervisor: Arc<ProcessSupervisor>,
    sessions: DashMap<LoginSessionId, Arc<LoginSession>>,
    cloudflared_bin: String,
    url_wait: Duration,
    ttl: Duration,
    output_limit: usize,
}

impl LoginSessionManager {
    pub fn new(supervisor: Arc<ProcessSupervisor>, config: &OrchestratorConfig) -> Self {
        Self {
            supervisor,
            sessions: DashMap::new(),
            cloudflared_bin: config.cloudflared_bin.clone(),
            url_wait: config.login_url_wait,
            ttl: config.login_session_ttl,
            output_limit: config.output_chunk_limit,
        }
    }

    /// Start a login and wait briefly for the login URL
    ///
    /// Returns the session snapshot once it has left `starting`, or after the
    /// URL wait elapses. A session that already failed is returned as an
    /// error; its state stays queryable through [`status`](Self::status).
    pub async fn start(
        &self,
        session_id: LoginSessionId,
        cert_path: impl Into<PathBuf>,
    ) -> Result<LoginSnapshot> {
        let cert_path = cert_path.into();
        self.evict_expired();

        if self.sessions.contains_key(&session_id) {
            return Err(OrchestratorError::validation(format!(
                "Login session {} already exists",
                session_id
            )));
        }

        let session = Arc::new(LoginSession::new(
            session_id.clone(),
            cert_path.clone(),
            self.output_limit,
        ));
        self.sessions.insert(session_id.clone(), Arc::clone(&session));

        if let Err(e) = ensure_cert_dir(&cert_path).await {
            session.fail(format!("Failed to prepare certificate directory: {}", e));
            return Err(e.into());
        }

        let handle = match self.supervisor.spawn(self.login_spec(&cert_path, true)) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Login session {} failed to start: {}", session_id, e);
                session.fail(e.to_string());
                return Err(e);
            }
        };
        session.set_pid(handle.pid);
        tracing::info!(
            "Login session {} started (pid {:?}, cert {:?})",
            session_id,
            handle.pid,
            cert_path
        );

        let driver = LoginDriver {
            supervisor: Arc::clone(&self.supervisor),
            session: Arc::clone(&session),
            spec: self.login_spec(&cert_path, false),
        };
        tokio::spawn(driver.run(handle.events));

        let snapshot = self.wait_until_started(&session).await;
        match snapshot.status {
            LoginStatus::Error => Err(OrchestratorError::Login(
                snapshot
                    .error
                    .unwrap_or_else(|| "cloudflared login failed.".to_string()),
            )),
            _ => Ok(snapshot),
        }
    }

    /// Current snapshot of a session
    pub fn status(&self, session_id: &LoginSessionId) -> Option<LoginSnapshot> {
        self.sessions.get(session_id).map(|s| s.snapshot())
    }

    /// Captured output of a session
    pub fn output(&self, session_id: &LoginSessionId) -> Option<Vec<String>> {
        self.sessions.get(session_id).map(|s| s.output())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop finished sessions whose process exited more than `ttl` ago
    pub fn evict_expired(&self) -> usize {
        let ttl = self.ttl;
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            let snap = session.snapshot();
            match snap.exited_at {
                Some(exited_at) if snap.status.is_terminal() => {
                    tm_core::time::elapsed_since(exited_at) < ttl
                }
                _ => true,
            }
        });
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            tracing::debug!("Evicted {} expired login session(s)", evicted);
        }
        evicted
    }

    fn login_spec(&self, cert_path: &Path, with_flag: bool) -> SpawnSpec {
        let mut spec = SpawnSpec::new(&self.cloudflared_bin)
            .args(["tunnel", "login"])
            .env("TUNNEL_ORIGIN_CERT", cert_path.to_string_lossy());
        if with_flag {
            spec = spec.arg(NO_AUTOUPDATE_FLAG);
        }
        spec
    }

    async fn wait_until_started(&self, session: &LoginSession) -> LoginSnapshot {
        let mut rx = session.subscribe();
        let waited = tokio::time::timeout(self.url_wait, async {
            loop {
                if rx.borrow_and_update().status != LoginStatus::Starting {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        if waited.is_err() {
            tracing::debug!(
                "Login session {} still starting after {:?}",
                session.id,
                self.url_wait
            );
        }
        session.snapshot()
    }
}

/// Sole writer of one session's state
struct LoginDriver {
    supervisor: Arc<ProcessSupervisor>,
    session: Arc<LoginSession>,
    /// Command used for the one retry without the startup flag
    spec: SpawnSpec,
}

impl LoginDriver {
    async fn run(self, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
        let mut retried = false;
        loop {
            let (exit, transcript) = self.follow(&mut events).await;

            if !retried
                && !exit.success()
                && !self.session.has_login_url()
                && is_flag_rejection(&transcript)
            {
                retried = true;
                tracing::warn!(
                    "Login session {}: client rejected {}, retrying without it",
                    self.session.id,
                    NO_AUTOUPDATE_FLAG
                );
                match self.supervisor.spawn(self.spec.clone()) {
                    Ok(handle) => {
                        self.session.set_pid(handle.pid);
                        events = handle.events;
                        continue;
                    }
                    Err(e) => {
                        tracing::error!("Login session {} retry failed: {}", self.session.id, e);
                        self.session.fail(e.to_string());
                        return;
                    }
                }
            }

            let cert_present = cert_present(&self.session.cert_path);
            self.session.finish(exit, cert_present);
            let snap = self.session.snapshot();
            match snap.status {
                LoginStatus::Error => tracing::error!(
                    "Login session {} failed: {}",
                    self.session.id,
                    snap.error.as_deref().unwrap_or("unknown error")
                ),
                status => tracing::info!("Login session {} finished as {:?}", self.session.id, status),
            }
            return;
        }
    }

    /// Consume one process's events until it exits
    async fn follow(
        &self,
        events: &mut mpsc::UnboundedReceiver<ProcessEvent>,
    ) -> (ExitInfo, String) {
        let mut transcript = String::new();
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Output(chunk) => {
                    if let Some(url) = extract_login_url(&chunk) {
                        if self.session.observe_url(url.clone()) {
                            tracing::info!("Login session {} awaiting auth at {}", self.session.id, url);
                        }
                    }
                    transcript.push_str(&chunk);
                    self.session.record_output(chunk);
                }
                ProcessEvent::Exited(exit) => return (exit, transcript),
            }
        }
        (
            ExitInfo {
                code: None,
                signal: None,
            },
            transcript,
        )
    }
}

async fn ensure_cert_dir(cert_path: &Path) -> std::io::Result<()> {
    let Some(dir) = cert_path.parent() else {
        return Ok(());
    };
    if tokio::fs::try_exists(dir).await? {
        return Ok(());
    }
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testutil::{fake_binary, test_config};

    fn manager(dir: &Path, script: &str) -> LoginSessionManager {
        let mut config = test_config(dir);
        config.cloudflared_bin = fake_binary(dir, "cloudflared", script);
        config.login_url_wait = Duration::from_secs(5);
        LoginSessionManager::new(Arc::new(ProcessSupervisor::new(100)), &config)
    }

    async fn wait_for_exit(manager: &LoginSessionManager, id: &LoginSessionId) -> LoginSnapshot {
        for _ in 0..200 {
            let snap = manager.status(id).unwrap();
            if snap.exited_at.is_some() {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("login session never exited");
    }

    #[tokio::test]
    async fn test_login_connects_when_cert_written() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            dir.path(),
            r#"echo "Please open the following URL and log in with your Cloudflare account:"
echo "https://dash.cloudflare.com/argotunnel?callback=abc"
sleep 0.3
echo cert > "$TUNNEL_ORIGIN_CERT"
exit 0"#,
        );
        let cert = dir.path().join("certs").join("acct_a").join("cert.pem");
        let id = LoginSessionId::new("login_a");

        let snap = manager.start(id.clone(), &cert).await.unwrap();
        assert_eq!(snap.status, LoginStatus::AwaitingAuth);
        assert_eq!(
            snap.login_url.as_deref(),
            Some("https://dash.cloudflare.com/argotunnel?callback=abc")
        );

        let done = wait_for_exit(&manager, &id).await;
        assert_eq!(done.status, LoginStatus::Connected);
        assert!(cert_present(&cert));

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(cert.parent().unwrap()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_immediate_failure_goes_to_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), "echo 'failed to reach cloudflare' 1>&2\nexit 1");
        let id = LoginSessionId::new("login_b");

        let err = manager
            .start(id.clone(), dir.path().join("c/cert.pem"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Login(_)));

        let snap = manager.status(&id).unwrap();
        assert_eq!(snap.status, LoginStatus::Error);
        assert!(snap.error.is_some());
        assert_eq!(snap.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_flag_rejection_retries_once_without_flag() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            dir.path(),
            r#"for arg in "$@"; do
  if [ "$arg" = "--no-autoupdate" ]; then
    echo "Incorrect Usage: flag provided but not defined: -no-autoupdate" 1>&2
    exit 3
  fi
done
echo "https://dash.cloudflare.com/argotunnel?retry=1"
sleep 5"#,
        );
        let id = LoginSessionId::new("login_c");

        let snap = manager
            .start(id.clone(), dir.path().join("c/cert.pem"))
            .await
            .unwrap();
        assert_eq!(snap.status, LoginStatus::AwaitingAuth);
        assert_eq!(snap.session_id, id);
        assert!(snap.login_url.unwrap().ends_with("retry=1"));

        let output = manager.output(&id).unwrap().concat();
        assert!(output.contains("flag provided but not defined"));
        manager.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_flag_rejection_retried_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("runs");
        let script = format!(
            "echo run >> {}\necho 'unknown flag: --no-autoupdate' 1>&2\nexit 3",
            counter.display()
        );
        let manager = manager(dir.path(), &script);
        let id = LoginSessionId::new("login_d");

        assert!(manager
            .start(id.clone(), dir.path().join("c/cert.pem"))
            .await
            .is_err());
        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 2);
        assert_eq!(manager.status(&id).unwrap().status, LoginStatus::Error);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.cloudflared_bin = dir.path().join("missing").to_string_lossy().into_owned();
        let manager = LoginSessionManager::new(Arc::new(ProcessSupervisor::new(10)), &config);
        let id = LoginSessionId::new("login_e");

        let err = manager
            .start(id.clone(), dir.path().join("c/cert.pem"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Spawn { .. }));
        assert_eq!(manager.status(&id).unwrap().status, LoginStatus::Error);
    }

    #[tokio::test]
    async fn test_finished_sessions_evicted_after_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.cloudflared_bin = fake_binary(dir.path(), "cloudflared", "exit 1");
        config.login_session_ttl = Duration::ZERO;
        let manager = LoginSessionManager::new(Arc::new(ProcessSupervisor::new(10)), &config);

        let first = LoginSessionId::new("login_f");
        let _ = manager.start(first.clone(), dir.path().join("c/cert.pem")).await;
        wait_for_exit(&manager, &first).await;

        let second = LoginSessionId::new("login_g");
        let _ = manager.start(second.clone(), dir.path().join("c/cert.pem")).await;
        assert!(manager.status(&first).is_none());
        assert!(manager.status(&second).is_some());
    }
}
