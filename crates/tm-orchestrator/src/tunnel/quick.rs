//! Quick tunnel client processes
//!
//! One `cloudflared tunnel --url <target>` process per logical tunnel. The
//! assigned hostname is only ever printed to the process output, so start
//! blocks until it shows up, the process dies, or the ready timeout passes.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tm_core::config::OrchestratorConfig;
use tm_core::TunnelId;

use crate::error::{OrchestratorError, Result};
use crate::patterns::HostnameMatcher;
use crate::process::{ProcessEvent, ProcessId, ProcessSupervisor, SpawnSpec};

/// A quick tunnel that reported its public hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickTunnel {
    pub hostname: String,
    pub pid: Option<u32>,
    pub process_id: ProcessId,
}

/// Runs and tears down quick tunnel client processes
pub struct TunnelClientManager {
    supervisor: Arc<ProcessSupervisor>,
    tunnels: Arc<DashMap<TunnelId, ProcessId>>,
    cloudflared_bin: String,
    matcher: HostnameMatcher,
    ready_timeout: Duration,
}

impl TunnelClientManager {
    pub fn new(supervisor: Arc<ProcessSupervisor>, config: &OrchestratorConfig) -> Self {
        Self {
            supervisor,
            tunnels: Arc::new(DashMap::new()),
            cloudflared_bin: config.cloudflared_bin.clone(),
            matcher: HostnameMatcher::new(&config.quick_tunnel_domain),
            ready_timeout: config.quick_tunnel_ready_timeout,
        }
    }

    /// Start a quick tunnel for `target_url` and wait for its hostname
    pub async fn start(&self, tunnel_id: &TunnelId, target_url: &str) -> Result<QuickTunnel> {
        let spec = SpawnSpec::new(&self.cloudflared_bin)
            .args(["tunnel", "--url", target_url, "--no-autoupdate"]);
        let mut handle = self.supervisor.spawn(spec)?;
        let process_id = handle.id;
        self.tunnels.insert(tunnel_id.clone(), process_id);
        let mut pending = PendingStart {
            manager: self,
            tunnel_id,
            process_id,
            armed: true,
        };

        tracing::info!(
            "Starting quick tunnel {} -> {} (process {})",
            tunnel_id,
            target_url,
            process_id
        );

        let deadline = tokio::time::sleep(self.ready_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                event = handle.events.recv() => match event {
                    Some(ProcessEvent::Output(chunk)) => {
                        let Some(hostname) = self.matcher.extract(&chunk) else {
                            continue;
                        };
                        tracing::info!("Quick tunnel {} assigned {}", tunnel_id, hostname);
                        pending.armed = false;
                        self.forget_on_exit(tunnel_id.clone(), process_id, handle.events);
                        return Ok(QuickTunnel {
                            hostname,
                            pid: handle.pid,
                            process_id,
                        });
                    }
                    Some(ProcessEvent::Exited(info)) => {
                        tracing::warn!(
                            "Quick tunnel {} exited before a hostname was assigned",
                            tunnel_id
                        );
                        return Err(OrchestratorError::ProcessExitedBeforeReady {
                            code: info.code,
                            signal: info.signal,
                        });
                    }
                    None => {
                        return Err(OrchestratorError::ProcessExitedBeforeReady {
                            code: None,
                            signal: None,
                        });
                    }
                },
                _ = &mut deadline => {
                    tracing::warn!(
                        "Quick tunnel {} reported no hostname within {:?}, killing it",
                        tunnel_id,
                        self.ready_timeout
                    );
                    return Err(OrchestratorError::ReadyTimeout(self.ready_timeout));
                }
            }
        }
    }

    /// Kill a tunnel's client process
    ///
    /// Returns `false` when the tunnel has no tracked process, including when
    /// it already exited on its own.
    pub fn stop(&self, tunnel_id: &TunnelId) -> bool {
        match self.tunnels.remove(tunnel_id) {
            Some((_, process_id)) => {
                tracing::info!("Stopping quick tunnel {} (process {})", tunnel_id, process_id);
                self.supervisor.kill(process_id);
                true
            }
            None => false,
        }
    }

    /// Supervisor id of a running tunnel's process
    pub fn process_id(&self, tunnel_id: &TunnelId) -> Option<ProcessId> {
        self.tunnels.get(tunnel_id).map(|r| *r)
    }

    pub fn is_running(&self, tunnel_id: &TunnelId) -> bool {
        self.tunnels.contains_key(tunnel_id)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Drop the tunnel mapping once its process ends on its own
    fn forget_on_exit(
        &self,
        tunnel_id: TunnelId,
        process_id: ProcessId,
        mut events: tokio::sync::mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        let tunnels = Arc::clone(&self.tunnels);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ProcessEvent::Exited(info) = event {
                    tracing::info!(
                        "Quick tunnel {} process exited (code {:?}, signal {:?})",
                        tunnel_id,
                        info.code,
                        info.signal
                    );
                    break;
                }
            }
            tunnels.remove_if(&tunnel_id, |_, id| *id == process_id);
        });
    }
}

/// Kills a starting tunnel's process unless it reached a hostname
///
/// Also covers the start future being dropped while it waits.
struct PendingStart<'a> {
    manager: &'a TunnelClientManager,
    tunnel_id: &'a TunnelId,
    process_id: ProcessId,
    armed: bool,
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.supervisor.kill(self.process_id);
            self.manager
                .tunnels
                .remove_if(self.tunnel_id, |_, id| *id == self.process_id);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testutil::{fake_binary, test_config};

    fn manager(dir: &std::path::Path, script: &str) -> (TunnelClientManager, Arc<ProcessSupervisor>) {
        let mut config = test_config(dir);
        config.cloudflared_bin = fake_binary(dir, "cloudflared", script);
        config.quick_tunnel_ready_timeout = Duration::from_secs(5);
        let supervisor = Arc::new(ProcessSupervisor::new(100));
        (TunnelClientManager::new(Arc::clone(&supervisor), &config), supervisor)
    }

    #[tokio::test]
    async fn test_start_resolves_hostname_from_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, supervisor) = manager(
            dir.path(),
            r#"echo "INF Requesting new quick Tunnel on trycloudflare.com..."
echo "INF |  https://brave-lion-tree.trycloudflare.com  |" 1>&2
sleep 30"#,
        );

        let id = TunnelId::new("tnl_a");
        let tunnel = manager.start(&id, "http://localhost:8080").await.unwrap();
        assert_eq!(tunnel.hostname, "brave-lion-tree.trycloudflare.com");
        assert!(tunnel.pid.is_some());
        assert!(manager.is_running(&id));

        let process = supervisor.get(tunnel.process_id).unwrap();
        assert_eq!(
            process.args,
            vec!["tunnel", "--url", "http://localhost:8080", "--no-autoupdate"]
        );

        assert!(manager.stop(&id));
        process.wait().await;
        assert!(!manager.stop(&id));
    }

    #[tokio::test]
    async fn test_exit_before_hostname_reports_code() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path(), "echo 'ERR failed to dial'\nexit 7");

        let err = manager
            .start(&TunnelId::new("tnl_b"), "http://localhost:8080")
            .await
            .unwrap_err();
        match err {
            OrchestratorError::ProcessExitedBeforeReady { code, .. } => assert_eq!(code, Some(7)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_ready_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.cloudflared_bin = fake_binary(dir.path(), "cloudflared", "echo starting\nsleep 30");
        config.quick_tunnel_ready_timeout = Duration::from_millis(300);
        let supervisor = Arc::new(ProcessSupervisor::new(100));
        let manager = TunnelClientManager::new(Arc::clone(&supervisor), &config);

        let err = manager
            .start(&TunnelId::new("tnl_c"), "http://localhost:8080")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ReadyTimeout(_)));
        assert!(manager.is_empty());

        for process in supervisor.list() {
            if let Some(p) = supervisor.get(process.id) {
                p.wait().await;
            }
        }
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_start_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, supervisor) = manager(dir.path(), "echo starting\nsleep 30");

        let id = TunnelId::new("tnl_e");
        let started =
            tokio::time::timeout(Duration::from_millis(300), manager.start(&id, "http://localhost:8080")).await;
        assert!(started.is_err());
        assert!(!manager.is_running(&id));

        for process in supervisor.list() {
            if let Some(p) = supervisor.get(process.id) {
                p.wait().await;
            }
        }
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_tunnel_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path(), "exit 0");
        assert!(!manager.stop(&TunnelId::new("tnl_missing")));
    }

    #[tokio::test]
    async fn test_mapping_dropped_after_natural_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, supervisor) = manager(
            dir.path(),
            "echo 'https://quiet-owl.trycloudflare.com'\nsleep 0.2\nexit 0",
        );

        let id = TunnelId::new("tnl_d");
        let tunnel = manager.start(&id, "http://localhost:9000").await.unwrap();
        if let Some(process) = supervisor.get(tunnel.process_id) {
            process.wait().await;
        }
        for _ in 0..50 {
            if !manager.is_running(&id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!manager.stop(&id));
    }
}
