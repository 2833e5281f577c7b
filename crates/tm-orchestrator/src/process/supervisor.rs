//! Supervised child processes
//!
//! A spawn produces one OS process with both output streams captured. Each
//! process gets its own reader tasks and one waiter task; the only state
//! shared between processes is the lookup table keyed by [`ProcessId`].
//!
//! Children are started in their own session so they do not share the
//! orchestrator's process group and never block its shutdown. They are
//! still killed explicitly through [`ProcessSupervisor::kill`].

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::output::OutputBuffer;
use crate::error::{OrchestratorError, Result};

/// Supervisor-assigned process identifier, never reused
pub type ProcessId = u64;

/// Time given to a process group to exit after SIGTERM before SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Bytes requested per read from a child's output pipe
const READ_CHUNK: usize = 8192;

/// Longest run without a newline kept before it is emitted as its own chunk
const MAX_LINE: usize = 64 * 1024;

/// Time the waiter gives reader tasks to flush trailing output
const READER_DRAIN: Duration = Duration::from_millis(500);

/// What to run
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Command line for logs and error messages
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Event delivered to whoever holds the [`ProcessHandle`]
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// One chunk of output, from either stream, in arrival order
    Output(String),
    /// The process ended; sent exactly once, after all captured output
    Exited(ExitInfo),
}

/// Returned by [`ProcessSupervisor::spawn`]
#[derive(Debug)]
pub struct ProcessHandle {
    pub id: ProcessId,
    pub pid: Option<u32>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Snapshot of a supervised process
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub command: String,
    pub args: Vec<String>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub output: Vec<String>,
}

/// A process owned by the supervisor
pub struct SupervisedProcess {
    pub id: ProcessId,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    output: Mutex<OutputBuffer>,
    exit: watch::Sender<Option<(ExitInfo, DateTime<Utc>)>>,
    cancel: CancellationToken,
}

impl SupervisedProcess {
    fn record_output(&self, chunk: String) {
        self.output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(chunk);
    }

    /// Exit status, once the process has ended
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.borrow().map(|(info, _)| info)
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn snapshot(&self) -> ProcessInfo {
        let exit = *self.exit.borrow();
        ProcessInfo {
            id: self.id,
            command: self.command.clone(),
            args: self.args.clone(),
            pid: self.pid,
            started_at: self.started_at,
            exited_at: exit.map(|(_, at)| at),
            exit_code: exit.and_then(|(info, _)| info.code),
            signal: exit.and_then(|(info, _)| info.signal),
            output: self
                .output
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .chunks(),
        }
    }

    /// Wait until the process has ended
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit.subscribe();
        loop {
            if let Some((info, _)) = *rx.borrow_and_update() {
                return info;
            }
            if rx.changed().await.is_err() {
                // Sender lives in `self`, so this only happens during teardown
                return self.exit_info().unwrap_or(ExitInfo {
                    code: None,
                    signal: None,
                });
            }
        }
    }
}

/// Spawns and tracks child processes
pub struct ProcessSupervisor {
    processes: Arc<DashMap<ProcessId, Arc<SupervisedProcess>>>,
    next_id: AtomicU64,
    output_limit: usize,
}

impl ProcessSupervisor {
    /// Create a supervisor keeping `output_limit` chunks per process
    pub fn new(output_limit: usize) -> Self {
        Self {
            processes: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            output_limit,
        }
    }

    /// Start a process and begin streaming its output
    pub fn spawn(&self, spec: SpawnSpec) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        #[cfg(unix)]
        {
            // SAFETY: setsid is async-signal-safe and touches no parent state.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| OrchestratorError::Spawn {
            command: spec.command.clone(),
            source,
        })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        let (exit_tx, _) = watch::channel(None);
        let process = Arc::new(SupervisedProcess {
            id,
            command: spec.command.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            pid,
            started_at: Utc::now(),
            output: Mutex::new(OutputBuffer::new(self.output_limit)),
            exit: exit_tx,
            cancel: CancellationToken::new(),
        });
        self.processes.insert(id, Arc::clone(&process));

        tracing::info!(
            "Spawned process {} (pid {:?}): {}",
            id,
            pid,
            spec.command_line()
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Arc::clone(&process), events_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Arc::clone(&process), events_tx.clone()));
        }

        let table = Arc::clone(&self.processes);
        tokio::spawn(async move {
            let info = wait_or_kill(&mut child, &process).await;

            let _ = tokio::time::timeout(READER_DRAIN, futures::future::join_all(readers)).await;

            tracing::info!(
                "Process {} exited (code {:?}, signal {:?})",
                process.id,
                info.code,
                info.signal
            );
            table.remove(&process.id);
            process.exit.send_replace(Some((info, Utc::now())));
            let _ = events_tx.send(ProcessEvent::Exited(info));
        });

        Ok(ProcessHandle {
            id,
            pid,
            events: events_rx,
        })
    }

    /// Run a short-lived command and collect its combined output
    pub async fn run_to_completion(&self, spec: SpawnSpec) -> Result<(ExitInfo, String)> {
        let mut handle = self.spawn(spec)?;
        let mut output = String::new();
        while let Some(event) = handle.events.recv().await {
            match event {
                ProcessEvent::Output(chunk) => output.push_str(&chunk),
                ProcessEvent::Exited(info) => return Ok((info, output)),
            }
        }
        Ok((
            ExitInfo {
                code: None,
                signal: None,
            },
            output,
        ))
    }

    /// Look up a live process
    pub fn get(&self, id: ProcessId) -> Option<Arc<SupervisedProcess>> {
        self.processes.get(&id).map(|r| Arc::clone(&r))
    }

    /// Ask a process to stop
    ///
    /// Returns `true` if a live process was signalled. Unknown, exited or
    /// already-killed ids are a no-op and return `false`.
    pub fn kill(&self, id: ProcessId) -> bool {
        match self.get(id) {
            Some(process) if !process.has_exited() => {
                if !process.cancel.is_cancelled() {
                    tracing::info!("Killing process {} (pid {:?})", id, process.pid);
                    process.cancel.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Kill a process and wait for it to be gone
    pub async fn terminate(&self, id: ProcessId) -> Option<ExitInfo> {
        let process = self.get(id)?;
        process.cancel.cancel();
        Some(process.wait().await)
    }

    /// Kill every tracked process and wait for all of them
    pub async fn shutdown(&self) {
        let live: Vec<_> = self.processes.iter().map(|r| *r.key()).collect();
        if !live.is_empty() {
            tracing::info!("Stopping {} supervised process(es)", live.len());
        }
        futures::future::join_all(live.into_iter().map(|id| self.terminate(id))).await;
    }

    /// Snapshots of all live processes
    pub fn list(&self) -> Vec<ProcessInfo> {
        self.processes.iter().map(|r| r.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(500)
    }
}

fn spawn_reader<R>(
    mut stream: R,
    process: Arc<SupervisedProcess>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let emit = |bytes: &[u8]| {
            let chunk = String::from_utf8_lossy(bytes).into_owned();
            tracing::trace!("process {} output: {}", process.id, chunk.trim_end());
            process.record_output(chunk.clone());
            // The handle may have been dropped; output is still captured
            let _ = events.send(ProcessEvent::Output(chunk));
        };

        let mut buf = [0u8; READ_CHUNK];
        let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let mut start = 0;
                    while let Some(pos) = pending[start..].iter().position(|&b| b == b'\n') {
                        emit(&pending[start..=start + pos]);
                        start += pos + 1;
                    }
                    pending.drain(..start);
                    if pending.len() >= MAX_LINE {
                        emit(&pending);
                        pending.clear();
                    }
                }
                Err(e) => {
                    tracing::debug!("Output stream of process {} failed: {}", process.id, e);
                    break;
                }
            }
        }
        if !pending.is_empty() {
            emit(&pending);
        }
    })
}

async fn wait_or_kill(child: &mut Child, process: &SupervisedProcess) -> ExitInfo {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = process.cancel.cancelled() => {
            signal_group(process.pid, false);
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!("Process {} ignored SIGTERM, sending SIGKILL", process.id);
                    signal_group(process.pid, true);
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };

    match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            tracing::warn!("Failed to wait for process {}: {}", process.id, e);
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    }
}

/// Signal the child's whole process group (it leads its own session)
#[cfg(unix)]
fn signal_group(pid: Option<u32>, force: bool) {
    let Some(pid) = pid else { return };
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    // SAFETY: plain syscall; a stale group id yields ESRCH, which is ignored.
    let result = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!("Failed to signal process group {}: {}", pid, err);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _force: bool) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn collect(handle: &mut ProcessHandle) -> (Vec<String>, ExitInfo) {
        let mut output = Vec::new();
        while let Some(event) = handle.events.recv().await {
            match event {
                ProcessEvent::Output(chunk) => output.push(chunk),
                ProcessEvent::Exited(info) => return (output, info),
            }
        }
        panic!("event stream ended without an exit event");
    }

    #[tokio::test]
    async fn test_captures_both_streams_then_exit() {
        let supervisor = ProcessSupervisor::new(100);
        let mut handle = supervisor
            .spawn(SpawnSpec::new("sh").args(["-c", "echo out; echo err 1>&2; exit 3"]))
            .unwrap();

        let (output, info) = collect(&mut handle).await;
        let joined = output.concat();
        assert!(joined.contains("out\n"));
        assert!(joined.contains("err\n"));
        assert_eq!(info.code, Some(3));
        assert!(!info.success());
    }

    #[tokio::test]
    async fn test_env_overrides_reach_child() {
        let supervisor = ProcessSupervisor::new(100);
        let mut handle = supervisor
            .spawn(SpawnSpec::new("sh").args(["-c", "echo $TM_TEST_VALUE"]).env("TM_TEST_VALUE", "hello"))
            .unwrap();

        let (output, info) = collect(&mut handle).await;
        assert_eq!(output, vec!["hello\n".to_string()]);
        assert!(info.success());
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let supervisor = ProcessSupervisor::new(100);
        let mut handle = supervisor
            .spawn(SpawnSpec::new("sh").args(["-c", "sleep 30"]))
            .unwrap();

        assert!(supervisor.kill(handle.id));
        let (_, info) = collect(&mut handle).await;
        assert!(info.signal.is_some() || info.code.is_some());

        // Exited processes leave the table; killing again is a no-op
        assert!(!supervisor.kill(handle.id));
        assert!(!supervisor.kill(handle.id));
        assert!(supervisor.get(handle.id).is_none());
    }

    #[tokio::test]
    async fn test_terminate_waits_for_exit() {
        let supervisor = ProcessSupervisor::new(100);
        let handle = supervisor
            .spawn(SpawnSpec::new("sh").args(["-c", "sleep 30"]))
            .unwrap();

        let process = supervisor.get(handle.id).unwrap();
        let info = supervisor.terminate(handle.id).await.unwrap();
        assert_eq!(info, process.exit_info().unwrap());
        assert!(supervisor.terminate(handle.id).await.is_none());
    }

    #[tokio::test]
    async fn test_run_to_completion_collects_output() {
        let supervisor = ProcessSupervisor::new(100);
        let (info, output) = supervisor
            .run_to_completion(SpawnSpec::new("sh").args(["-c", "echo one; echo two 1>&2"]))
            .await
            .unwrap();
        assert!(info.success());
        assert!(output.contains("one\n"));
        assert!(output.contains("two\n"));
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_ids_are_never_reused() {
        let supervisor = ProcessSupervisor::new(100);
        let mut first = supervisor.spawn(SpawnSpec::new("true")).unwrap();
        collect(&mut first).await;
        let second = supervisor.spawn(SpawnSpec::new("true")).unwrap();
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let supervisor = ProcessSupervisor::new(100);
        let err = supervisor
            .spawn(SpawnSpec::new("/nonexistent/tm-test-binary"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Spawn { .. }));
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_keeps_bounded_output() {
        let supervisor = ProcessSupervisor::new(2);
        let mut handle = supervisor
            .spawn(SpawnSpec::new("sh").args(["-c", "echo 1; echo 2; echo 3; sleep 30"]))
            .unwrap();

        let mut seen = 0;
        while seen < 3 {
            if let Some(ProcessEvent::Output(_)) = handle.events.recv().await {
                seen += 1;
            }
        }
        let process = supervisor.get(handle.id).unwrap();
        let snapshot = process.snapshot();
        assert_eq!(snapshot.output, vec!["2\n".to_string(), "3\n".to_string()]);
        assert!(snapshot.exited_at.is_none());

        supervisor.shutdown().await;
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_output_without_newlines_is_split() {
        let supervisor = ProcessSupervisor::new(1000);
        let mut handle = supervisor
            .spawn(SpawnSpec::new("sh").args(["-c", "head -c 200000 /dev/zero | tr '\\0' x"]))
            .unwrap();

        let (output, info) = collect(&mut handle).await;
        assert!(info.success());
        assert!(output.len() >= 3);
        assert!(output.iter().all(|chunk| chunk.len() < MAX_LINE + READ_CHUNK));
        assert_eq!(output.iter().map(String::len).sum::<usize>(), 200_000);
    }

    #[tokio::test]
    async fn test_lines_stay_separate_chunks() {
        let supervisor = ProcessSupervisor::new(100);
        let mut handle = supervisor
            .spawn(SpawnSpec::new("sh").args(["-c", "printf 'a\\nb\\nc'"]))
            .unwrap();

        let (output, _) = collect(&mut handle).await;
        assert_eq!(output, vec!["a\n".to_string(), "b\n".to_string(), "c".to_string()]);
    }
}
