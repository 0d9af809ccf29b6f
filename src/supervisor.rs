use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::ports::{self, PortAllocator};
use crate::registry::{AppRecord, AppRegistry, AppState};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Timeout for a single readiness probe connection
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Extra time `stop` waits past the grace period for the exit notification
const STOP_WAIT_SLACK: Duration = Duration::from_secs(2);

/// Ownership handle to a running backend process.
///
/// The `Child` itself lives in the exit-watcher task; the handle holds the
/// channel that tells the watcher to terminate it. Dropping the handle
/// terminates the process.
pub struct ProcessHandle {
    pid: Option<u32>,
    stop_tx: oneshot::Sender<()>,
    exit_rx: oneshot::Receiver<String>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// A spawned process that is not yet attached to a record
pub struct LaunchedProcess {
    child: Child,
    source_path: PathBuf,
    ready_token: Option<String>,
}

/// Launches and supervises backend processes.
///
/// Constructed behind an `Arc` since the exit watcher and readiness probe
/// run as their own tasks.
pub struct Supervisor {
    runtime: RuntimeConfig,
    ports: Arc<PortAllocator>,
    /// Admin API base URL for readiness callbacks
    admin_url: Option<String>,
}

impl Supervisor {
    pub fn new(
        runtime: RuntimeConfig,
        ports: Arc<PortAllocator>,
        admin_url: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            ports,
            admin_url,
        })
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Allocate a port, launch the program on it and begin supervising it.
    ///
    /// A port taken between allocation and spawn is retried with a fresh
    /// port, up to `launch_attempts` times. Any other launch error is final.
    pub async fn start(self: &Arc<Self>, id: &str, source: &str) -> Result<Arc<AppRecord>> {
        let attempts = self.runtime.launch_attempts.max(1);

        for attempt in 1..=attempts {
            let lease = self.ports.lease()?;
            match self.launch(id, source, lease.port()).await {
                Ok(launched) => return Ok(self.supervise(id, lease.keep(), launched)),
                Err(Error::PortUnavailable(port)) => {
                    warn!(app_id = id, port, attempt, attempts, "Allocated port was taken, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::LaunchFailure(format!(
            "no usable port after {} attempts",
            attempts
        )))
    }

    /// Write the source to the application's directory and spawn the runtime on `port`
    pub async fn launch(&self, id: &str, source: &str, port: u16) -> Result<LaunchedProcess> {
        let command_line = self
            .runtime
            .command_line()
            .map_err(|e| Error::LaunchFailure(e.to_string()))?;

        let app_dir = self.runtime.data_dir.join(id);
        tokio::fs::create_dir_all(&app_dir).await.map_err(|e| {
            Error::LaunchFailure(format!("cannot create {}: {}", app_dir.display(), e))
        })?;
        let source_path = app_dir.join(&self.runtime.source_file);
        tokio::fs::write(&source_path, source).await.map_err(|e| {
            Error::LaunchFailure(format!("cannot write {}: {}", source_path.display(), e))
        })?;

        if !ports::is_bindable(port) {
            return Err(Error::PortUnavailable(port));
        }

        info!(app_id = id, port, command = %self.runtime.command, "Launching application");

        let mut cmd = Command::new(&command_line[0]);
        cmd.args(&command_line[1..]);
        cmd.arg(&source_path);
        cmd.current_dir(&app_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        for (key, value) in &self.runtime.env {
            cmd.env(key, value);
        }

        cmd.env("PORT", port.to_string());
        cmd.env("LAUNCHPAD_APP_ID", id);
        let ready_token = self.admin_url.as_ref().map(|admin_url| {
            let token = Uuid::new_v4().to_string();
            cmd.env("LAUNCHPAD_READY_URL", format!("{}/ready/{}", admin_url, id));
            cmd.env("LAUNCHPAD_READY_TOKEN", &token);
            token
        });

        let mut child = cmd.spawn().map_err(|e| {
            Error::LaunchFailure(format!("cannot spawn '{}': {}", command_line[0], e))
        })?;
        let pid = child.id().unwrap_or(0);
        info!(app_id = id, pid, port, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, id.to_string(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, id.to_string(), "stderr"));
        }

        Ok(LaunchedProcess {
            child,
            source_path,
            ready_token,
        })
    }

    /// Build a `Starting` record owning the process and spawn its watcher and probe
    pub fn supervise(self: &Arc<Self>, id: &str, port: u16, launched: LaunchedProcess) -> Arc<AppRecord> {
        let LaunchedProcess {
            child,
            source_path,
            ready_token,
        } = launched;
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let handle = ProcessHandle {
            pid: child.id(),
            stop_tx,
            exit_rx,
        };
        let record = Arc::new(
            AppRecord::new(id.to_string(), port, source_path, Some(handle))
                .with_ready_token(ready_token),
        );

        let manager = Arc::clone(self);
        let weak = Arc::downgrade(&record);
        tokio::spawn(async move {
            manager.watch_exit(weak, child, port, stop_rx, exit_tx).await;
        });

        let manager = Arc::clone(self);
        let weak = Arc::downgrade(&record);
        tokio::spawn(async move {
            manager.probe_readiness(weak).await;
        });

        record
    }

    /// Own the child until it exits, either on its own or when told to stop
    async fn watch_exit(
        &self,
        record: Weak<AppRecord>,
        mut child: Child,
        port: u16,
        stop_rx: oneshot::Receiver<()>,
        exit_tx: oneshot::Sender<String>,
    ) {
        let requested = tokio::select! {
            status = child.wait() => {
                let reason = describe_exit(status);
                if let Some(record) = record.upgrade() {
                    record.set_exit_reason(reason.clone());
                    if record.transition(AppState::Crashed) {
                        warn!(app_id = record.id(), port, reason = %reason, "Backend exited unexpectedly");
                    }
                }
                reason
            }
            _ = stop_rx => {
                let app_id = record
                    .upgrade()
                    .map(|r| r.id().to_string())
                    .unwrap_or_default();
                self.terminate(&app_id, &mut child).await
            }
        };

        self.ports.release(port);
        let _ = exit_tx.send(requested);
    }

    /// SIGTERM, then SIGKILL after the grace period
    async fn terminate(&self, app_id: &str, child: &mut Child) -> String {
        let grace_period = self.runtime.shutdown_grace_period();

        if let Some(pid) = child.id() {
            info!(app_id, pid, "Sending SIGTERM to backend");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(status) => {
                let reason = describe_exit(status);
                info!(app_id, reason = %reason, "Backend process exited gracefully");
                reason
            }
            Err(_) => {
                warn!(
                    app_id,
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
                "killed after grace period".to_string()
            }
        }
    }

    /// Poll the port until the backend accepts a connection or the startup timeout passes
    async fn probe_readiness(&self, record: Weak<AppRecord>) {
        let interval = self.runtime.health_check_interval();
        let timeout = self.runtime.startup_timeout();
        let start = Instant::now();

        loop {
            let Some(app) = record.upgrade() else {
                return;
            };
            if app.state() != AppState::Starting {
                debug!(app_id = app.id(), state = ?app.state(), "Stopping readiness probe, state changed");
                return;
            }

            if start.elapsed() > timeout {
                error!(app_id = app.id(), timeout_secs = timeout.as_secs(), "Backend startup timeout exceeded");
                self.mark_crashed(&app, format!(
                    "did not accept connections within {} seconds",
                    timeout.as_secs()
                ))
                .await;
                return;
            }

            let addr = format!("127.0.0.1:{}", app.port());
            if let Ok(Ok(_)) = tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                if app.transition(AppState::Running) {
                    info!(app_id = app.id(), port = app.port(), startup_ms = start.elapsed().as_millis() as u64, "Backend is now ready");
                }
                return;
            }

            drop(app);
            tokio::time::sleep(interval).await;
        }
    }

    /// Readiness reported by the backend itself (admin callback)
    pub fn mark_ready(&self, registry: &AppRegistry, id: &str) -> bool {
        registry
            .get(id)
            .map(|record| record.transition(AppState::Running))
            .unwrap_or(false)
    }

    /// Declare the backend unhealthy and terminate whatever is left of it
    pub async fn mark_crashed(&self, record: &AppRecord, reason: impl Into<String>) {
        let reason = reason.into();
        record.set_exit_reason(reason.clone());
        if record.transition(AppState::Crashed) {
            warn!(app_id = record.id(), port = record.port(), reason = %reason, "Backend marked as crashed");
        }
        self.shutdown_process(record).await;
    }

    /// Deliberately stop an application's backend
    pub async fn stop(&self, record: &AppRecord) {
        if record.transition(AppState::Stopped) {
            info!(app_id = record.id(), "Stopping application");
        }
        self.shutdown_process(record).await;
    }

    async fn shutdown_process(&self, record: &AppRecord) {
        let Some(handle) = record.take_handle() else {
            return;
        };
        let ProcessHandle { stop_tx, exit_rx, .. } = handle;
        let _ = stop_tx.send(());

        let wait = self.runtime.shutdown_grace_period() + STOP_WAIT_SLACK;
        match tokio::time::timeout(wait, exit_rx).await {
            Ok(Ok(reason)) => {
                record.set_exit_reason(reason);
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(app_id = record.id(), "Timed out waiting for backend process to exit");
            }
        }
    }

    /// Stop running applications idle for longer than `idle_timeout`
    pub async fn cleanup_idle(&self, registry: &AppRegistry, idle_timeout: Duration) {
        let idle: Vec<Arc<AppRecord>> = registry
            .records()
            .into_iter()
            .filter(|r| r.state() == AppState::Running)
            .filter(|r| r.in_flight() == 0 && r.idle_for() > idle_timeout)
            .collect();

        for record in idle {
            info!(
                app_id = record.id(),
                idle_secs = record.idle_for().as_secs(),
                "Application idle timeout reached"
            );
            self.stop(&record).await;
        }
    }

    /// Stop every application that still has a live process
    pub async fn stop_all(&self, registry: &AppRegistry) {
        for record in registry.records() {
            self.stop(&record).await;
        }
    }
}

fn describe_exit(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {}", e),
    }
}

/// Relay a backend's output stream into the log, line by line
async fn forward_output<R>(stream: R, app_id: String, stream_name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(app_id = %app_id, stream = stream_name, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(app_id = %app_id, stream = stream_name, error = %e, "Output stream closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_runtime(command: &str, data_dir: &std::path::Path) -> RuntimeConfig {
        let mut runtime = RuntimeConfig::new(command, data_dir);
        runtime.source_file = "main.sh".to_string();
        runtime.startup_timeout_secs = 1;
        runtime.health_check_interval_ms = 25;
        runtime.shutdown_grace_period_secs = 1;
        runtime
    }

    async fn wait_for_state(record: &AppRecord, want: AppState) -> bool {
        for _ in 0..200 {
            if record.state() == want {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_launch_writes_source_before_spawn() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(
            test_runtime("sleep", dir.path()),
            Arc::new(PortAllocator::new()),
            None,
        );

        // `sleep <path>` fails fast, but the source must already be on disk
        let record = supervisor.start("app-src", "print('hi')").await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("app-src/main.sh")).unwrap();
        assert_eq!(written, "print('hi')");
        assert_eq!(record.source_path(), dir.path().join("app-src/main.sh"));

        supervisor.stop(&record).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_launch_failure() {
        let dir = TempDir::new().unwrap();
        let ports = Arc::new(PortAllocator::new());
        let supervisor = Supervisor::new(
            test_runtime("/nonexistent/launchpad-runtime", dir.path()),
            Arc::clone(&ports),
            None,
        );

        let err = supervisor.start("app-bad", "x").await.unwrap_err();
        assert!(matches!(err, Error::LaunchFailure(_)));
        assert_eq!(ports.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_start_releases_port() {
        let dir = TempDir::new().unwrap();
        let ports = Arc::new(PortAllocator::new());
        let supervisor = Supervisor::new(
            test_runtime("sleep", dir.path()),
            Arc::clone(&ports),
            None,
        );

        // Dropped at its first await, while the source is being written
        let result = tokio::time::timeout(Duration::ZERO, supervisor.start("app-gone", "x")).await;
        if let Ok(Ok(record)) = result {
            supervisor.stop(&record).await;
        }
        assert_eq!(ports.leased_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ready_token_exported_with_admin_url() {
        let dir = TempDir::new().unwrap();
        let mut runtime = test_runtime("sh", dir.path());
        runtime.startup_timeout_secs = 30;
        let supervisor = Supervisor::new(
            runtime,
            Arc::new(PortAllocator::new()),
            Some("http://127.0.0.1:9999".to_string()),
        );

        let script = "echo \"$LAUNCHPAD_READY_URL $LAUNCHPAD_READY_TOKEN\" > env.txt\nexec sleep 30\n";
        let record = supervisor.start("app-env", script).await.unwrap();
        let token = record.ready_token().unwrap().to_string();

        let env_file = dir.path().join("app-env/env.txt");
        let mut written = String::new();
        for _ in 0..200 {
            written = std::fs::read_to_string(&env_file).unwrap_or_default();
            if written.ends_with('\n') {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            written.trim(),
            format!("http://127.0.0.1:9999/ready/app-env {}", token)
        );

        supervisor.stop(&record).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_before_ready_is_crashed() {
        let dir = TempDir::new().unwrap();
        let ports = Arc::new(PortAllocator::new());
        let supervisor = Supervisor::new(test_runtime("sh", dir.path()), Arc::clone(&ports), None);

        let record = supervisor.start("app-exit", "exit 3\n").await.unwrap();
        assert!(wait_for_state(&record, AppState::Crashed).await);
        assert!(record.exit_reason().unwrap().contains('3'));

        // Port lease is released once the process is gone
        for _ in 0..100 {
            if ports.leased_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ports.leased_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_startup_timeout_marks_crashed() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(
            test_runtime("sh", dir.path()),
            Arc::new(PortAllocator::new()),
            None,
        );

        // Never binds its port
        let record = supervisor.start("app-hang", "exec sleep 30\n").await.unwrap();
        assert_eq!(record.state(), AppState::Starting);
        assert!(wait_for_state(&record, AppState::Crashed).await);
        assert!(record.exit_reason().unwrap().contains("did not accept connections"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_is_terminal_and_final() {
        let dir = TempDir::new().unwrap();
        let ports = Arc::new(PortAllocator::new());
        let mut runtime = test_runtime("sh", dir.path());
        runtime.startup_timeout_secs = 30;
        let supervisor = Supervisor::new(runtime, Arc::clone(&ports), None);

        let record = supervisor.start("app-stop", "exec sleep 30\n").await.unwrap();
        supervisor.stop(&record).await;

        assert_eq!(record.state(), AppState::Stopped);
        assert!(!record.transition(AppState::Running));
        assert!(record.exit_reason().is_some());
        assert_eq!(ports.leased_count(), 0);

        // A second stop is a no-op
        supervisor.stop(&record).await;
        assert_eq!(record.state(), AppState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ready_once_port_accepts() {
        let dir = TempDir::new().unwrap();
        let mut runtime = test_runtime("sh", dir.path());
        runtime.startup_timeout_secs = 30;
        let supervisor = Supervisor::new(runtime, Arc::new(PortAllocator::new()), None);

        let record = supervisor.start("app-ready", "exec sleep 30\n").await.unwrap();

        // Stand in for the backend binding its port
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", record.port()))
            .await
            .unwrap();
        assert!(wait_for_state(&record, AppState::Running).await);

        drop(listener);
        supervisor.stop(&record).await;
        assert_eq!(record.state(), AppState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mark_ready_and_cleanup_idle() {
        let dir = TempDir::new().unwrap();
        let mut runtime = test_runtime("sh", dir.path());
        runtime.startup_timeout_secs = 30;
        let supervisor = Supervisor::new(runtime, Arc::new(PortAllocator::new()), None);
        let registry = AppRegistry::new();

        let record = supervisor.start("app-idle", "exec sleep 30\n").await.unwrap();
        registry.put(Arc::clone(&record));

        assert!(supervisor.mark_ready(&registry, "app-idle"));
        assert!(!supervisor.mark_ready(&registry, "unknown"));
        assert_eq!(record.state(), AppState::Running);

        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.cleanup_idle(&registry, Duration::from_millis(10)).await;

        assert_eq!(record.state(), AppState::Stopped);
        // Idle stop keeps the record so later requests fail fast
        assert!(registry.get("app-idle").is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_all() {
        let dir = TempDir::new().unwrap();
        let mut runtime = test_runtime("sh", dir.path());
        runtime.startup_timeout_secs = 30;
        let supervisor = Supervisor::new(runtime, Arc::new(PortAllocator::new()), None);
        let registry = AppRegistry::new();

        for id in ["a", "b"] {
            let record = supervisor.start(id, "exec sleep 30\n").await.unwrap();
            registry.put(record);
        }

        supervisor.stop_all(&registry).await;
        for summary in registry.list() {
            assert_eq!(summary.state, AppState::Stopped);
        }
    }
}
