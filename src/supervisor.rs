use crate::autolaunch::{AutoLaunch, InMemoryAutoLaunch};
use crate::binary::{Architecture, BinaryLocator};
use crate::config::SupervisorSettings;
use crate::error::{Error, ErrorCode, Result};
use crate::events::{EventSink, RunState};
use crate::runner::{ExitInfo, OutputStream, ProcessEvent, ProcessHandle, ProcessRunner};
use crate::store::{ConfigStore, Configuration};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Lifecycle of a tracked process.
///
/// A process is `Starting` between table registration and a successful
/// spawn. Stopping happens entirely under the id's lock, so it never needs a
/// table state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Starting,
    Running,
}

/// Process table entry
struct TrackedProcess {
    /// Distinguishes successive processes for the same id
    generation: u64,
    state: ProcessState,
    /// Present once spawned
    handle: Option<ProcessHandle>,
}

impl TrackedProcess {
    fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(ProcessHandle::pid)
    }
}

/// Held for the duration of a per-id transition.
///
/// Dropping it releases the mutex and removes the map entry once no other
/// task holds or waits on it.
struct IdLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Construction options for [`ProcessSupervisor`]
pub struct SupervisorOptions {
    /// Where to find the proxy executable
    pub locator: BinaryLocator,
    /// Directory for per-configuration files handed to the proxy
    pub runtime_dir: PathBuf,
    /// Argument preceding the configuration file path
    pub config_flag: String,
    /// Launch-at-login integration
    pub auto_launch: Arc<dyn AutoLaunch>,
}

impl SupervisorOptions {
    pub fn new<P: AsRef<Path>>(locator: BinaryLocator, runtime_dir: P) -> Self {
        Self {
            locator,
            runtime_dir: runtime_dir.as_ref().to_path_buf(),
            config_flag: "-c".to_string(),
            auto_launch: Arc::new(InMemoryAutoLaunch::default()),
        }
    }

    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        Self::new(settings.locator(), settings.runtime_dir())
            .with_config_flag(&settings.config_flag)
    }

    /// Set the config flag (builder pattern)
    pub fn with_config_flag(mut self, flag: &str) -> Self {
        self.config_flag = flag.to_string();
        self
    }

    /// Set the launch-at-login integration (builder pattern)
    pub fn with_auto_launch(mut self, auto_launch: Arc<dyn AutoLaunch>) -> Self {
        self.auto_launch = auto_launch;
        self
    }
}

/// Status of a configuration combined with its process
#[derive(Debug, Clone, Serialize)]
pub struct ConfigStatus {
    pub id: String,
    pub name: String,
    pub auto_start: bool,
    pub run_state: RunState,
    pub pid: Option<u32>,
}

/// Outcome of booting auto-start configurations
#[derive(Debug, Clone, Default)]
pub struct AutoStartReport {
    /// Configurations started
    pub started: Vec<String>,
    /// Configurations already running
    pub skipped: Vec<String>,
    /// Configurations that failed to start, with the reason
    pub failed: Vec<(String, String)>,
}

/// Owns the live proxy process of every configuration.
///
/// # Usage
///
/// Like other long-lived managers here, the supervisor is shared behind an
/// `Arc`; [`new`](ProcessSupervisor::new) returns `Arc<Self>`. Methods that
/// spawn watcher tasks take `self: &Arc<Self>`.
///
/// # Concurrency
///
/// `start`, `stop`, `restart` and `delete_config` hold a per-id async mutex
/// for the whole transition. A `start` for an id that already has a table
/// entry fails with [`Error::AlreadyRunning`] without waiting on that mutex.
/// Exit watchers only deregister the entry whose generation matches their
/// own, so a late exit never removes a successor process.
pub struct ProcessSupervisor {
    store: Arc<ConfigStore>,
    runner: Arc<dyn ProcessRunner>,
    locator: BinaryLocator,
    runtime_dir: PathBuf,
    config_flag: String,
    auto_launch: Arc<dyn AutoLaunch>,
    /// Resolved proxy executable; `None` until `init` succeeds
    binary: RwLock<Option<PathBuf>>,
    /// Live processes keyed by configuration id
    processes: DashMap<String, TrackedProcess>,
    /// Per-id transition locks
    locks: DashMap<String, Arc<Mutex<()>>>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    next_generation: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(
        store: Arc<ConfigStore>,
        runner: Arc<dyn ProcessRunner>,
        options: SupervisorOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            runner,
            locator: options.locator,
            runtime_dir: options.runtime_dir,
            config_flag: options.config_flag,
            auto_launch: options.auto_launch,
            binary: RwLock::new(None),
            processes: DashMap::new(),
            locks: DashMap::new(),
            sinks: RwLock::new(Vec::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Register an observer
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Resolve and verify the proxy executable.
    ///
    /// On failure the supervisor stays usable for queries and store
    /// operations, but every start fails with `BinaryUnavailable`.
    pub fn init(&self) -> Result<PathBuf> {
        match self.locator.resolve() {
            Ok(path) => {
                *self.binary.write() = Some(path.clone());
                Ok(path)
            }
            Err(e) => {
                error!(error = %e, "Proxy binary unavailable, starts are disabled");
                *self.binary.write() = None;
                for sink in self.sinks() {
                    sink.on_initialization_error(&e.to_string());
                }
                Err(e)
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.binary.read().is_some()
    }

    /// Host CPU architecture class
    pub fn architecture(&self) -> Architecture {
        Architecture::current()
    }

    /// Current run state of a configuration
    pub fn run_state(&self, id: &str) -> RunState {
        self.processes
            .get(id)
            .map(|p| match p.state {
                ProcessState::Starting | ProcessState::Running => RunState::Running,
            })
            .unwrap_or(RunState::Stopped)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.run_state(id) == RunState::Running
    }

    pub fn pid(&self, id: &str) -> Option<u32> {
        self.processes.get(id).and_then(|p| p.pid())
    }

    /// Number of tracked processes
    pub fn running_count(&self) -> usize {
        self.processes.len()
    }

    /// All stored configurations with their run state, in store order
    pub fn list(&self) -> Vec<ConfigStatus> {
        self.store
            .list()
            .into_iter()
            .map(|config| ConfigStatus {
                run_state: self.run_state(&config.id),
                pid: self.pid(&config.id),
                id: config.id,
                name: config.name,
                auto_start: config.auto_start,
            })
            .collect()
    }

    /// Start the proxy for a configuration
    pub async fn start(self: &Arc<Self>, config: &Configuration) -> Result<()> {
        if self.processes.contains_key(&config.id) {
            debug!(config_id = %config.id, "Proxy already running or starting");
            return Err(Error::AlreadyRunning(config.id.clone()));
        }

        let _lock = self.lock_id(&config.id).await;
        self.start_locked(config).await
    }

    /// Start a stored configuration by id
    pub async fn start_by_id(self: &Arc<Self>, id: &str) -> Result<()> {
        let config = self.store.get(id)?;
        self.start(&config).await
    }

    /// Stop the proxy for a configuration. Returns whether a process was tracked.
    pub async fn stop(&self, id: &str) -> bool {
        let _lock = self.lock_id(id).await;
        self.stop_locked(id)
    }

    /// Stop then start. A failed start leaves the configuration stopped.
    pub async fn restart(self: &Arc<Self>, config: &Configuration) -> Result<()> {
        let _lock = self.lock_id(&config.id).await;
        self.stop_locked(&config.id);
        self.start_locked(config).await
    }

    pub async fn restart_by_id(self: &Arc<Self>, id: &str) -> Result<()> {
        let config = self.store.get(id)?;
        self.restart(&config).await
    }

    /// Validate and persist a configuration.
    ///
    /// A running process keeps its current document until restarted. A
    /// rejected configuration without an id is only reported to the caller,
    /// since observers have no id to attach the error to.
    pub fn save_config(&self, config: Configuration) -> Result<Configuration> {
        let id = config.id.clone();
        self.store.save(config).map_err(|e| {
            if e.code().is_config_scoped() && !id.is_empty() {
                self.emit_error(&id, e.code(), &e.to_string());
            }
            e
        })
    }

    /// Stop the configuration's process, if any, then remove it from the store
    pub async fn delete_config(&self, id: &str) -> Result<bool> {
        let _lock = self.lock_id(id).await;
        self.stop_locked(id);
        let removed = self.store.delete(id)?;
        if removed {
            info!(config_id = %id, "Configuration deleted");
        }
        Ok(removed)
    }

    /// Start every auto-start configuration that is not already running.
    ///
    /// Failures are reported and do not stop the remaining attempts.
    pub async fn init_auto_start(self: &Arc<Self>, configs: &[Configuration]) -> AutoStartReport {
        let mut report = AutoStartReport::default();

        for config in configs.iter().filter(|c| c.auto_start) {
            if self.is_running(&config.id) {
                report.skipped.push(config.id.clone());
                continue;
            }

            match self.start(config).await {
                Ok(()) => report.started.push(config.id.clone()),
                Err(e) => {
                    warn!(config_id = %config.id, error = %e, "Auto-start failed");
                    if !e.code().is_config_scoped() {
                        self.emit_error(&config.id, e.code(), &e.to_string());
                    }
                    report.failed.push((config.id.clone(), e.to_string()));
                }
            }
        }

        info!(
            started = report.started.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Auto-start complete"
        );
        report
    }

    /// Auto-start from the current store contents
    pub async fn auto_start_stored(self: &Arc<Self>) -> AutoStartReport {
        let configs = self.store.list();
        self.init_auto_start(&configs).await
    }

    /// Kill every tracked process and clear the table.
    ///
    /// Never blocks and is safe to call repeatedly.
    pub fn cleanup(&self) {
        let ids: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return;
        }

        info!(count = ids.len(), "Killing all proxy processes");
        for id in ids {
            let Some((_, tracked)) = self.processes.remove(&id) else {
                continue;
            };
            if let Some(handle) = tracked.handle {
                handle.force_kill();
            }
            self.emit_status(&id, RunState::Stopped);
        }
    }

    pub fn auto_launch_enabled(&self) -> bool {
        self.auto_launch.is_enabled()
    }

    pub fn set_auto_launch(&self, enabled: bool) -> std::io::Result<()> {
        self.auto_launch.set_enabled(enabled)?;
        info!(enabled, "Launch at login updated");
        Ok(())
    }

    /// Path of the file handed to the proxy for a configuration.
    ///
    /// Bytes outside `[A-Za-z0-9-]` are written as `_xx` hex escapes, so
    /// distinct ids always get distinct files.
    pub fn runtime_config_path(&self, id: &str) -> PathBuf {
        let mut name = String::with_capacity(id.len());
        for byte in id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                name.push(byte as char);
            } else {
                name.push_str(&format!("_{:02x}", byte));
            }
        }
        self.runtime_dir.join(format!("{}.toml", name))
    }

    async fn lock_id(&self, id: &str) -> IdLock<'_> {
        let lock = Arc::clone(self.locks.entry(id.to_string()).or_default().value());
        let guard = lock.lock_owned().await;
        IdLock {
            locks: &self.locks,
            id: id.to_string(),
            guard: Some(guard),
        }
    }

    fn is_current(&self, id: &str, generation: u64) -> bool {
        self.processes
            .get(id)
            .is_some_and(|tracked| tracked.generation == generation)
    }

    fn binary_path(&self) -> Result<PathBuf> {
        self.binary.read().clone().ok_or_else(|| {
            Error::BinaryUnavailable(format!(
                "{} has not been verified",
                self.locator.path().display()
            ))
        })
    }

    async fn start_locked(self: &Arc<Self>, config: &Configuration) -> Result<()> {
        let id = config.id.as_str();
        let binary = self.binary_path()?;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        match self.processes.entry(id.to_string()) {
            Entry::Occupied(_) => return Err(Error::AlreadyRunning(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(TrackedProcess {
                    generation,
                    state: ProcessState::Starting,
                    handle: None,
                });
            }
        }

        let config_path = match self.write_runtime_config(config).await {
            Ok(path) => path,
            Err(source) => {
                self.deregister(id, generation);
                return Err(self.spawn_failed(id, source));
            }
        };

        info!(config_id = %id, name = %config.name, binary = %binary.display(), "Starting proxy");
        let args = [
            OsString::from(&self.config_flag),
            config_path.clone().into_os_string(),
        ];
        let spawned = match self.runner.spawn(&binary, &args) {
            Ok(spawned) => spawned,
            Err(source) => {
                self.deregister(id, generation);
                return Err(self.spawn_failed(id, source));
            }
        };

        let pid = spawned.handle.pid();
        let registered = match self.processes.get_mut(id) {
            Some(mut tracked) if tracked.generation == generation => {
                tracked.state = ProcessState::Running;
                tracked.handle = Some(spawned.handle);
                None
            }
            _ => Some(spawned.handle),
        };
        if let Some(orphan) = registered {
            // cleanup() cleared the table while we were spawning
            orphan.force_kill();
            return Err(Error::RuntimeFailure {
                id: id.to_string(),
                message: "supervisor shut down during start".to_string(),
            });
        }

        info!(config_id = %id, pid, "Proxy started");
        self.emit_status(id, RunState::Running);

        let supervisor = Arc::clone(self);
        let id_owned = id.to_string();
        let events = spawned.events;
        tokio::spawn(async move {
            supervisor
                .watch_process(id_owned, generation, config_path, events)
                .await;
        });

        Ok(())
    }

    fn stop_locked(&self, id: &str) -> bool {
        let Some((_, tracked)) = self.processes.remove(id) else {
            debug!(config_id = %id, "Stop requested for a configuration that is not running");
            return false;
        };

        let pid = tracked.pid();
        if let Some(handle) = tracked.handle {
            info!(config_id = %id, pid, "Stopping proxy");
            handle.kill();
        }
        self.emit_status(id, RunState::Stopped);
        true
    }

    fn deregister(&self, id: &str, generation: u64) -> bool {
        self.processes
            .remove_if(id, |_, tracked| tracked.generation == generation)
            .is_some()
    }

    fn spawn_failed(&self, id: &str, source: std::io::Error) -> Error {
        let err = Error::SpawnFailure {
            id: id.to_string(),
            source,
        };
        error!(config_id = %id, error = %err, "Failed to start proxy");
        self.emit_error(id, err.code(), &err.to_string());
        err
    }

    async fn write_runtime_config(&self, config: &Configuration) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.runtime_dir).await?;
        let path = self.runtime_config_path(&config.id);
        tokio::fs::write(&path, config.body.as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        Ok(path)
    }

    /// Follow a process until it exits
    async fn watch_process(
        self: Arc<Self>,
        id: String,
        generation: u64,
        config_path: PathBuf,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        let exit = loop {
            match events.recv().await {
                Some(ProcessEvent::Output {
                    stream: OutputStream::Stdout,
                    line,
                }) => {
                    info!(target: "proxy", config_id = %id, stream = "stdout", "{}", line);
                }
                Some(ProcessEvent::Output {
                    stream: OutputStream::Stderr,
                    line,
                }) => {
                    warn!(target: "proxy", config_id = %id, stream = "stderr", "{}", line);
                    // A stopped or replaced process no longer speaks for the id
                    if self.is_current(&id, generation) {
                        self.emit_error(&id, ErrorCode::RuntimeFailure, &line);
                    }
                }
                Some(ProcessEvent::Exited(info)) => break info,
                None => {
                    warn!(config_id = %id, "Process event stream closed without exit status");
                    break ExitInfo {
                        code: None,
                        stopped: false,
                    };
                }
            }
        };

        self.handle_exit(&id, generation, exit, &config_path).await;
    }

    async fn handle_exit(&self, id: &str, generation: u64, exit: ExitInfo, config_path: &Path) {
        let _lock = self.lock_id(id).await;

        if self.deregister(id, generation) {
            info!(config_id = %id, exit_code = ?exit.code, "Proxy exited");
            self.emit_status(id, RunState::Stopped);
        } else {
            debug!(config_id = %id, exit_code = ?exit.code, "Stopped proxy exited");
        }

        if exit.is_failure() {
            let err = Error::RuntimeFailure {
                id: id.to_string(),
                message: format!("exited with code {}", exit.code.unwrap_or_default()),
            };
            error!(config_id = %id, exit_code = ?exit.code, "Proxy exited abnormally");
            self.emit_error(id, err.code(), &err.to_string());
        }

        // A successor writes the same file, so only remove it while stopped
        if !self.processes.contains_key(id) {
            if let Err(e) = tokio::fs::remove_file(config_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(config_id = %id, error = %e, "Failed to remove runtime config");
                }
            }
        }
    }

    fn sinks(&self) -> Vec<Arc<dyn EventSink>> {
        self.sinks.read().clone()
    }

    fn emit_status(&self, id: &str, state: RunState) {
        for sink in self.sinks() {
            sink.on_status_changed(id, state);
        }
    }

    fn emit_error(&self, id: &str, code: ErrorCode, message: &str) {
        for sink in self.sinks() {
            sink.on_error(id, code, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BroadcastSink, EventKind};
    use crate::runner::TokioRunner;
    use std::time::Duration;
    use tempfile::TempDir;

    const BODY: &str = "serverAddr = \"127.0.0.1\"\nserverPort = 7000\n";

    /// Installs `script` as the proxy binary and returns a supervisor using it
    fn create_test_supervisor(dir: &TempDir, script: &str) -> Arc<ProcessSupervisor> {
        let locator = BinaryLocator::new(dir.path().join("resources"), "frpc", Architecture::current());
        let path = locator.path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let store = Arc::new(ConfigStore::open(dir.path().join("configs.json")));
        ProcessSupervisor::new(
            store,
            Arc::new(TokioRunner::new(Duration::from_secs(1))),
            SupervisorOptions::new(locator, dir.path().join("run")),
        )
    }

    async fn wait_for_state(supervisor: &ProcessSupervisor, id: &str, state: RunState) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if supervisor.run_state(id) == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_runtime_config_path_is_sanitized() {
        let dir = TempDir::new().unwrap();
        let supervisor = create_test_supervisor(&dir, "#!/bin/sh\n");
        let path = supervisor.runtime_config_path("../etc/passwd");
        assert_eq!(
            path,
            dir.path().join("run").join("_2e_2e_2fetc_2fpasswd.toml")
        );
    }

    #[test]
    fn test_runtime_config_paths_are_distinct() {
        let dir = TempDir::new().unwrap();
        let supervisor = create_test_supervisor(&dir, "#!/bin/sh\n");

        let dotted = supervisor.runtime_config_path("edge.a");
        let underscored = supervisor.runtime_config_path("edge_a");
        assert_ne!(dotted, underscored);

        let id = uuid::Uuid::new_v4().to_string();
        assert_eq!(
            supervisor.runtime_config_path(&id),
            dir.path().join("run").join(format!("{}.toml", id))
        );
    }

    #[tokio::test]
    async fn test_id_locks_are_released() {
        let dir = TempDir::new().unwrap();
        let supervisor = create_test_supervisor(&dir, "#!/bin/sh\n");

        for i in 0..16 {
            assert!(!supervisor.stop(&format!("missing-{}", i)).await);
        }
        assert!(supervisor.locks.is_empty());
    }

    #[tokio::test]
    async fn test_id_lock_survives_while_contended() {
        let dir = TempDir::new().unwrap();
        let supervisor = create_test_supervisor(&dir, "#!/bin/sh\n");

        let first = supervisor.lock_id("a").await;
        let other = Arc::clone(&supervisor);
        let waiter = tokio::spawn(async move {
            let _lock = other.lock_id("a").await;
            other.locks.len()
        });

        // Let the waiter queue on the same mutex before releasing it
        tokio::task::yield_now().await;
        assert_eq!(supervisor.locks.len(), 1);
        drop(first);

        assert_eq!(waiter.await.unwrap(), 1);
        assert!(supervisor.locks.is_empty());
    }

    #[test]
    fn test_initial_state_is_stopped() {
        let dir = TempDir::new().unwrap();
        let supervisor = create_test_supervisor(&dir, "#!/bin/sh\n");

        assert_eq!(supervisor.run_state("anything"), RunState::Stopped);
        assert!(supervisor.pid("anything").is_none());
        assert_eq!(supervisor.running_count(), 0);
        assert!(!supervisor.is_initialized());
    }

    #[tokio::test]
    async fn test_start_before_init_is_binary_unavailable() {
        let dir = TempDir::new().unwrap();
        let supervisor = create_test_supervisor(&dir, "#!/bin/sh\n");
        let config = supervisor
            .save_config(Configuration::new("home", BODY))
            .unwrap();

        let err = supervisor.start(&config).await.unwrap_err();
        assert!(matches!(err, Error::BinaryUnavailable(_)));
        assert_eq!(supervisor.run_state(&config.id), RunState::Stopped);
    }

    #[test]
    fn test_init_failure_emits_initialization_error() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConfigStore::open(dir.path().join("configs.json")));
        let locator = BinaryLocator::new(dir.path().join("missing"), "frpc", Architecture::current());
        let supervisor = ProcessSupervisor::new(
            store,
            Arc::new(TokioRunner::default()),
            SupervisorOptions::new(locator, dir.path().join("run")),
        );
        let sink = Arc::new(BroadcastSink::default());
        let mut rx = sink.subscribe();
        supervisor.add_sink(sink);

        assert!(supervisor.init().is_err());
        assert!(!supervisor.is_initialized());
        assert!(matches!(
            rx.try_recv().unwrap().kind,
            EventKind::InitializationError { .. }
        ));
    }

    #[test]
    fn test_auto_launch_toggle() {
        let dir = TempDir::new().unwrap();
        let supervisor = create_test_supervisor(&dir, "#!/bin/sh\n");
        assert!(!supervisor.auto_launch_enabled());
        supervisor.set_auto_launch(true).unwrap();
        assert!(supervisor.auto_launch_enabled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_and_stop_real_process() {
        let dir = TempDir::new().unwrap();
        let supervisor = create_test_supervisor(&dir, "#!/bin/sh\nexec sleep 60\n");
        supervisor.init().unwrap();
        let config = supervisor
            .save_config(Configuration::new("home", BODY))
            .unwrap();

        supervisor.start(&config).await.unwrap();
        assert_eq!(supervisor.run_state(&config.id), RunState::Running);
        assert!(supervisor.pid(&config.id).is_some());

        let runtime_file = supervisor.runtime_config_path(&config.id);
        assert_eq!(std::fs::read_to_string(&runtime_file).unwrap(), BODY);

        assert!(supervisor.stop(&config.id).await);
        assert_eq!(supervisor.run_state(&config.id), RunState::Stopped);

        // The exit watcher removes the runtime file once the process is gone
        let start = std::time::Instant::now();
        while runtime_file.exists() && start.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!runtime_file.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crashing_process_is_deregistered() {
        let dir = TempDir::new().unwrap();
        let supervisor = create_test_supervisor(&dir, "#!/bin/sh\necho bad config >&2\nexit 1\n");
        supervisor.init().unwrap();
        let sink = Arc::new(BroadcastSink::default());
        let mut rx = sink.subscribe();
        supervisor.add_sink(sink);

        let config = supervisor
            .save_config(Configuration::new("home", BODY))
            .unwrap();
        supervisor.start(&config).await.unwrap();
        assert!(wait_for_state(&supervisor, &config.id, RunState::Stopped).await);

        let mut kinds = Vec::new();
        while kinds.len() < 4 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            kinds.push(event.kind);
        }

        assert!(matches!(kinds[0], EventKind::StatusChanged { state: RunState::Running, .. }));
        assert!(matches!(
            &kinds[1],
            EventKind::Error { code: ErrorCode::RuntimeFailure, message, .. } if message == "bad config"
        ));
        assert!(matches!(kinds[2], EventKind::StatusChanged { state: RunState::Stopped, .. }));
        assert!(matches!(
            &kinds[3],
            EventKind::Error { code: ErrorCode::RuntimeFailure, message, .. } if message.contains("code 1")
        ));
    }
}
