//! Supervision module.
//!
//! Owns the process and channel tables, drives the per-process lifecycle
//! state machine, and runs the event loop that multiplexes channel polling
//! with supervision timers.
//!
//! Locking follows a two-lock discipline: the process and channel tables
//! share one coarse mutex held only for short, non-awaiting critical
//! sections; the router carries its own lock, which is never held while the
//! table lock is held. Handlers therefore run lock-free and may call back
//! into the supervisor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::adapter::{self, ChildHandle, ExitPoll, SpawnError, SpawnIo};
use crate::channel::{Channel, ChannelError, ChannelKind, FileIpcChannel, StdioChannel};
use crate::envelope::{self, Envelope, EnvelopeKind, RateLimiter};
use crate::process::{ProcessConfig, ProcessSnapshot, ProcessState};
use crate::router::{HandlerError, Router};

/// Cadence of the per-process monitor task.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Settle delay between the stop and start halves of a restart.
const RESTART_SETTLE: Duration = Duration::from_millis(500);

/// Per-channel receive timeout used by the event-loop sweep.
const SWEEP_RECEIVE_TIMEOUT: Duration = Duration::from_millis(20);

/// Pause between event-loop sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Directory FileIPC drop files are created in.
    pub ipc_dir: PathBuf,

    /// Per-source inbound message budget (messages per second). `None`
    /// leaves the rate-limit hook as an always-pass noop.
    pub rate_limit: Option<u32>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            ipc_dir: PathBuf::from("."),
            rate_limit: None,
        }
    }
}

/// Supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// A process name must be non-empty.
    #[error("process name must not be empty")]
    EmptyName,

    /// A process with this name is already registered.
    #[error("process '{0}' is already registered")]
    DuplicateName(String),

    /// `depends_on` referenced a name that is not registered.
    #[error("process '{process}' depends on unknown process '{dependency}'")]
    UnknownDependency {
        /// The process being registered.
        process: String,
        /// The unresolved dependency name.
        dependency: String,
    },

    /// No process with this name is registered.
    #[error("process '{0}' is not registered")]
    UnknownProcess(String),

    /// A dependency has not reached the running state yet.
    #[error("dependency '{dependency}' of process '{process}' is not running")]
    DependencyNotReady {
        /// The process being started.
        process: String,
        /// The dependency that is not running.
        dependency: String,
    },

    /// The operation is not legal from the process's current state.
    #[error("process '{process}' is {state}, operation not permitted")]
    InvalidState {
        /// The process operated on.
        process: String,
        /// Its current state.
        state: ProcessState,
    },

    /// The child executable could not be launched.
    #[error("failed to start process '{process}': {source}")]
    Spawn {
        /// The process being started.
        process: String,
        /// The underlying spawn failure.
        #[source]
        source: SpawnError,
    },

    /// A transport could not be set up at registration.
    #[error("channel setup failed for process '{process}': {source}")]
    Channel {
        /// The process being registered.
        process: String,
        /// The underlying channel failure.
        #[source]
        source: ChannelError,
    },
}

/// Mutable per-process row in the process table.
struct ProcessRecord {
    config: Arc<ProcessConfig>,
    state: ProcessState,
    handle: Option<ChildHandle>,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<Instant>,
    restart_count: u32,
    last_error: Option<String>,
    /// Typed handle to this process's stdio channel, kept so the pipes
    /// captured at spawn can be attached to it.
    stdio: Option<Arc<StdioChannel>>,
    /// Bumped on every start. A monitor task only acts while its captured
    /// incarnation matches, so a stale monitor from a previous run exits
    /// instead of double-polling the record.
    incarnation: u64,
}

impl ProcessRecord {
    fn snapshot(&self, name: &str) -> ProcessSnapshot {
        ProcessSnapshot {
            name: name.to_string(),
            kind: self.config.kind,
            state: self.state,
            pid: self.pid,
            started_at: self.started_at,
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
        }
    }
}

struct Tables {
    processes: HashMap<String, ProcessRecord>,
    channels: HashMap<(String, ChannelKind), Arc<dyn Channel>>,
}

struct Shared {
    tables: Mutex<Tables>,
    router: Router,
    rate_limiter: RateLimiter,
    running: AtomicBool,
    shutdown_started: AtomicBool,
    options: SupervisorOptions,
}

/// What the monitor decided after marking a process crashed.
enum CrashAction {
    Restart(Duration),
    Terminal,
}

/// Local process supervisor.
///
/// Cloning is cheap and yields another handle onto the same supervisor.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Create a supervisor with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(SupervisorOptions::default())
    }

    /// Create a supervisor with the given options.
    #[must_use]
    pub fn with_options(options: SupervisorOptions) -> Self {
        let rate_limiter = options
            .rate_limit
            .map_or_else(RateLimiter::new, RateLimiter::with_limit);
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables {
                    processes: HashMap::new(),
                    channels: HashMap::new(),
                }),
                router: Router::new(),
                rate_limiter,
                running: AtomicBool::new(false),
                shutdown_started: AtomicBool::new(false),
                options,
            }),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.shared.tables.lock().expect("process table lock poisoned")
    }

    /// Register a process and instantiate its channels.
    ///
    /// # Errors
    ///
    /// Rejects empty and duplicate names and unresolved `depends_on`
    /// entries; both leave existing registrations untouched. Channel setup
    /// failures are also fatal to the registration.
    pub async fn register_process(&self, config: ProcessConfig) -> Result<(), SupervisorError> {
        if config.name.is_empty() {
            return Err(SupervisorError::EmptyName);
        }
        {
            let tables = self.tables();
            if tables.processes.contains_key(&config.name) {
                return Err(SupervisorError::DuplicateName(config.name));
            }
            for dependency in &config.depends_on {
                if !tables.processes.contains_key(dependency) {
                    return Err(SupervisorError::UnknownDependency {
                        process: config.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        // Channel setup does I/O, so it happens outside the table lock.
        let mut built: Vec<((String, ChannelKind), Arc<dyn Channel>)> = Vec::new();
        let mut stdio = None;
        for kind in &config.transports {
            let channel: Arc<dyn Channel> = match kind {
                ChannelKind::FileIpc => Arc::new(FileIpcChannel::new(
                    self.shared
                        .options
                        .ipc_dir
                        .join(format!("ipc_{}.json", config.name)),
                )),
                ChannelKind::Stdio => {
                    let channel = Arc::new(StdioChannel::new(config.name.clone()));
                    stdio = Some(Arc::clone(&channel));
                    channel
                }
                ChannelKind::NamedPipe => {
                    warn!(process = %config.name, "named_pipe transport is not available, skipping");
                    continue;
                }
            };
            channel
                .initialize()
                .await
                .map_err(|source| SupervisorError::Channel {
                    process: config.name.clone(),
                    source,
                })?;
            built.push(((config.name.clone(), *kind), channel));
        }

        let name = config.name.clone();
        let record = ProcessRecord {
            config: Arc::new(config),
            state: ProcessState::Created,
            handle: None,
            pid: None,
            started_at: None,
            last_heartbeat_at: None,
            restart_count: 0,
            last_error: None,
            stdio,
            incarnation: 0,
        };

        let mut tables = self.tables();
        if tables.processes.contains_key(&name) {
            return Err(SupervisorError::DuplicateName(name));
        }
        tables.processes.insert(name.clone(), record);
        tables.channels.extend(built);
        info!(process = %name, "registered process");
        Ok(())
    }

    /// Start a registered process.
    ///
    /// Legal from Created, Stopped, and Crashed. Every `depends_on` entry
    /// must already be running; startup orchestration across the whole
    /// fleet belongs to [`Supervisor::start_all`].
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::DependencyNotReady`] when a dependency is
    /// not running, [`SupervisorError::InvalidState`] from other states, and
    /// [`SupervisorError::Spawn`] when the executable cannot be launched
    /// (which leaves the process crashed and subject to manual restart).
    pub async fn start_process(&self, name: &str) -> Result<(), SupervisorError> {
        let (config, stdio, epoch) = {
            let mut tables = self.tables();
            let record = tables
                .processes
                .get(name)
                .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;
            if !record.state.can_start() {
                return Err(SupervisorError::InvalidState {
                    process: name.to_string(),
                    state: record.state,
                });
            }
            for dependency in &record.config.depends_on {
                let ready = tables
                    .processes
                    .get(dependency)
                    .is_some_and(|dep| dep.state.is_running());
                if !ready {
                    return Err(SupervisorError::DependencyNotReady {
                        process: name.to_string(),
                        dependency: dependency.clone(),
                    });
                }
            }
            let record = tables
                .processes
                .get_mut(name)
                .expect("record checked above");
            record.state = ProcessState::Starting;
            record.last_error = None;
            record.incarnation += 1;
            (
                Arc::clone(&record.config),
                record.stdio.clone(),
                record.incarnation,
            )
        };

        let io = if stdio.is_some() {
            SpawnIo::Piped
        } else {
            SpawnIo::Inherit
        };
        let mut spawned = match adapter::spawn(&config, io) {
            Ok(spawned) => spawned,
            Err(source) => {
                let mut tables = self.tables();
                if let Some(record) = tables.processes.get_mut(name) {
                    record.state = ProcessState::Crashed;
                    record.last_error = Some(source.to_string());
                }
                error!(process = %name, "spawn failed: {source}");
                return Err(SupervisorError::Spawn {
                    process: name.to_string(),
                    source,
                });
            }
        };

        if let Some(channel) = &stdio {
            if let (Some(stdin), Some(stdout)) = (spawned.stdin.take(), spawned.stdout.take()) {
                channel.attach(stdin, stdout).await;
            }
            if let Some(stderr) = spawned.stderr.take() {
                channel.spawn_stderr_drain(stderr);
            }
        }

        let pid = spawned.pid;
        let mut handle = Some(spawned.handle);
        {
            let mut tables = self.tables();
            match tables.processes.get_mut(name) {
                Some(record)
                    if record.state == ProcessState::Starting
                        && record.incarnation == epoch =>
                {
                    record.handle = handle.take();
                    record.pid = Some(pid);
                    record.state = ProcessState::Running;
                    record.started_at = Some(Utc::now());
                    record.last_heartbeat_at = Some(Instant::now());
                }
                _ => {}
            }
        }
        // The record was stopped or replaced while we were spawning; this
        // child must not outlive that decision.
        if let Some(orphan) = handle {
            if let Err(err) = adapter::terminate(orphan, true).await {
                warn!(process = %name, "failed to kill orphaned spawn: {err}");
            }
            return Err(SupervisorError::InvalidState {
                process: name.to_string(),
                state: self
                    .get_process_state(name)
                    .unwrap_or(ProcessState::Stopped),
            });
        }
        info!(process = %name, pid, "process running");

        self.spawn_monitor(name.to_string(), epoch);
        Ok(())
    }

    /// Stop a starting or running process.
    ///
    /// `restart_count` is preserved; a stop followed by a start does not
    /// consume restart budget.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::InvalidState`] unless the process is
    /// starting or running.
    pub async fn stop_process(&self, name: &str, force: bool) -> Result<(), SupervisorError> {
        let handle = {
            let mut tables = self.tables();
            let record = tables
                .processes
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;
            if !record.state.is_active() {
                return Err(SupervisorError::InvalidState {
                    process: name.to_string(),
                    state: record.state,
                });
            }
            record.state = ProcessState::Stopping;
            record.handle.take()
        };

        info!(process = %name, force, "stopping process");
        if let Some(handle) = handle {
            match adapter::terminate(handle, force).await {
                Ok(code) => debug!(process = %name, ?code, "process terminated"),
                Err(err) => warn!(process = %name, "terminate failed: {err}"),
            }
        }

        let mut tables = self.tables();
        if let Some(record) = tables.processes.get_mut(name) {
            record.state = ProcessState::Stopped;
            record.pid = None;
        }
        Ok(())
    }

    /// Restart a process: graceful stop, settle delay, start. Increments
    /// `restart_count`.
    ///
    /// # Errors
    ///
    /// Propagates stop and start failures.
    pub async fn restart_process(&self, name: &str) -> Result<(), SupervisorError> {
        let state = {
            let tables = self.tables();
            tables
                .processes
                .get(name)
                .map(|record| record.state)
                .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?
        };

        if state.is_active() {
            self.stop_process(name, false).await?;
        } else {
            // A crashed-but-unreaped child (heartbeat timeout leaves the
            // hung process alive) must be taken down before relaunch.
            let stale = {
                let mut tables = self.tables();
                tables
                    .processes
                    .get_mut(name)
                    .and_then(|record| record.handle.take())
            };
            if let Some(handle) = stale {
                if let Err(err) = adapter::terminate(handle, false).await {
                    warn!(process = %name, "failed to terminate stale child: {err}");
                }
            }
        }

        tokio::time::sleep(RESTART_SETTLE).await;

        {
            let mut tables = self.tables();
            if let Some(record) = tables.processes.get_mut(name) {
                record.restart_count += 1;
            }
        }
        self.start_process(name).await
    }

    /// Start every startable process in dependency order.
    ///
    /// Repeatedly sweeps the table, starting each Created process whose
    /// dependencies are all running, until a sweep makes no progress.
    /// Processes left Created after that (a dependency cycle, or a
    /// dependency that failed to start) stay Created and are reported.
    pub async fn start_all(&self) {
        loop {
            let ready: Vec<String> = {
                let tables = self.tables();
                let mut names: Vec<String> = tables
                    .processes
                    .iter()
                    .filter(|(_, record)| record.state == ProcessState::Created)
                    .filter(|(_, record)| {
                        record.config.depends_on.iter().all(|dependency| {
                            tables
                                .processes
                                .get(dependency)
                                .is_some_and(|dep| dep.state.is_running())
                        })
                    })
                    .map(|(name, _)| name.clone())
                    .collect();
                names.sort();
                names
            };
            if ready.is_empty() {
                break;
            }

            let mut progress = false;
            for name in ready {
                match self.start_process(&name).await {
                    Ok(()) => progress = true,
                    Err(err) => warn!(process = %name, "start failed: {err}"),
                }
            }
            if !progress {
                break;
            }
        }

        let unstarted: Vec<String> = {
            let tables = self.tables();
            let mut names: Vec<String> = tables
                .processes
                .iter()
                .filter(|(_, record)| record.state == ProcessState::Created)
                .map(|(name, _)| name.clone())
                .collect();
            names.sort();
            names
        };
        if !unstarted.is_empty() {
            warn!(
                ?unstarted,
                "processes left unstarted: unsatisfied or cyclic dependencies"
            );
        }
    }

    /// Stop every active process, dependents before their dependencies, so
    /// each process gets a chance to flush to the processes it depends on.
    pub async fn stop_all(&self) {
        for name in self.shutdown_order() {
            let active = {
                let tables = self.tables();
                tables
                    .processes
                    .get(&name)
                    .is_some_and(|record| record.state.is_active())
            };
            if active {
                if let Err(err) = self.stop_process(&name, false).await {
                    warn!(process = %name, "stop failed: {err}");
                }
            }
        }
    }

    /// Reverse startup order: Kahn's algorithm over `depends_on` gives the
    /// dependency-ordered startup sequence, and stopping walks its reverse.
    fn shutdown_order(&self) -> Vec<String> {
        let tables = self.tables();
        let mut indegree: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (name, record) in &tables.processes {
            let deps: Vec<&String> = record
                .config
                .depends_on
                .iter()
                .filter(|dependency| tables.processes.contains_key(*dependency))
                .collect();
            indegree.insert(name.clone(), deps.len());
            for dependency in deps {
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(name.clone());
            }
        }

        let mut queue: Vec<String> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| name.clone())
            .collect();
        queue.sort();

        let mut order = Vec::with_capacity(indegree.len());
        while !queue.is_empty() {
            let name = queue.remove(0);
            if let Some(children) = dependents.get(&name) {
                for child in children {
                    let degree = indegree.get_mut(child).expect("dependent is registered");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(child.clone());
                        queue.sort();
                    }
                }
            }
            order.push(name);
        }

        // A cycle (which violates the registration contract) leaves names
        // unordered; append them so they are still stopped.
        if order.len() < indegree.len() {
            let mut leftover: Vec<String> = indegree
                .keys()
                .filter(|name| !order.contains(*name))
                .cloned()
                .collect();
            leftover.sort();
            order.extend(leftover);
        }

        order.reverse();
        order
    }

    /// Deliver an envelope to every channel bound to `target`.
    ///
    /// Returns the number of successful deliveries.
    pub async fn send_message(&self, target: &str, envelope: &Envelope) -> usize {
        let channels: Vec<(String, Arc<dyn Channel>)> = {
            let tables = self.tables();
            tables
                .channels
                .iter()
                .filter(|((name, _), _)| name == target)
                .map(|((name, _), channel)| (name.clone(), Arc::clone(channel)))
                .collect()
        };
        self.deliver(&channels, envelope).await
    }

    /// Deliver an envelope to every registered process.
    ///
    /// Returns the number of successful deliveries.
    pub async fn broadcast_message(&self, envelope: &Envelope) -> usize {
        let channels: Vec<(String, Arc<dyn Channel>)> = {
            let tables = self.tables();
            tables
                .channels
                .iter()
                .map(|((name, _), channel)| (name.clone(), Arc::clone(channel)))
                .collect()
        };
        self.deliver(&channels, envelope).await
    }

    async fn deliver(
        &self,
        channels: &[(String, Arc<dyn Channel>)],
        envelope: &Envelope,
    ) -> usize {
        let mut delivered = 0;
        for (name, channel) in channels {
            match channel.send(envelope).await {
                Ok(()) => delivered += 1,
                Err(err) => warn!(process = %name, "send failed: {err}"),
            }
        }
        delivered
    }

    /// Register a handler for a command. Handlers for the same command run
    /// in registration order.
    pub fn register_message_handler<F>(&self, command: impl Into<String>, handler: F)
    where
        F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.shared.router.register(command, Arc::new(handler));
    }

    /// Run an envelope through rate limiting, validation, heartbeat
    /// accounting, and the router, exactly as if it had arrived on one of
    /// this supervisor's channels.
    pub fn inject_envelope(&self, envelope: &Envelope) {
        if !self.shared.rate_limiter.check(&envelope.source) {
            warn!(source = %envelope.source, "rate limit exceeded, dropping envelope");
            return;
        }
        if let Err(err) = envelope::validate(envelope) {
            warn!(source = %envelope.source, "invalid envelope dropped: {err}");
            return;
        }
        if envelope.kind == EnvelopeKind::Heartbeat {
            let mut tables = self.tables();
            if let Some(record) = tables.processes.get_mut(&envelope.source) {
                record.last_heartbeat_at = Some(Instant::now());
            }
        }
        // No table lock is held here, so handlers may call back in.
        self.shared.router.dispatch(envelope);
    }

    /// Start the fleet and run the event loop until shutdown.
    pub async fn run(&self) {
        if self.shared.shutdown_started.load(Ordering::Acquire) {
            return;
        }
        self.shared.running.store(true, Ordering::Release);
        self.start_all().await;
        info!("event loop started");

        while self.shared.running.load(Ordering::Acquire) {
            let channels: Vec<(String, Arc<dyn Channel>)> = {
                let tables = self.tables();
                tables
                    .channels
                    .iter()
                    .map(|((name, _), channel)| (name.clone(), Arc::clone(channel)))
                    .collect()
            };

            if channels.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            for (name, channel) in channels {
                if !self.shared.running.load(Ordering::Acquire) {
                    break;
                }
                match channel.receive(SWEEP_RECEIVE_TIMEOUT).await {
                    Ok(Some(envelope)) => self.inject_envelope(&envelope),
                    Ok(None) => {}
                    // Detached stdio (child not started yet) and closed
                    // channels are quiet, not errors worth reporting.
                    Err(ChannelError::NotAttached | ChannelError::Closed) => {}
                    Err(err) => warn!(process = %name, "channel receive failed: {err}"),
                }
            }
            tokio::time::sleep(SWEEP_INTERVAL).await;
        }
        info!("event loop stopped");
    }

    /// Stop everything and clear the tables. Idempotent: the second and
    /// later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shared.shutdown_started.swap(true, Ordering::AcqRel) {
            debug!("shutdown already performed");
            return;
        }
        info!("shutting down supervisor");
        self.shared.running.store(false, Ordering::Release);
        self.stop_all().await;

        // A heartbeat-crashed process can still be alive and holding its
        // handle; take those down before dropping the table.
        let stale: Vec<(String, ChildHandle)> = {
            let mut tables = self.tables();
            tables
                .processes
                .iter_mut()
                .filter_map(|(name, record)| {
                    record.handle.take().map(|handle| (name.clone(), handle))
                })
                .collect()
        };
        for (name, handle) in stale {
            if let Err(err) = adapter::terminate(handle, false).await {
                warn!(process = %name, "failed to terminate stale child: {err}");
            }
        }

        let channels: Vec<Arc<dyn Channel>> = {
            let mut tables = self.tables();
            let channels = tables.channels.drain().map(|(_, channel)| channel).collect();
            tables.processes.clear();
            channels
        };
        for channel in channels {
            channel.close().await;
        }
        info!("supervisor shut down");
    }

    /// Whether the event loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Current lifecycle state of a process, if registered.
    #[must_use]
    pub fn get_process_state(&self, name: &str) -> Option<ProcessState> {
        self.tables().processes.get(name).map(|record| record.state)
    }

    /// Consistent snapshot of every process-table row, sorted by name.
    #[must_use]
    pub fn get_all_processes(&self) -> Vec<ProcessSnapshot> {
        let tables = self.tables();
        let mut rows: Vec<ProcessSnapshot> = tables
            .processes
            .iter()
            .map(|(name, record)| record.snapshot(name))
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Number of registered processes.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.tables().processes.len()
    }

    /// Number of processes currently running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.tables()
            .processes
            .values()
            .filter(|record| record.state.is_running())
            .count()
    }

    /// Human-readable fleet status, one line per process.
    #[must_use]
    pub fn status_report(&self) -> String {
        let mut report = String::new();
        for row in self.get_all_processes() {
            let pid = row
                .pid
                .map_or_else(|| "-".to_string(), |pid| pid.to_string());
            report.push_str(&format!(
                "{}: {} (pid {}, restarts {})",
                row.name, row.state, pid, row.restart_count
            ));
            if let Some(err) = &row.last_error {
                report.push_str(&format!(" [{err}]"));
            }
            report.push('\n');
        }
        report
    }

    fn spawn_monitor(&self, name: String, epoch: u64) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.monitor_loop(name, epoch).await;
        });
    }

    /// Per-process monitor: polls exit status and the heartbeat clock at
    /// 1 Hz, and applies the restart policy on crash. The poll, the state
    /// transition, and the policy read happen in one critical section.
    async fn monitor_loop(&self, name: String, epoch: u64) {
        loop {
            tokio::time::sleep(MONITOR_INTERVAL).await;

            let action = {
                let mut tables = self.tables();
                let Some(record) = tables.processes.get_mut(&name) else {
                    return;
                };
                if record.incarnation != epoch || record.state != ProcessState::Running {
                    return;
                }
                let Some(handle) = record.handle.as_mut() else {
                    return;
                };

                // (reason, whether the child is actually gone)
                let mut failure: Option<(String, bool)> = None;
                match adapter::poll_exit(handle) {
                    Ok(ExitPoll::Running) => {}
                    Ok(ExitPoll::Exited(code)) => {
                        let reason = code.map_or_else(
                            || "terminated by signal".to_string(),
                            |code| format!("exited with code {code}"),
                        );
                        failure = Some((reason, true));
                    }
                    Err(err) => {
                        // Opaque adapter failure: treat as an exit.
                        failure = Some((format!("exit poll failed: {err}"), true));
                    }
                }
                if failure.is_none() && record.config.heartbeat_enabled {
                    if let Some(last) = record.last_heartbeat_at {
                        if last.elapsed() > record.config.heartbeat_timeout {
                            failure = Some(("heartbeat timeout".to_string(), false));
                        }
                    }
                }

                let Some((reason, exited)) = failure else {
                    continue;
                };
                record.state = ProcessState::Crashed;
                record.last_error = Some(reason.clone());
                if exited {
                    // Reaped by the poll; a hung child keeps its handle so
                    // the restart path can terminate it.
                    record.handle = None;
                    record.pid = None;
                }
                warn!(process = %name, "process crashed: {reason}");

                if record.config.auto_restart
                    && record.restart_count < record.config.max_restart_attempts
                {
                    CrashAction::Restart(record.config.restart_delay)
                } else {
                    CrashAction::Terminal
                }
            };

            match action {
                CrashAction::Terminal => {
                    info!(process = %name, "no restart: policy disabled or attempts exhausted");
                    return;
                }
                CrashAction::Restart(delay) => {
                    if self.shared.shutdown_started.load(Ordering::Acquire) {
                        return;
                    }
                    tokio::time::sleep(delay).await;
                    match self.restart_process(&name).await {
                        // The restarted incarnation runs under a fresh
                        // monitor task.
                        Ok(()) => return,
                        Err(err) => {
                            error!(process = %name, "restart failed: {err}");
                            return;
                        }
                    }
                }
            }
        }
    }
}
