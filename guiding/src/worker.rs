//! Solving worker process supervision
//!
//! The worker is a separate process that shares no address space with the
//! coordinator. It is found by an identity substring in its process name or
//! command line, stale instances are terminated before a fresh launch, and
//! the launched child is owned (and terminated) by the coordinator.

use crate::config::WorkerConfig;
use crate::error::{GuidingError, GuidingResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Where a worker finds the coordinator and the shared image buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub address: SocketAddr,
    pub buffer_dir: PathBuf,
    pub buffer_name: String,
}

impl WorkerEndpoint {
    /// Command-line arguments understood by `mast-solver-sim`
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--connect".to_string(),
            self.address.to_string(),
            "--buffer".to_string(),
            self.buffer_name.clone(),
            "--buffer-dir".to_string(),
            self.buffer_dir.display().to_string(),
        ]
    }
}

/// Starts and stops the solving worker
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Make sure a worker is running that will connect to `endpoint`
    async fn launch(&self, endpoint: &WorkerEndpoint) -> GuidingResult<()>;

    /// Stop the worker started by `launch`; a no-op when none is running
    async fn terminate(&self) -> GuidingResult<()>;

    /// Whether a worker this launcher started is alive. Always false for a
    /// worker it does not own. Reported in the guiding status.
    async fn is_running(&self) -> bool;
}

/// A process matching a worker identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcess {
    pub pid: u32,
    pub name: String,
    pub command_line: String,
}

fn process_table() -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    system
}

/// Processes whose name or command line contains `identity`, excluding this one
pub fn find_processes(identity: &str) -> Vec<WorkerProcess> {
    if identity.is_empty() {
        return Vec::new();
    }
    let own_pid = sysinfo::get_current_pid().ok();
    let system = process_table();

    let mut found: Vec<WorkerProcess> = system
        .processes()
        .iter()
        .filter(|(pid, _)| Some(**pid) != own_pid)
        .filter_map(|(pid, process)| {
            let name = process.name().to_string_lossy().into_owned();
            let command_line = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            (name.contains(identity) || command_line.contains(identity)).then(|| WorkerProcess {
                pid: pid.as_u32(),
                name,
                command_line,
            })
        })
        .collect();
    found.sort_by_key(|p| p.pid);
    found
}

/// Kill every process matching `identity`; returns how many were signalled
pub fn terminate_matching(identity: &str) -> usize {
    let matches = find_processes(identity);
    if matches.is_empty() {
        return 0;
    }

    let system = process_table();
    let mut killed = 0;
    for worker in matches {
        if let Some(process) = system.process(Pid::from_u32(worker.pid)) {
            if process.kill() {
                tracing::info!(
                    "worker: terminated stale process {} ({})",
                    worker.pid,
                    worker.name
                );
                killed += 1;
            } else {
                tracing::warn!("worker: failed to terminate process {}", worker.pid);
            }
        }
    }
    killed
}

/// Launches the worker as a child process
pub struct ProcessWorker {
    config: WorkerConfig,
    child: Mutex<Option<Child>>,
}

impl ProcessWorker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }
}

#[async_trait]
impl WorkerLauncher for ProcessWorker {
    async fn launch(&self, endpoint: &WorkerEndpoint) -> GuidingResult<()> {
        let program = self.config.program.clone().ok_or_else(|| {
            GuidingError::Config("worker.program is not set; cannot launch a worker".to_string())
        })?;

        let mut child = self.child.lock().await;
        if let Some(mut previous) = child.take() {
            let _ = previous.start_kill();
            let _ = previous.wait().await;
        }

        if self.config.terminate_stale {
            let identity = self.config.identity.clone();
            let killed = tokio::task::spawn_blocking(move || terminate_matching(&identity))
                .await
                .map_err(|e| GuidingError::WorkerUnreachable(format!("process scan failed: {}", e)))?;
            if killed > 0 {
                tracing::info!("worker: terminated {} stale worker(s)", killed);
            }
        }

        let spawned = Command::new(&program)
            .args(&self.config.args)
            .args(endpoint.to_args())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GuidingError::WorkerUnreachable(format!("failed to launch {:?}: {}", program, e))
            })?;

        tracing::info!(
            "worker: launched {:?} (pid {:?}) for {}",
            program,
            spawned.id(),
            endpoint.address
        );
        *child = Some(spawned);
        Ok(())
    }

    async fn terminate(&self) -> GuidingResult<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        let pid = child.id();

        if let Ok(Some(status)) = child.try_wait() {
            tracing::info!("worker: process {:?} already exited ({})", pid, status);
            return Ok(());
        }

        child
            .start_kill()
            .map_err(|e| GuidingError::WorkerUnreachable(format!("failed to kill worker: {}", e)))?;
        match tokio::time::timeout(self.config.terminate_timeout(), child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("worker: process {:?} terminated ({})", pid, status);
                Ok(())
            }
            Ok(Err(e)) => Err(GuidingError::WorkerUnreachable(format!(
                "failed to reap worker: {}",
                e
            ))),
            Err(_) => Err(GuidingError::WorkerUnreachable(format!(
                "worker {:?} did not exit within {:?}",
                pid,
                self.config.terminate_timeout()
            ))),
        }
    }

    async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Launcher for a worker started outside this process
#[derive(Debug, Default)]
pub struct ExternalWorker;

#[async_trait]
impl WorkerLauncher for ExternalWorker {
    async fn launch(&self, endpoint: &WorkerEndpoint) -> GuidingResult<()> {
        tracing::info!(
            "worker: waiting for an external worker to connect to {} (buffer '{}')",
            endpoint.address,
            endpoint.buffer_name
        );
        Ok(())
    }

    async fn terminate(&self) -> GuidingResult<()> {
        Ok(())
    }

    async fn is_running(&self) -> bool {
        false
    }
}
