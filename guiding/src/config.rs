//! Guiding and worker configuration

use crate::buffer::{default_buffer_dir, DEFAULT_BUFFER_NAME};
use crate::correction::RequestSkew;
use crate::error::{GuidingError, GuidingResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest allowed gap between cancellation checks
pub const MAX_CHECK_INTERVAL_MS: u64 = 2000;

/// How the solving worker is found, launched and reached
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address the coordinator listens on (port 0 picks a free port)
    pub listen_address: String,
    /// Substring identifying worker processes by name or command line
    pub identity: String,
    /// Worker executable; `None` means the worker is started externally
    pub program: Option<PathBuf>,
    /// Extra arguments placed before the endpoint arguments
    pub args: Vec<String>,
    /// Terminate matching processes before launching a fresh worker
    pub terminate_stale: bool,
    /// Logical name of the shared image buffer
    pub buffer_name: String,
    /// Directory backing shared buffers (platform default when unset)
    pub buffer_dir: Option<PathBuf>,
    pub terminate_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:0".to_string(),
            identity: "mast-solver-sim".to_string(),
            program: None,
            args: Vec::new(),
            terminate_stale: true,
            buffer_name: DEFAULT_BUFFER_NAME.to_string(),
            buffer_dir: None,
            terminate_timeout_ms: 5000,
        }
    }
}

impl WorkerConfig {
    pub fn buffer_dir(&self) -> PathBuf {
        self.buffer_dir.clone().unwrap_or_else(default_buffer_dir)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

/// Guide loop timings and policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidingConfig {
    /// Guide exposure length
    pub exposure_secs: f64,
    /// Pause between the end of one cycle and the next exposure
    pub inter_cycle_ms: u64,
    /// Cancellation re-check interval for every blocking wait
    pub check_interval_ms: u64,
    /// Grace period beyond the exposure length before the exposure is
    /// considered lost
    pub exposure_timeout_margin_ms: u64,
    /// Wait for the worker to connect and say hello
    pub handshake_timeout_ms: u64,
    /// Wait for the worker to acknowledge a new image
    pub ack_timeout_ms: u64,
    /// Wait for a solve response
    pub solve_timeout_ms: u64,
    /// Session ends after more consecutive timeouts than this
    pub max_consecutive_timeouts: u32,
    /// Turn tracking on for the session and restore it afterwards
    pub manage_tracking: bool,
    pub request_skew: Option<RequestSkew>,
    pub worker: WorkerConfig,
}

impl Default for GuidingConfig {
    fn default() -> Self {
        Self {
            exposure_secs: 5.0,
            inter_cycle_ms: 30_000,
            check_interval_ms: 1000,
            exposure_timeout_margin_ms: 30_000,
            handshake_timeout_ms: 30_000,
            ack_timeout_ms: 10_000,
            solve_timeout_ms: 60_000,
            max_consecutive_timeouts: 3,
            manage_tracking: true,
            request_skew: None,
            worker: WorkerConfig::default(),
        }
    }
}

impl GuidingConfig {
    pub fn validate(&self) -> GuidingResult<()> {
        if let Err(e) = mast_device::exposure_duration(self.exposure_secs) {
            return Err(GuidingError::Config(format!("exposure_secs: {}", e)));
        }
        if self.check_interval_ms == 0 || self.check_interval_ms > MAX_CHECK_INTERVAL_MS {
            return Err(GuidingError::Config(format!(
                "check_interval_ms must be between 1 and {}, got {}",
                MAX_CHECK_INTERVAL_MS, self.check_interval_ms
            )));
        }
        if self.handshake_timeout_ms == 0 || self.ack_timeout_ms == 0 || self.solve_timeout_ms == 0 {
            return Err(GuidingError::Config("timeouts must be non-zero".to_string()));
        }
        if self.worker.buffer_name.is_empty() {
            return Err(GuidingError::Config("worker.buffer_name is empty".to_string()));
        }
        Ok(())
    }

    /// Guide exposure length; zero when `exposure_secs` does not validate
    pub fn exposure(&self) -> Duration {
        mast_device::exposure_duration(self.exposure_secs).unwrap_or_default()
    }

    pub fn inter_cycle(&self) -> Duration {
        Duration::from_millis(self.inter_cycle_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Longest an exposure may take before it is declared lost
    pub fn exposure_deadline(&self) -> Duration {
        self.exposure() + Duration::from_millis(self.exposure_timeout_margin_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn solve_timeout(&self) -> Duration {
        Duration::from_millis(self.solve_timeout_ms)
    }
}
