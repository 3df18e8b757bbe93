//! Mount interface
//!
//! The guiding loop needs three things from a mount: where it points, whether
//! it tracks, and a way to nudge it by a small angular offset.

use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// Mount pointing and tracking state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MountStatus {
    /// Right ascension (J2000), hours
    pub ra_j2000_hours: f64,
    /// Declination (J2000), degrees
    pub dec_j2000_degs: f64,
    pub is_tracking: bool,
}

/// A small pointing correction, in arcseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MountOffset {
    pub ra_arcsec: f64,
    pub dec_arcsec: f64,
}

impl MountOffset {
    pub fn is_zero(&self) -> bool {
        self.ra_arcsec == 0.0 && self.dec_arcsec == 0.0
    }
}

impl std::fmt::Display for MountOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ra {:+.2}\", dec {:+.2}\"", self.ra_arcsec, self.dec_arcsec)
    }
}

#[async_trait]
pub trait MountDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn status(&self) -> DeviceResult<MountStatus>;

    async fn set_tracking(&self, enabled: bool) -> DeviceResult<()>;

    /// Apply a relative pointing offset
    async fn offset(&self, offset: MountOffset) -> DeviceResult<()>;
}

#[derive(Debug)]
struct SimulatedMountState {
    ra_hours: f64,
    dec_degs: f64,
    tracking: bool,
    offsets: Vec<MountOffset>,
    fail_offsets: bool,
    fail_status: bool,
}

/// In-memory mount that records every applied offset
#[derive(Debug)]
pub struct SimulatedMount {
    name: String,
    state: Mutex<SimulatedMountState>,
}

impl SimulatedMount {
    pub fn new(name: impl Into<String>, ra_hours: f64, dec_degs: f64) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SimulatedMountState {
                ra_hours,
                dec_degs,
                tracking: false,
                offsets: Vec::new(),
                fail_offsets: false,
                fail_status: false,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimulatedMountState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offsets applied so far, oldest first
    pub fn offsets(&self) -> Vec<MountOffset> {
        self.state().offsets.clone()
    }

    pub fn is_tracking(&self) -> bool {
        self.state().tracking
    }

    /// Make subsequent offset commands fail
    pub fn set_fail_offsets(&self, fail: bool) {
        self.state().fail_offsets = fail;
    }

    /// Make subsequent status reads fail
    pub fn set_fail_status(&self, fail: bool) {
        self.state().fail_status = fail;
    }
}

impl Default for SimulatedMount {
    fn default() -> Self {
        Self::new("mount", 10.0, 20.0)
    }
}

#[async_trait]
impl MountDriver for SimulatedMount {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> DeviceResult<MountStatus> {
        let state = self.state();
        if state.fail_status {
            return Err(DeviceError::driver(&self.name, "status", "simulated status failure"));
        }
        Ok(MountStatus {
            ra_j2000_hours: state.ra_hours,
            dec_j2000_degs: state.dec_degs,
            is_tracking: state.tracking,
        })
    }

    async fn set_tracking(&self, enabled: bool) -> DeviceResult<()> {
        self.state().tracking = enabled;
        tracing::info!("{}: tracking = {}", self.name, enabled);
        Ok(())
    }

    async fn offset(&self, offset: MountOffset) -> DeviceResult<()> {
        let mut state = self.state();
        if state.fail_offsets {
            return Err(DeviceError::driver(&self.name, "offset", "simulated offset failure"));
        }
        // Pointing is left alone: the next solve should report the same drift
        state.offsets.push(offset);
        tracing::info!("{}: offset applied ({})", self.name, offset);
        Ok(())
    }
}
