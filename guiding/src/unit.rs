//! MAST unit
//!
//! A unit is the aggregate device: one guide camera, one mount and the guiding
//! coordinator that drives them. It carries its own activity set for the
//! umbrella operations (StartingUp, ShuttingDown, Guiding, Autofocusing) and
//! its own poller, which ends StartingUp/ShuttingDown once the camera's
//! corresponding activities have ended.

use crate::config::GuidingConfig;
use crate::coordinator::{GuidingCoordinator, GuidingStatus};
use crate::error::{GuidingError, GuidingResult};
use crate::worker::WorkerLauncher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mast_device::{
    Activity, ActivityTracker, Camera, CameraActivity, CameraConfig, CameraDriver, CameraStatus, CommandOutcome,
    DevicePoller, DeviceResult, MountDriver, MountStatus, Pollable, PollerConfig, PollerHealthSnapshot,
    ReportableError,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// Long-running unit activities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitActivity {
    Autofocusing,
    Guiding,
    StartingUp,
    ShuttingDown,
}

impl Activity for UnitActivity {
    fn name(&self) -> &'static str {
        match self {
            UnitActivity::Autofocusing => "Autofocusing",
            UnitActivity::Guiding => "Guiding",
            UnitActivity::StartingUp => "StartingUp",
            UnitActivity::ShuttingDown => "ShuttingDown",
        }
    }
}

/// Unit configuration, as loaded from the unit's JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    pub name: String,
    pub camera: CameraConfig,
    /// Cadence of the unit's own poller
    pub poller: PollerConfig,
    pub guiding: GuidingConfig,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            name: "mast00".to_string(),
            camera: CameraConfig::default(),
            poller: PollerConfig::for_unit(),
            guiding: GuidingConfig::default(),
        }
    }
}

/// Unit status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitStatus {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub activities: Vec<String>,
    pub is_operational: bool,
    pub reasons: Vec<String>,
    pub camera: CameraStatus,
    pub mount: Option<MountStatus>,
    pub guiding: GuidingStatus,
    pub pollers: Vec<PollerHealthSnapshot>,
}

/// Envelope returned by unit commands
pub type UnitOutcome = CommandOutcome<UnitStatus>;

/// What the unit poller looks at on each tick
struct UnitPollTarget {
    name: String,
    camera: Arc<Camera>,
    activities: Arc<ActivityTracker<UnitActivity>>,
}

impl UnitPollTarget {
    fn follow(&self, unit_activity: UnitActivity, camera_activity: CameraActivity) {
        if self.activities.is_active(unit_activity) && !self.camera.is_active(camera_activity) {
            if let Some(done) = self.activities.end_if_active(unit_activity) {
                tracing::info!(
                    "{}: {} complete ({:.1}s)",
                    self.name,
                    unit_activity.name(),
                    done.duration.as_secs_f64()
                );
            }
        }
    }
}

#[async_trait]
impl Pollable for UnitPollTarget {
    fn poll_name(&self) -> String {
        self.name.clone()
    }

    async fn poll(&self) -> DeviceResult<()> {
        self.follow(UnitActivity::StartingUp, CameraActivity::StartingUp);
        self.follow(UnitActivity::ShuttingDown, CameraActivity::ShuttingDown);
        Ok(())
    }
}

pub struct Unit {
    config: UnitConfig,
    camera: Arc<Camera>,
    mount: Arc<dyn MountDriver>,
    activities: Arc<ActivityTracker<UnitActivity>>,
    coordinator: Arc<GuidingCoordinator>,
    pollers: Mutex<Vec<DevicePoller>>,
}

impl Unit {
    pub fn new(
        config: UnitConfig,
        driver: Box<dyn CameraDriver>,
        mount: Arc<dyn MountDriver>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> GuidingResult<Self> {
        let camera = Arc::new(Camera::new(config.camera.clone(), driver));
        let activities = Arc::new(ActivityTracker::new(config.name.clone()));
        let coordinator = Arc::new(GuidingCoordinator::new(
            config.guiding.clone(),
            camera.clone(),
            mount.clone(),
            launcher,
            activities.clone(),
        )?);
        Ok(Self {
            config,
            camera,
            mount,
            activities,
            coordinator,
            pollers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    pub fn camera(&self) -> &Arc<Camera> {
        &self.camera
    }

    pub fn mount(&self) -> &Arc<dyn MountDriver> {
        &self.mount
    }

    pub fn activities(&self) -> &ActivityTracker<UnitActivity> {
        &self.activities
    }

    pub fn is_active(&self, activity: UnitActivity) -> bool {
        self.activities.is_active(activity)
    }

    pub fn coordinator(&self) -> &Arc<GuidingCoordinator> {
        &self.coordinator
    }

    fn pollers(&self) -> std::sync::MutexGuard<'_, Vec<DevicePoller>> {
        self.pollers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Lifespan
    // =========================================================================

    /// Start the camera and unit pollers. Calling it again is a no-op.
    pub fn start_lifespan(&self) {
        let mut pollers = self.pollers();
        if !pollers.is_empty() {
            return;
        }
        pollers.push(DevicePoller::spawn(self.camera.clone(), self.config.camera.poller.clone()));
        pollers.push(DevicePoller::spawn(
            Arc::new(UnitPollTarget {
                name: self.config.name.clone(),
                camera: self.camera.clone(),
                activities: self.activities.clone(),
            }),
            self.config.poller.clone(),
        ));
        tracing::info!("{}: lifespan started", self.config.name);
    }

    /// Stop guiding, stop the pollers and remove the shared image buffer
    pub async fn end_lifespan(&self) {
        self.coordinator.stop_and_wait().await;
        let pollers: Vec<DevicePoller> = self.pollers().drain(..).collect();
        for poller in pollers {
            poller.stop().await;
        }
        self.coordinator.release_buffer();
        tracing::info!("{}: lifespan ended", self.config.name);
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub async fn try_connect(&self) -> DeviceResult<()> {
        self.camera.try_connect().await
    }

    /// Disconnect the camera; a running guiding session is stopped first
    pub async fn try_disconnect(&self) -> DeviceResult<()> {
        if self.coordinator.is_guiding() {
            tracing::info!("{}: stopping guiding before disconnect", self.config.name);
        }
        // Also waits out a session that was stopped but is still ending
        self.coordinator.stop_and_wait().await;
        self.camera.try_disconnect().await
    }

    /// Start the camera; StartingUp stays active while the camera cools
    pub async fn try_startup(&self) -> DeviceResult<()> {
        if self.activities.is_active(UnitActivity::StartingUp) {
            return Err(mast_device::ActivityError::Duplicate {
                device: self.config.name.clone(),
                activity: UnitActivity::StartingUp.name().to_string(),
            }
            .into());
        }
        self.camera.try_startup().await?;
        if self.camera.is_active(CameraActivity::StartingUp) {
            self.activities.start(UnitActivity::StartingUp)?;
        } else {
            tracing::info!("{}: startup complete", self.config.name);
        }
        Ok(())
    }

    /// Stop guiding and warm the camera; ShuttingDown stays active while it warms
    pub async fn try_shutdown(&self) -> DeviceResult<()> {
        if self.activities.is_active(UnitActivity::ShuttingDown) {
            return Err(mast_device::ActivityError::Duplicate {
                device: self.config.name.clone(),
                activity: UnitActivity::ShuttingDown.name().to_string(),
            }
            .into());
        }
        self.coordinator.stop_and_wait().await;
        self.activities.end_if_active(UnitActivity::StartingUp);

        self.camera.try_shutdown().await?;
        if self.camera.is_active(CameraActivity::ShuttingDown) {
            self.activities.start(UnitActivity::ShuttingDown)?;
        } else {
            tracing::info!("{}: shutdown complete", self.config.name);
        }
        Ok(())
    }

    pub async fn try_start_guiding(&self) -> GuidingResult<()> {
        self.coordinator.start().await
    }

    pub fn try_stop_guiding(&self) -> GuidingResult<()> {
        self.coordinator.stop();
        Ok(())
    }

    pub async fn status(&self) -> UnitStatus {
        let camera = self.camera.status().await;
        let mount = self.mount.status().await.ok();
        let guiding = self.coordinator.status().await;
        let pollers: Vec<PollerHealthSnapshot> = self.pollers().iter().map(|p| p.health().snapshot()).collect();

        let mut reasons: Vec<String> = camera.reasons.iter().map(|r| format!("camera: {}", r)).collect();
        if mount.is_none() {
            reasons.push("mount: status unavailable".to_string());
        }
        for poller in pollers.iter().filter(|p| !p.alive) {
            reasons.push(format!("poller {}: not responding", poller.name));
        }

        UnitStatus {
            timestamp: Utc::now(),
            name: self.config.name.clone(),
            activities: self.activities.names(),
            is_operational: reasons.is_empty(),
            reasons,
            camera,
            mount,
            guiding,
            pollers,
        }
    }

    // =========================================================================
    // Command envelopes
    // =========================================================================

    async fn outcome<T: Serialize, E: ReportableError>(&self, result: Result<T, E>) -> UnitOutcome {
        CommandOutcome::from_result(result, self.status().await)
    }

    pub async fn connect(&self) -> UnitOutcome {
        let result = self.try_connect().await;
        self.outcome(result).await
    }

    pub async fn disconnect(&self) -> UnitOutcome {
        let result = self.try_disconnect().await;
        self.outcome(result).await
    }

    pub async fn start_exposure(&self, seconds: f64) -> UnitOutcome {
        let result = self.camera.try_start_exposure(seconds).await;
        self.outcome(result).await
    }

    pub async fn abort_exposure(&self) -> UnitOutcome {
        let result = self.camera.try_abort_exposure().await;
        self.outcome(result).await
    }

    pub async fn stop_exposure(&self) -> UnitOutcome {
        let result = self.camera.try_stop_exposure().await;
        self.outcome(result).await
    }

    pub async fn startup(&self) -> UnitOutcome {
        let result = self.try_startup().await;
        self.outcome(result).await
    }

    pub async fn shutdown(&self) -> UnitOutcome {
        let result = self.try_shutdown().await;
        self.outcome(result).await
    }

    pub async fn start_guiding(&self) -> UnitOutcome {
        let result = self.try_start_guiding().await;
        self.outcome(result).await
    }

    pub async fn stop_guiding(&self) -> UnitOutcome {
        let result = self.try_stop_guiding();
        self.outcome(result).await
    }

    /// Status as an envelope, for the command surface
    pub async fn status_outcome(&self) -> UnitOutcome {
        self.outcome(Ok::<(), GuidingError>(())).await
    }
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("name", &self.config.name)
            .field("activities", &self.activities.active())
            .field("camera", &self.camera)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::worker::ExternalWorker;
    use mast_device::{ErrorKind, SimulatedCamera, SimulatedCameraConfig, SimulatedMount};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    fn test_unit(sim: SimulatedCameraConfig, dir: &std::path::Path) -> Unit {
        let config = UnitConfig {
            camera: CameraConfig {
                poller: PollerConfig::with_interval(Duration::from_millis(10)),
                ..CameraConfig::default()
            },
            poller: PollerConfig::with_interval(Duration::from_millis(10)),
            guiding: GuidingConfig {
                check_interval_ms: 10,
                handshake_timeout_ms: 100,
                worker: WorkerConfig {
                    buffer_dir: Some(dir.to_path_buf()),
                    ..WorkerConfig::default()
                },
                ..GuidingConfig::default()
            },
            ..UnitConfig::default()
        };
        Unit::new(
            config,
            Box::new(SimulatedCamera::new(sim)),
            Arc::new(SimulatedMount::default()),
            Arc::new(ExternalWorker),
        )
        .unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_startup_follows_camera() {
        let dir = tempfile::tempdir().unwrap();
        let unit = test_unit(SimulatedCameraConfig::for_tests(), dir.path());
        unit.start_lifespan();

        let outcome = unit.startup().await;
        assert!(outcome.is_ok(), "{:?}", outcome.error);
        assert!(unit.is_active(UnitActivity::StartingUp));
        assert!(outcome.status.activities.contains(&"StartingUp".to_string()));

        assert!(wait_until(|| !unit.is_active(UnitActivity::StartingUp), Duration::from_secs(5)).await);
        assert!(!unit.camera().is_active(CameraActivity::StartingUp));

        // A second startup finds the camera at set-point and completes at once
        let outcome = unit.startup().await;
        assert!(outcome.is_ok());
        assert!(!unit.is_active(UnitActivity::StartingUp));
        unit.end_lifespan().await;
    }

    #[tokio::test]
    async fn test_shutdown_follows_camera() {
        let dir = tempfile::tempdir().unwrap();
        let unit = test_unit(SimulatedCameraConfig::for_tests(), dir.path());
        unit.start_lifespan();
        unit.try_startup().await.unwrap();
        assert!(wait_until(|| !unit.is_active(UnitActivity::StartingUp), Duration::from_secs(5)).await);

        unit.try_shutdown().await.unwrap();
        assert!(unit.is_active(UnitActivity::ShuttingDown));
        assert!(wait_until(|| !unit.is_active(UnitActivity::ShuttingDown), Duration::from_secs(5)).await);
        unit.end_lifespan().await;
    }

    #[tokio::test]
    async fn test_commands_report_status() {
        let dir = tempfile::tempdir().unwrap();
        let unit = test_unit(SimulatedCameraConfig::for_tests(), dir.path());

        let outcome = unit.start_exposure(1.0).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::NotConnected));
        assert!(!outcome.status.camera.is_connected);
        assert_eq!(outcome.status.activities, vec!["Idle".to_string()]);

        let outcome = unit.connect().await;
        assert!(outcome.is_ok());
        assert!(outcome.status.camera.is_connected);
        assert!(outcome.status.mount.is_some());

        let outcome = unit.status_outcome().await;
        assert!(outcome.error.is_none());
        assert!(outcome.result.is_none());
    }

    #[tokio::test]
    async fn test_stop_guiding_while_idle_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let unit = test_unit(SimulatedCameraConfig::for_tests(), dir.path());

        let outcome = unit.stop_guiding().await;
        assert!(outcome.is_ok());
        assert!(!outcome.status.guiding.is_guiding);
    }

    #[tokio::test]
    async fn test_guiding_without_worker_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let unit = test_unit(SimulatedCameraConfig::for_tests(), dir.path());
        unit.start_lifespan();

        let outcome = unit.start_guiding().await;
        assert!(outcome.is_ok());
        let report = unit.coordinator().wait().await.unwrap();
        assert!(matches!(
            report.end_reason,
            Some(crate::coordinator::EndReason::Failed {
                kind: ErrorKind::WorkerUnreachable,
                ..
            })
        ));
        assert!(!unit.is_active(UnitActivity::Guiding));
        unit.end_lifespan().await;
    }

    #[tokio::test]
    async fn test_lifespan_pollers() {
        let dir = tempfile::tempdir().unwrap();
        let unit = test_unit(SimulatedCameraConfig::for_tests(), dir.path());
        unit.start_lifespan();
        unit.start_lifespan();
        assert_eq!(unit.status().await.pollers.len(), 2);

        unit.end_lifespan().await;
        assert!(unit.status().await.pollers.is_empty());
    }
}
