//! Camera controller
//!
//! [`Camera`] is the device façade over a [`CameraDriver`]: it owns the driver
//! handle, the camera's [`ActivityTracker`], and the cached sensor geometry and
//! last image. Long-running operations (exposures, cooldown, warmup) only
//! *begin* here; their completion is detected by [`Camera::poll`], which the
//! device poller calls once per second.
//!
//! Every mutating command exists twice: a `try_*` method returning a plain
//! [`DeviceResult`] for internal callers, and an envelope method returning a
//! [`CameraOutcome`] (result, error, status snapshot) for the command surface.

use super::driver::{
    CameraCapabilities, CameraDriver, CameraState, DriverInfo, DriverResult, ImageFrame, ImageGeometry,
    SensorInfo,
};
use super::status::{operational_reasons, CameraStatus};
use crate::activity::{Activity, ActivityTracker};
use crate::envelope::CommandOutcome;
use crate::error::{DeviceError, DeviceResult};
use crate::poller::{Pollable, PollerConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;

/// Envelope returned by camera commands
pub type CameraOutcome = CommandOutcome<CameraStatus>;

/// Longest exposure the controller accepts, in seconds
pub const MAX_EXPOSURE_SECS: f64 = 86_400.0;

/// Validate an exposure length and convert it to a [`Duration`]
pub fn exposure_duration(seconds: f64) -> DeviceResult<Duration> {
    if !(0.0..=MAX_EXPOSURE_SECS).contains(&seconds) {
        return Err(DeviceError::InvalidParameter(format!(
            "exposure duration must be between 0 and {} seconds, got {}",
            MAX_EXPOSURE_SECS, seconds
        )));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| DeviceError::InvalidParameter(format!("exposure duration {}: {}", seconds, e)))
}

/// Long-running camera activities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraActivity {
    StartingUp,
    CoolingDown,
    Exposing,
    ReadingOut,
    WarmingUp,
    ShuttingDown,
}

impl Activity for CameraActivity {
    fn name(&self) -> &'static str {
        match self {
            CameraActivity::StartingUp => "StartingUp",
            CameraActivity::CoolingDown => "CoolingDown",
            CameraActivity::Exposing => "Exposing",
            CameraActivity::ReadingOut => "ReadingOut",
            CameraActivity::WarmingUp => "WarmingUp",
            CameraActivity::ShuttingDown => "ShuttingDown",
        }
    }
}

impl CameraActivity {
    pub const ALL: [CameraActivity; 6] = [
        CameraActivity::StartingUp,
        CameraActivity::CoolingDown,
        CameraActivity::Exposing,
        CameraActivity::ReadingOut,
        CameraActivity::WarmingUp,
        CameraActivity::ShuttingDown,
    ];
}

/// Camera controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device name used in logs, errors and status
    pub name: String,
    /// Sensor temperature for normal operation (°C)
    pub operational_set_point: f64,
    /// Sensor temperature before the cooler is turned off (°C)
    pub warm_set_point: f64,
    /// Allowed deviation from the operational set-point (°C)
    pub temperature_tolerance: f64,
    pub poller: PollerConfig,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: "camera".to_string(),
            operational_set_point: -25.0,
            warm_set_point: 5.0,
            temperature_tolerance: 0.5,
            poller: PollerConfig::for_camera(),
        }
    }
}

fn locked<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Camera {
    config: CameraConfig,
    driver: Mutex<Box<dyn CameraDriver>>,
    info: DriverInfo,
    capabilities: CameraCapabilities,
    activities: ActivityTracker<CameraActivity>,
    powered: AtomicBool,
    sensor: StdMutex<Option<SensorInfo>>,
    image: StdMutex<Option<Arc<ImageFrame>>>,
    last_state: StdMutex<Option<CameraState>>,
}

impl Camera {
    pub fn new(config: CameraConfig, driver: Box<dyn CameraDriver>) -> Self {
        let info = driver.info();
        let capabilities = driver.capabilities();
        Self {
            activities: ActivityTracker::new(config.name.clone()),
            config,
            driver: Mutex::new(driver),
            info,
            capabilities,
            powered: AtomicBool::new(true),
            sensor: StdMutex::new(None),
            image: StdMutex::new(None),
            last_state: StdMutex::new(None),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn driver_info(&self) -> &DriverInfo {
        &self.info
    }

    pub fn capabilities(&self) -> CameraCapabilities {
        self.capabilities
    }

    pub fn activities(&self) -> &ActivityTracker<CameraActivity> {
        &self.activities
    }

    pub fn is_active(&self, activity: CameraActivity) -> bool {
        self.activities.is_active(activity)
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::Acquire)
    }

    /// Record the camera's power state (the power switch itself is external)
    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::Release);
        tracing::info!("{}: powered = {}", self.config.name, powered);
    }

    pub async fn is_connected(&self) -> bool {
        self.driver.lock().await.is_connected()
    }

    /// Sensor information cached at connect time
    pub fn sensor(&self) -> Option<SensorInfo> {
        *locked(&self.sensor)
    }

    pub fn geometry(&self) -> Option<ImageGeometry> {
        self.sensor().map(|s| s.geometry)
    }

    /// The last image retrieved by the poller, if any
    pub fn image(&self) -> Option<Arc<ImageFrame>> {
        locked(&self.image).clone()
    }

    /// Take the last image, leaving none cached
    pub fn take_image(&self) -> Option<Arc<ImageFrame>> {
        locked(&self.image).take()
    }

    /// Hardware state observed by the most recent poll
    pub fn last_state(&self) -> Option<CameraState> {
        *locked(&self.last_state)
    }

    fn fault<'a>(&'a self, operation: &'a str) -> impl FnOnce(String) -> DeviceError + 'a {
        move |message| DeviceError::driver(&self.config.name, operation, message)
    }

    fn not_connected(&self) -> DeviceError {
        DeviceError::NotConnected(self.config.name.clone())
    }

    /// Connected and able to regulate temperature
    fn check_thermal_control(&self, driver: &dyn CameraDriver, operation: &str) -> DeviceResult<()> {
        if !driver.is_connected() {
            return Err(self.not_connected());
        }
        if !self.capabilities.can_set_ccd_temperature {
            return Err(DeviceError::NotSupported {
                device: self.config.name.clone(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Connection
    // =========================================================================

    pub async fn try_connect(&self) -> DeviceResult<()> {
        if !self.is_powered() {
            return Err(DeviceError::NotPowered(self.config.name.clone()));
        }

        let mut driver = self.driver.lock().await;
        if !driver.is_connected() {
            driver.set_connected(true).await.map_err(self.fault("connect"))?;
        }
        let sensor = driver.sensor_info().await.map_err(self.fault("sensor_info"))?;
        drop(driver);

        let (fov_x, fov_y) = sensor.field_of_view_rad();
        *locked(&self.sensor) = Some(sensor);
        tracing::info!(
            "{}: connected = true (sensor {}, field {:.6} x {:.6} rad)",
            self.config.name,
            sensor.geometry,
            fov_x,
            fov_y
        );
        Ok(())
    }

    pub async fn try_disconnect(&self) -> DeviceResult<()> {
        let mut driver = self.driver.lock().await;
        if !driver.is_connected() {
            return Ok(());
        }
        driver.set_connected(false).await.map_err(self.fault("disconnect"))?;
        drop(driver);

        *locked(&self.last_state) = None;
        // Nothing can complete these once the driver is gone
        for activity in self.activities.active() {
            tracing::warn!(
                "{}: ending {} on disconnect",
                self.config.name,
                activity.name()
            );
            self.activities.end_if_active(activity);
        }
        tracing::info!("{}: connected = false", self.config.name);
        Ok(())
    }

    // =========================================================================
    // Exposure
    // =========================================================================

    pub async fn try_start_exposure(&self, seconds: f64) -> DeviceResult<()> {
        exposure_duration(seconds)?;

        let mut driver = self.driver.lock().await;
        if !driver.is_connected() {
            return Err(self.not_connected());
        }

        self.activities.start(CameraActivity::Exposing)?;
        *locked(&self.image) = None;
        if let Err(e) = driver.start_exposure(seconds, true).await {
            self.activities.end_if_active(CameraActivity::Exposing);
            return Err(self.fault("start_exposure")(e));
        }
        tracing::info!("{}: exposure started ({:.2}s)", self.config.name, seconds);
        Ok(())
    }

    /// Abort the current exposure without readout
    pub async fn try_abort_exposure(&self) -> DeviceResult<()> {
        let mut driver = self.driver.lock().await;
        if !driver.is_connected() {
            return Err(self.not_connected());
        }
        if !self.capabilities.can_abort_exposure {
            return Err(DeviceError::NotSupported {
                device: self.config.name.clone(),
                operation: "abort_exposure".to_string(),
            });
        }

        let result = driver.abort_exposure().await.map_err(self.fault("abort_exposure"));
        self.activities.end_if_active(CameraActivity::Exposing);
        self.activities.end_if_active(CameraActivity::ReadingOut);
        result?;
        tracing::info!("{}: exposure aborted", self.config.name);
        Ok(())
    }

    /// Stop the current exposure early; the collected image is still read out
    pub async fn try_stop_exposure(&self) -> DeviceResult<()> {
        let mut driver = self.driver.lock().await;
        if !driver.is_connected() {
            return Err(self.not_connected());
        }
        if !self.activities.is_active(CameraActivity::Exposing) {
            tracing::debug!("{}: stop_exposure with no exposure in progress", self.config.name);
            return Ok(());
        }
        if !self.capabilities.can_stop_exposure {
            return Err(DeviceError::NotSupported {
                device: self.config.name.clone(),
                operation: "stop_exposure".to_string(),
            });
        }

        driver.stop_exposure().await.map_err(self.fault("stop_exposure"))?;
        let _ = self.activities.start(CameraActivity::ReadingOut);
        tracing::info!("{}: exposure stopped, reading out", self.config.name);
        Ok(())
    }

    /// Abort whatever exposure is in flight; a no-op when not exposing
    pub async fn try_abort(&self) -> DeviceResult<()> {
        if self.activities.is_active(CameraActivity::Exposing) {
            self.try_abort_exposure().await?;
        }
        Ok(())
    }

    // =========================================================================
    // Temperature
    // =========================================================================

    async fn drive_cooler(driver: &mut dyn CameraDriver, target: f64) -> DriverResult<()> {
        if !driver.cooler_on().await? {
            driver.set_cooler_on(true).await?;
        }
        driver.set_ccd_temperature(target).await
    }

    /// Begin cooling to the operational set-point
    pub async fn try_cooldown(&self) -> DeviceResult<()> {
        let mut driver = self.driver.lock().await;
        self.check_thermal_control(driver.as_ref(), "cooldown")?;
        self.activities.start(CameraActivity::CoolingDown)?;

        let target = self.config.operational_set_point;
        if let Err(e) = Self::drive_cooler(driver.as_mut(), target).await {
            self.activities.end_if_active(CameraActivity::CoolingDown);
            return Err(self.fault("cooldown")(e));
        }
        tracing::info!("{}: cooling down to {:.1}°C", self.config.name, target);
        Ok(())
    }

    /// Begin warming to the storage set-point
    pub async fn try_warmup(&self) -> DeviceResult<()> {
        let mut driver = self.driver.lock().await;
        self.check_thermal_control(driver.as_ref(), "warmup")?;
        self.activities.start(CameraActivity::WarmingUp)?;

        let target = self.config.warm_set_point;
        if let Err(e) = Self::drive_cooler(driver.as_mut(), target).await {
            self.activities.end_if_active(CameraActivity::WarmingUp);
            return Err(self.fault("warmup")(e));
        }
        tracing::info!("{}: warming up to {:.1}°C", self.config.name, target);
        Ok(())
    }

    // =========================================================================
    // Startup / shutdown
    // =========================================================================

    /// Connect, turn the cooler on and cool to the operational set-point.
    /// StartingUp ends when the poller sees the set-point reached.
    pub async fn try_startup(&self) -> DeviceResult<()> {
        self.activities.start(CameraActivity::StartingUp)?;
        let result = self.startup_sequence().await;
        if result.is_err() {
            self.activities.end_if_active(CameraActivity::StartingUp);
        }
        result
    }

    async fn startup_sequence(&self) -> DeviceResult<()> {
        self.try_connect().await?;

        let temperature = {
            let mut driver = self.driver.lock().await;
            driver.set_cooler_on(true).await.map_err(self.fault("startup"))?;
            driver.ccd_temperature().await.map_err(self.fault("ccd_temperature"))?
        };

        let set_point = self.config.operational_set_point;
        if (temperature - set_point).abs() > self.config.temperature_tolerance {
            self.try_cooldown().await
        } else {
            tracing::info!(
                "{}: already at set-point ({:.1}°C), startup complete",
                self.config.name,
                temperature
            );
            self.activities.end_if_active(CameraActivity::StartingUp);
            Ok(())
        }
    }

    /// Warm to the storage set-point, then turn the cooler off.
    /// ShuttingDown ends when the poller sees the warm set-point reached.
    pub async fn try_shutdown(&self) -> DeviceResult<()> {
        self.activities.start(CameraActivity::ShuttingDown)?;
        let result = self.shutdown_sequence().await;
        if result.is_err() {
            self.activities.end_if_active(CameraActivity::ShuttingDown);
        }
        result
    }

    async fn shutdown_sequence(&self) -> DeviceResult<()> {
        let temperature = {
            let driver = self.driver.lock().await;
            if !driver.is_connected() {
                return Err(self.not_connected());
            }
            driver.ccd_temperature().await.map_err(self.fault("ccd_temperature"))?
        };

        let warm = self.config.warm_set_point;
        if temperature < warm - self.config.temperature_tolerance {
            return self.try_warmup().await;
        }

        self.driver
            .lock()
            .await
            .set_cooler_on(false)
            .await
            .map_err(self.fault("shutdown"))?;
        tracing::info!(
            "{}: already warm ({:.1}°C), cooler OFF, shutdown complete",
            self.config.name,
            temperature
        );
        self.activities.end_if_active(CameraActivity::ShuttingDown);
        Ok(())
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn status(&self) -> CameraStatus {
        let driver = self.driver.lock().await;
        if !driver.is_connected() {
            drop(driver);
            let mut status = CameraStatus::offline(&self.config.name, self.info.clone(), self.is_powered());
            status.activities = self.activities.names();
            return status;
        }

        let state = driver.camera_state().await.ok();
        let temperature = driver.ccd_temperature().await.ok();
        let cooler_on = driver.cooler_on().await.ok();
        let cooler_power = if self.capabilities.can_get_cooler_power {
            driver.cooler_power().await.ok()
        } else {
            None
        };
        drop(driver);

        let is_powered = self.is_powered();
        let mut reasons = Vec::new();
        if !is_powered {
            reasons.push("not-powered".to_string());
        }
        reasons.extend(operational_reasons(
            true,
            temperature,
            self.config.operational_set_point,
            self.config.temperature_tolerance,
        ));

        CameraStatus {
            timestamp: chrono::Utc::now(),
            name: self.config.name.clone(),
            driver: self.info.clone(),
            is_powered,
            is_connected: true,
            is_operational: reasons.is_empty(),
            state,
            temperature,
            cooler_on,
            cooler_power,
            geometry: self.geometry(),
            has_image: locked(&self.image).is_some(),
            activities: self.activities.names(),
            reasons,
        }
    }

    // =========================================================================
    // Command envelopes
    // =========================================================================

    async fn outcome<T: Serialize>(&self, result: DeviceResult<T>) -> CameraOutcome {
        CommandOutcome::from_result(result, self.status().await)
    }

    pub async fn connect(&self) -> CameraOutcome {
        let result = self.try_connect().await;
        self.outcome(result).await
    }

    pub async fn disconnect(&self) -> CameraOutcome {
        let result = self.try_disconnect().await;
        self.outcome(result).await
    }

    pub async fn start_exposure(&self, seconds: f64) -> CameraOutcome {
        let result = self.try_start_exposure(seconds).await;
        self.outcome(result).await
    }

    pub async fn abort_exposure(&self) -> CameraOutcome {
        let result = self.try_abort_exposure().await;
        self.outcome(result).await
    }

    pub async fn stop_exposure(&self) -> CameraOutcome {
        let result = self.try_stop_exposure().await;
        self.outcome(result).await
    }

    pub async fn startup(&self) -> CameraOutcome {
        let result = self.try_startup().await;
        self.outcome(result).await
    }

    pub async fn shutdown(&self) -> CameraOutcome {
        let result = self.try_shutdown().await;
        self.outcome(result).await
    }

    pub async fn cooldown(&self) -> CameraOutcome {
        let result = self.try_cooldown().await;
        self.outcome(result).await
    }

    pub async fn warmup(&self) -> CameraOutcome {
        let result = self.try_warmup().await;
        self.outcome(result).await
    }

    pub async fn abort(&self) -> CameraOutcome {
        let result = self.try_abort().await;
        self.outcome(result).await
    }

    // =========================================================================
    // Polling
    // =========================================================================

    fn end_defensively(&self, activities: &[CameraActivity]) {
        for activity in activities {
            if self.activities.end_if_active(*activity).is_some() {
                tracing::warn!(
                    "{}: {} ended after a driver fault",
                    self.config.name,
                    activity.name()
                );
            }
        }
    }

    async fn poll_exposure(&self, driver: &mut dyn CameraDriver) -> DeviceResult<()> {
        let exposure = [CameraActivity::Exposing, CameraActivity::ReadingOut];

        let ready = match driver.image_ready().await {
            Ok(ready) => ready,
            Err(e) => {
                self.end_defensively(&exposure);
                return Err(self.fault("image_ready")(e));
            }
        };
        if !ready {
            return Ok(());
        }

        let frame = match driver.image().await {
            Ok(frame) => frame,
            Err(e) => {
                self.end_defensively(&exposure);
                return Err(self.fault("image")(e));
            }
        };
        let shutter = driver
            .last_exposure_duration()
            .await
            .unwrap_or(frame.exposure_secs);

        let geometry = frame.geometry;
        *locked(&self.image) = Some(Arc::new(frame));
        tracing::info!(
            "{}: image acquired ({}, shutter was open for {:.2} seconds)",
            self.config.name,
            geometry,
            shutter
        );
        self.activities.end_if_active(CameraActivity::Exposing);
        self.activities.end_if_active(CameraActivity::ReadingOut);
        Ok(())
    }

    async fn poll_temperature(&self, driver: &mut dyn CameraDriver, cooling: bool, warming: bool) -> DeviceResult<()> {
        let temperature = match driver.ccd_temperature().await {
            Ok(t) => t,
            Err(e) => {
                self.end_defensively(&[
                    CameraActivity::CoolingDown,
                    CameraActivity::StartingUp,
                    CameraActivity::WarmingUp,
                    CameraActivity::ShuttingDown,
                ]);
                return Err(self.fault("ccd_temperature")(e));
            }
        };

        if cooling && temperature <= self.config.operational_set_point {
            tracing::info!(
                "{}: reached operational set-point ({:.1}°C)",
                self.config.name,
                temperature
            );
            self.activities.end_if_active(CameraActivity::CoolingDown);
            self.activities.end_if_active(CameraActivity::StartingUp);
        }

        if warming && temperature >= self.config.warm_set_point {
            let cooler_off = driver.set_cooler_on(false).await;
            self.activities.end_if_active(CameraActivity::WarmingUp);
            self.activities.end_if_active(CameraActivity::ShuttingDown);
            cooler_off.map_err(self.fault("set_cooler_on"))?;
            tracing::info!(
                "{}: reached warm set-point ({:.1}°C), turned cooler OFF",
                self.config.name,
                temperature
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("name", &self.config.name)
            .field("driver", &self.info.name)
            .field("activities", &self.activities.active())
            .finish()
    }
}

#[async_trait]
impl Pollable for Camera {
    fn poll_name(&self) -> String {
        self.config.name.clone()
    }

    async fn poll(&self) -> DeviceResult<()> {
        let mut driver = self.driver.lock().await;
        if !driver.is_connected() {
            return Ok(());
        }

        let state = driver.camera_state().await.map_err(self.fault("camera_state"))?;
        let previous = self.last_state();
        if previous != Some(state) {
            let progress = if state.reports_progress() {
                driver.percent_completed().await.ok()
            } else {
                None
            };
            match (previous, progress) {
                (None, _) => tracing::info!("{}: status - {}", self.config.name, state),
                (Some(prev), Some(percent)) => tracing::info!(
                    "{}: status changed from {} to {} ({}%)",
                    self.config.name,
                    prev,
                    state,
                    percent
                ),
                (Some(prev), None) => {
                    tracing::info!("{}: status changed from {} to {}", self.config.name, prev, state)
                }
            }
            *locked(&self.last_state) = Some(state);
        }

        if self.activities.is_active(CameraActivity::Exposing) {
            self.poll_exposure(driver.as_mut()).await?;
        }

        let cooling = self.activities.is_active(CameraActivity::CoolingDown);
        let warming = self.activities.is_active(CameraActivity::WarmingUp);
        if cooling || warming {
            self.poll_temperature(driver.as_mut(), cooling, warming).await?;
        }
        Ok(())
    }
}
