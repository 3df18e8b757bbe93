//! Simulated camera driver
//!
//! Models exposure timing with a readout delay, a first-order cooler that
//! drifts toward its set-point (or ambient when off), and synthetic frames
//! with background noise and a single star. Used by tests and the
//! `mast-unit` demo.

use super::driver::{
    CameraCapabilities, CameraDriver, CameraState, DriverInfo, DriverResult, ImageFrame, ImageGeometry,
    SensorInfo,
};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Simulated sensor and cooler parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedCameraConfig {
    pub width: u32,
    pub height: u32,
    pub pixel_scale_arcsec: f64,
    /// Sensor temperature at connect time and with the cooler off
    pub ambient_temperature: f64,
    /// Cooler slew rate in degrees per second
    pub cooling_rate: f64,
    pub readout_ms: u64,
    pub can_set_ccd_temperature: bool,
    pub can_abort_exposure: bool,
    pub can_stop_exposure: bool,
}

impl Default for SimulatedCameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            pixel_scale_arcsec: 1.5,
            ambient_temperature: 15.0,
            cooling_rate: 2.0,
            readout_ms: 200,
            can_set_ccd_temperature: true,
            can_abort_exposure: true,
            can_stop_exposure: true,
        }
    }
}

impl SimulatedCameraConfig {
    /// Fast timings and a small sensor for tests
    pub fn for_tests() -> Self {
        Self {
            width: 64,
            height: 48,
            cooling_rate: 200.0,
            readout_ms: 10,
            ..Self::default()
        }
    }
}

/// Counters that make the next N driver calls of a kind fail
#[derive(Debug, Default)]
pub struct SimulatedFaults {
    pub camera_state: AtomicU32,
    pub image_ready: AtomicU32,
    pub image: AtomicU32,
    pub ccd_temperature: AtomicU32,
    pub start_exposure: AtomicU32,
}

impl SimulatedFaults {
    fn trip(counter: &AtomicU32, operation: &str) -> DriverResult<()> {
        let tripped = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(format!("simulated {} failure", operation));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Exposure {
    started: Instant,
    duration: Duration,
    /// Set when the exposure was stopped early (readout still happens)
    stopped: Option<Instant>,
}

impl Exposure {
    fn shutter_closed_at(&self) -> Instant {
        self.stopped.unwrap_or(self.started + self.duration)
    }

    fn shutter_open_secs(&self) -> f64 {
        self.shutter_closed_at().duration_since(self.started).as_secs_f64()
    }
}

/// Anchor of the thermal model: temperature at a point in time
#[derive(Debug, Clone, Copy)]
struct ThermalAnchor {
    at: Instant,
    temperature: f64,
}

#[derive(Debug)]
pub struct SimulatedCamera {
    config: SimulatedCameraConfig,
    connected: bool,
    exposure: Option<Exposure>,
    last_exposure_secs: Option<f64>,
    cooler_on: bool,
    target_temperature: f64,
    thermal: ThermalAnchor,
    faults: Arc<SimulatedFaults>,
}

impl SimulatedCamera {
    pub fn new(config: SimulatedCameraConfig) -> Self {
        let thermal = ThermalAnchor {
            at: Instant::now(),
            temperature: config.ambient_temperature,
        };
        Self {
            target_temperature: config.ambient_temperature,
            config,
            connected: false,
            exposure: None,
            last_exposure_secs: None,
            cooler_on: false,
            thermal,
            faults: Arc::new(SimulatedFaults::default()),
        }
    }

    /// Handle for injecting driver failures after the camera is boxed
    pub fn faults(&self) -> Arc<SimulatedFaults> {
        self.faults.clone()
    }

    fn check_connected(&self) -> DriverResult<()> {
        if !self.connected {
            return Err("camera is not connected".to_string());
        }
        Ok(())
    }

    fn geometry(&self) -> DriverResult<ImageGeometry> {
        ImageGeometry::new(self.config.width, self.config.height).map_err(|e| e.to_string())
    }

    fn current_temperature(&self) -> f64 {
        let goal = if self.cooler_on {
            self.target_temperature
        } else {
            self.config.ambient_temperature
        };
        let step = self.config.cooling_rate * self.thermal.at.elapsed().as_secs_f64();
        let from = self.thermal.temperature;
        if from > goal {
            (from - step).max(goal)
        } else {
            (from + step).min(goal)
        }
    }

    /// Re-anchor the thermal model before the goal changes
    fn reanchor(&mut self) {
        self.thermal = ThermalAnchor {
            at: Instant::now(),
            temperature: self.current_temperature(),
        };
    }

    fn readout(&self) -> Duration {
        Duration::from_millis(self.config.readout_ms)
    }

    fn state_now(&self) -> CameraState {
        match self.exposure {
            None => CameraState::Idle,
            Some(exposure) => {
                let closed = exposure.shutter_closed_at();
                let now = Instant::now();
                if now < closed {
                    CameraState::Exposing
                } else if now < closed + self.readout() {
                    CameraState::Reading
                } else {
                    CameraState::Idle
                }
            }
        }
    }

    fn frame_available(&self) -> bool {
        self.exposure
            .map(|e| Instant::now() >= e.shutter_closed_at() + self.readout())
            .unwrap_or(false)
    }

    /// Background, noise and one gaussian star near the frame center
    fn synthesize(&self, geometry: ImageGeometry, exposure_secs: f64) -> Vec<u32> {
        let mut rng = rand::thread_rng();
        let background = 800.0 + 40.0 * exposure_secs;
        let star_x = geometry.width as f64 / 2.0 + rng.gen_range(-1.0..1.0);
        let star_y = geometry.height as f64 / 2.0 + rng.gen_range(-1.0..1.0);
        let amplitude = 20_000.0 * exposure_secs.max(0.5);
        let sigma_sq = 2.0 * 1.8_f64.powi(2);

        let mut pixels = Vec::with_capacity(geometry.pixel_count());
        for y in 0..geometry.height {
            for x in 0..geometry.width {
                let dx = x as f64 - star_x;
                let dy = y as f64 - star_y;
                let star = amplitude * (-(dx * dx + dy * dy) / sigma_sq).exp();
                let noise: f64 = rng.gen_range(0.0..50.0);
                pixels.push((background + star + noise) as u32);
            }
        }
        pixels
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new(SimulatedCameraConfig::default())
    }
}

#[async_trait]
impl CameraDriver for SimulatedCamera {
    fn info(&self) -> DriverInfo {
        DriverInfo {
            name: "MAST Simulated Camera".to_string(),
            description: format!(
                "Simulated {}x{} guide camera",
                self.config.width, self.config.height
            ),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn capabilities(&self) -> CameraCapabilities {
        CameraCapabilities {
            can_abort_exposure: self.config.can_abort_exposure,
            can_stop_exposure: self.config.can_stop_exposure,
            can_set_ccd_temperature: self.config.can_set_ccd_temperature,
            can_get_cooler_power: true,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn set_connected(&mut self, connected: bool) -> DriverResult<()> {
        if !connected {
            self.exposure = None;
        }
        self.connected = connected;
        Ok(())
    }

    async fn sensor_info(&self) -> DriverResult<SensorInfo> {
        self.check_connected()?;
        Ok(SensorInfo {
            geometry: self.geometry()?,
            pixel_scale_x_arcsec: self.config.pixel_scale_arcsec,
            pixel_scale_y_arcsec: self.config.pixel_scale_arcsec,
        })
    }

    async fn camera_state(&self) -> DriverResult<CameraState> {
        self.check_connected()?;
        SimulatedFaults::trip(&self.faults.camera_state, "camera_state")?;
        Ok(self.state_now())
    }

    async fn percent_completed(&self) -> DriverResult<i32> {
        self.check_connected()?;
        let Some(exposure) = self.exposure else {
            return Ok(0);
        };
        let total = exposure.duration + self.readout();
        let done = exposure.started.elapsed().as_secs_f64() / total.as_secs_f64().max(f64::EPSILON);
        Ok((done * 100.0).clamp(0.0, 100.0) as i32)
    }

    async fn image_ready(&self) -> DriverResult<bool> {
        self.check_connected()?;
        SimulatedFaults::trip(&self.faults.image_ready, "image_ready")?;
        Ok(self.frame_available())
    }

    async fn image(&mut self) -> DriverResult<ImageFrame> {
        self.check_connected()?;
        SimulatedFaults::trip(&self.faults.image, "image")?;
        let exposure = match self.exposure {
            Some(e) if self.frame_available() => e,
            _ => return Err("no image available".to_string()),
        };

        let geometry = self.geometry()?;
        let shutter_secs = exposure.shutter_open_secs();
        let pixels = self.synthesize(geometry, shutter_secs);
        self.exposure = None;
        self.last_exposure_secs = Some(shutter_secs);
        ImageFrame::new(geometry, pixels, shutter_secs).map_err(|e| e.to_string())
    }

    async fn last_exposure_duration(&self) -> DriverResult<f64> {
        self.last_exposure_secs
            .ok_or_else(|| "no exposure has been taken".to_string())
    }

    async fn start_exposure(&mut self, duration_secs: f64, _light: bool) -> DriverResult<()> {
        self.check_connected()?;
        SimulatedFaults::trip(&self.faults.start_exposure, "start_exposure")?;
        let duration = Duration::try_from_secs_f64(duration_secs)
            .map_err(|e| format!("invalid exposure duration {}: {}", duration_secs, e))?;
        let started = Instant::now();
        let ends = duration.checked_add(self.readout()).and_then(|total| started.checked_add(total));
        if ends.is_none() {
            return Err(format!("exposure duration {} is out of range", duration_secs));
        }
        if self.state_now() == CameraState::Exposing {
            return Err("an exposure is already in progress".to_string());
        }
        self.exposure = Some(Exposure {
            started,
            duration,
            stopped: None,
        });
        Ok(())
    }

    async fn abort_exposure(&mut self) -> DriverResult<()> {
        self.check_connected()?;
        if !self.config.can_abort_exposure {
            return Err("abort not supported".to_string());
        }
        self.exposure = None;
        Ok(())
    }

    async fn stop_exposure(&mut self) -> DriverResult<()> {
        self.check_connected()?;
        if !self.config.can_stop_exposure {
            return Err("stop not supported".to_string());
        }
        if let Some(exposure) = self.exposure.as_mut() {
            if exposure.stopped.is_none() && Instant::now() < exposure.started + exposure.duration {
                exposure.stopped = Some(Instant::now());
            }
        }
        Ok(())
    }

    async fn ccd_temperature(&self) -> DriverResult<f64> {
        self.check_connected()?;
        SimulatedFaults::trip(&self.faults.ccd_temperature, "ccd_temperature")?;
        Ok(self.current_temperature())
    }

    async fn set_ccd_temperature(&mut self, target: f64) -> DriverResult<()> {
        self.check_connected()?;
        if !self.config.can_set_ccd_temperature {
            return Err("temperature control not supported".to_string());
        }
        self.reanchor();
        self.target_temperature = target;
        Ok(())
    }

    async fn cooler_on(&self) -> DriverResult<bool> {
        self.check_connected()?;
        Ok(self.cooler_on)
    }

    async fn set_cooler_on(&mut self, on: bool) -> DriverResult<()> {
        self.check_connected()?;
        self.reanchor();
        self.cooler_on = on;
        Ok(())
    }

    async fn cooler_power(&self) -> DriverResult<f64> {
        self.check_connected()?;
        if !self.cooler_on {
            return Ok(0.0);
        }
        let delta = (self.config.ambient_temperature - self.current_temperature()).max(0.0);
        Ok((delta * 2.5).min(100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    async fn connected() -> SimulatedCamera {
        let mut camera = SimulatedCamera::new(SimulatedCameraConfig::for_tests());
        camera.set_connected(true).await.unwrap();
        camera
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let camera = SimulatedCamera::new(SimulatedCameraConfig::for_tests());
        assert!(camera.camera_state().await.is_err());
        assert!(camera.sensor_info().await.is_err());
    }

    #[tokio::test]
    async fn test_out_of_range_exposure_is_an_error() {
        let mut camera = connected().await;
        for seconds in [-1.0, f64::NAN, 1e30, 1e19] {
            assert!(camera.start_exposure(seconds, true).await.is_err(), "{}", seconds);
        }
        assert_eq!(camera.camera_state().await.unwrap(), CameraState::Idle);
    }

    #[tokio::test]
    async fn test_exposure_lifecycle() {
        let mut camera = connected().await;
        camera.start_exposure(0.05, true).await.unwrap();
        assert_eq!(camera.camera_state().await.unwrap(), CameraState::Exposing);
        assert!(!camera.image_ready().await.unwrap());

        sleep(Duration::from_millis(100)).await;
        assert!(camera.image_ready().await.unwrap());

        let frame = camera.image().await.unwrap();
        assert_eq!(frame.geometry, ImageGeometry::new(64, 48).unwrap());
        assert_eq!(frame.pixels.len(), 64 * 48);
        assert!(camera.last_exposure_duration().await.unwrap() >= 0.05);
        assert!(!camera.image_ready().await.unwrap());
        assert_eq!(camera.camera_state().await.unwrap(), CameraState::Idle);
    }

    #[tokio::test]
    async fn test_star_is_brighter_than_background() {
        let mut camera = connected().await;
        camera.start_exposure(0.0, true).await.unwrap();
        sleep(Duration::from_millis(30)).await;
        let frame = camera.image().await.unwrap();

        let center = frame.pixel(32, 24).unwrap();
        let corner = frame.pixel(0, 0).unwrap();
        assert!(center > corner * 2, "center {} corner {}", center, corner);
    }

    #[tokio::test]
    async fn test_abort_discards_exposure() {
        let mut camera = connected().await;
        camera.start_exposure(5.0, true).await.unwrap();
        camera.abort_exposure().await.unwrap();
        assert_eq!(camera.camera_state().await.unwrap(), CameraState::Idle);
        assert!(camera.image().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_reads_out_early() {
        let mut camera = connected().await;
        camera.start_exposure(5.0, true).await.unwrap();
        sleep(Duration::from_millis(20)).await;
        camera.stop_exposure().await.unwrap();
        sleep(Duration::from_millis(30)).await;

        assert!(camera.image_ready().await.unwrap());
        let frame = camera.image().await.unwrap();
        assert!(frame.exposure_secs < 1.0);
    }

    #[tokio::test]
    async fn test_cooler_drifts_to_target() {
        let mut camera = connected().await;
        camera.set_ccd_temperature(-25.0).await.unwrap();
        camera.set_cooler_on(true).await.unwrap();
        sleep(Duration::from_millis(300)).await;

        assert_eq!(camera.ccd_temperature().await.unwrap(), -25.0);
        assert!(camera.cooler_power().await.unwrap() > 0.0);

        camera.set_cooler_on(false).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        assert_eq!(camera.ccd_temperature().await.unwrap(), 15.0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let camera = connected().await;
        camera.faults().camera_state.store(2, Ordering::SeqCst);
        assert!(camera.camera_state().await.is_err());
        assert!(camera.camera_state().await.is_err());
        assert!(camera.camera_state().await.is_ok());
    }
}
