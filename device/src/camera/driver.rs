//! Camera driver interface
//!
//! The controller talks to hardware exclusively through [`CameraDriver`]. The
//! method set follows the ASCOM camera model (state codes, image-ready flag,
//! cooler set-point) so ASCOM, Alpaca or vendor SDK bindings can sit behind
//! it. Driver calls may block on hardware; implementations are expected to
//! offload blocking SDK calls themselves.

use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Result type for raw driver calls
pub type DriverResult<T> = Result<T, String>;

/// Bytes per pixel of a guide frame (unsigned 32-bit samples)
pub const BYTES_PER_PIXEL: usize = 4;

/// Camera state matching ASCOM CameraState
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraState {
    Idle = 0,
    Waiting = 1,
    Exposing = 2,
    Reading = 3,
    Download = 4,
    Error = 5,
}

impl CameraState {
    /// States during which the driver reports a meaningful percent-complete
    pub fn reports_progress(&self) -> bool {
        matches!(
            self,
            CameraState::Waiting | CameraState::Exposing | CameraState::Reading | CameraState::Download
        )
    }
}

impl From<i32> for CameraState {
    fn from(value: i32) -> Self {
        match value {
            0 => CameraState::Idle,
            1 => CameraState::Waiting,
            2 => CameraState::Exposing,
            3 => CameraState::Reading,
            4 => CameraState::Download,
            _ => CameraState::Error,
        }
    }
}

impl std::fmt::Display for CameraState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraState::Idle => write!(f, "Idle"),
            CameraState::Waiting => write!(f, "Waiting"),
            CameraState::Exposing => write!(f, "Exposing"),
            CameraState::Reading => write!(f, "Reading"),
            CameraState::Download => write!(f, "Downloading"),
            CameraState::Error => write!(f, "Error"),
        }
    }
}

/// Identity of the driver behind a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub name: String,
    pub description: String,
    pub version: String,
}

/// Camera capabilities for determining what features are available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraCapabilities {
    pub can_abort_exposure: bool,
    pub can_stop_exposure: bool,
    pub can_set_ccd_temperature: bool,
    pub can_get_cooler_power: bool,
}

/// Image dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageGeometry {
    pub width: u32,
    pub height: u32,
}

impl ImageGeometry {
    /// Create a geometry; both dimensions must be positive
    pub fn new(width: u32, height: u32) -> DeviceResult<Self> {
        if width == 0 || height == 0 {
            return Err(DeviceError::InvalidParameter(format!(
                "Invalid image dimensions: width={}, height={}",
                width, height
            )));
        }
        let geometry = Self { width, height };
        geometry.byte_len()?;
        Ok(geometry)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size in bytes of a frame with this geometry, with overflow protection
    pub fn byte_len(&self) -> DeviceResult<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|pixels| pixels.checked_mul(BYTES_PER_PIXEL))
            .ok_or_else(|| {
                DeviceError::InvalidParameter(format!(
                    "Image buffer size overflow: {}x{} with {} bytes/pixel",
                    self.width, self.height, BYTES_PER_PIXEL
                ))
            })
    }
}

impl std::fmt::Display for ImageGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Sensor information reported by the driver once connected
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorInfo {
    pub geometry: ImageGeometry,
    /// Angular size of one pixel along X
    pub pixel_scale_x_arcsec: f64,
    /// Angular size of one pixel along Y
    pub pixel_scale_y_arcsec: f64,
}

impl SensorInfo {
    /// Angular field covered by the sensor as (x, y) in radians
    pub fn field_of_view_rad(&self) -> (f64, f64) {
        let arcsec_to_rad = std::f64::consts::PI / (180.0 * 3600.0);
        (
            self.pixel_scale_x_arcsec * self.geometry.width as f64 * arcsec_to_rad,
            self.pixel_scale_y_arcsec * self.geometry.height as f64 * arcsec_to_rad,
        )
    }
}

/// A downloaded frame: row-major unsigned 32-bit samples
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    pub geometry: ImageGeometry,
    pub pixels: Vec<u32>,
    pub exposure_secs: f64,
    pub acquired_at: DateTime<Utc>,
}

impl ImageFrame {
    pub fn new(geometry: ImageGeometry, pixels: Vec<u32>, exposure_secs: f64) -> DeviceResult<Self> {
        if pixels.len() != geometry.pixel_count() {
            return Err(DeviceError::InvalidParameter(format!(
                "Frame has {} pixels, geometry {} needs {}",
                pixels.len(),
                geometry,
                geometry.pixel_count()
            )));
        }
        Ok(Self {
            geometry,
            pixels,
            exposure_secs,
            acquired_at: Utc::now(),
        })
    }

    /// Pixel at column `x`, row `y`
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.geometry.width || y >= self.geometry.height {
            return None;
        }
        self.pixels.get(y as usize * self.geometry.width as usize + x as usize).copied()
    }
}

/// Hardware camera driver
#[async_trait]
pub trait CameraDriver: Send + Sync + Debug {
    fn info(&self) -> DriverInfo;

    fn capabilities(&self) -> CameraCapabilities;

    fn is_connected(&self) -> bool;

    async fn set_connected(&mut self, connected: bool) -> DriverResult<()>;

    async fn sensor_info(&self) -> DriverResult<SensorInfo>;

    // Exposure state

    async fn camera_state(&self) -> DriverResult<CameraState>;

    async fn percent_completed(&self) -> DriverResult<i32>;

    async fn image_ready(&self) -> DriverResult<bool>;

    /// Download the last completed exposure
    async fn image(&mut self) -> DriverResult<ImageFrame>;

    /// Seconds the shutter was open during the last exposure
    async fn last_exposure_duration(&self) -> DriverResult<f64>;

    // Exposure control

    async fn start_exposure(&mut self, duration_secs: f64, light: bool) -> DriverResult<()>;

    /// Abort without readout
    async fn abort_exposure(&mut self) -> DriverResult<()>;

    /// Stop early and read out what was collected
    async fn stop_exposure(&mut self) -> DriverResult<()>;

    // Cooling

    async fn ccd_temperature(&self) -> DriverResult<f64>;

    async fn set_ccd_temperature(&mut self, target: f64) -> DriverResult<()>;

    async fn cooler_on(&self) -> DriverResult<bool>;

    async fn set_cooler_on(&mut self, on: bool) -> DriverResult<()>;

    async fn cooler_power(&self) -> DriverResult<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_state_from_code() {
        assert_eq!(CameraState::from(2), CameraState::Exposing);
        assert_eq!(CameraState::from(4), CameraState::Download);
        assert_eq!(CameraState::from(42), CameraState::Error);
        assert_eq!(CameraState::Download.to_string(), "Downloading");
        assert!(CameraState::Reading.reports_progress());
        assert!(!CameraState::Idle.reports_progress());
    }

    #[test]
    fn test_geometry_byte_len() {
        let geometry = ImageGeometry::new(100, 50).unwrap();
        assert_eq!(geometry.byte_len().unwrap(), 100 * 50 * 4);
        assert_eq!(geometry.pixel_count(), 5000);
        assert!(ImageGeometry::new(0, 10).is_err());
        assert!(ImageGeometry::new(10, 0).is_err());
    }

    #[test]
    fn test_frame_validation() {
        let geometry = ImageGeometry::new(3, 2).unwrap();
        assert!(ImageFrame::new(geometry, vec![0; 5], 1.0).is_err());

        let frame = ImageFrame::new(geometry, vec![0, 1, 2, 3, 4, 5], 1.0).unwrap();
        assert_eq!(frame.pixel(2, 0), Some(2));
        assert_eq!(frame.pixel(0, 1), Some(3));
        assert_eq!(frame.pixel(3, 0), None);
    }

    #[test]
    fn test_field_of_view() {
        let info = SensorInfo {
            geometry: ImageGeometry::new(3600, 1800).unwrap(),
            pixel_scale_x_arcsec: 1.0,
            pixel_scale_y_arcsec: 1.0,
        };
        let (x, y) = info.field_of_view_rad();
        let one_degree = std::f64::consts::PI / 180.0;
        assert!((x - one_degree).abs() < 1e-12);
        assert!((y - one_degree / 2.0).abs() < 1e-12);
    }
}
