//! Camera driver interface, controller and simulated driver

pub mod controller;
pub mod driver;
pub mod simulated;
pub mod status;

pub use controller::{exposure_duration, Camera, CameraActivity, CameraConfig, CameraOutcome, MAX_EXPOSURE_SECS};
pub use driver::{
    CameraCapabilities, CameraDriver, CameraState, DriverInfo, DriverResult, ImageFrame, ImageGeometry,
    SensorInfo, BYTES_PER_PIXEL,
};
pub use simulated::{SimulatedCamera, SimulatedCameraConfig, SimulatedFaults};
pub use status::CameraStatus;
