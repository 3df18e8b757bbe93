//! MAST device layer
//!
//! Activity tracking, periodic polling and the camera/mount device façades
//! shared by the guiding core. Hardware is reached only through the
//! [`CameraDriver`] and [`MountDriver`] traits; simulated implementations of
//! both live here too.

mod activity;
mod envelope;
mod error;
mod mount;
mod poller;

pub mod camera;

pub use activity::*;
pub use envelope::*;
pub use error::*;
pub use mount::*;
pub use poller::*;

pub use camera::{
    Camera, CameraActivity, CameraCapabilities, CameraConfig, CameraDriver, CameraOutcome, CameraState,
    CameraStatus, DriverInfo, ImageFrame, ImageGeometry, SensorInfo, SimulatedCamera, SimulatedCameraConfig,
    BYTES_PER_PIXEL, exposure_duration, MAX_EXPOSURE_SECS,
};
