//! Camera status snapshot

use super::driver::{CameraState, DriverInfo, ImageGeometry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of a camera, computed on demand
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraStatus {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub driver: DriverInfo,
    pub is_powered: bool,
    pub is_connected: bool,
    pub is_operational: bool,
    pub state: Option<CameraState>,
    pub temperature: Option<f64>,
    pub cooler_on: Option<bool>,
    pub cooler_power: Option<f64>,
    pub geometry: Option<ImageGeometry>,
    pub has_image: bool,
    /// Active activity names, `["Idle"]` when none
    pub activities: Vec<String>,
    /// Why the camera is not operational; empty when it is
    pub reasons: Vec<String>,
}

impl CameraStatus {
    /// Status of a camera that cannot be queried at all
    pub fn offline(name: impl Into<String>, driver: DriverInfo, is_powered: bool) -> Self {
        let mut reasons = Vec::new();
        if !is_powered {
            reasons.push("not-powered".to_string());
        }
        reasons.push("not-connected".to_string());
        Self {
            timestamp: Utc::now(),
            name: name.into(),
            driver,
            is_powered,
            is_connected: false,
            is_operational: false,
            state: None,
            temperature: None,
            cooler_on: None,
            cooler_power: None,
            geometry: None,
            has_image: false,
            activities: vec!["Idle".to_string()],
            reasons,
        }
    }
}

/// Operational check: connected and within `tolerance` of `set_point`.
/// Returns the reasons the camera is not operational.
pub(crate) fn operational_reasons(
    is_connected: bool,
    temperature: Option<f64>,
    set_point: f64,
    tolerance: f64,
) -> Vec<String> {
    if !is_connected {
        return vec!["not-connected".to_string()];
    }
    match temperature {
        None => vec!["temperature: unavailable".to_string()],
        Some(t) if (t - set_point).abs() > tolerance => vec![format!(
            "temperature: abs({:.1} - ({:.1})) > {:.1} deg",
            t, set_point, tolerance
        )],
        Some(_) => Vec::new(),
    }
}
