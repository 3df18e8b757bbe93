//! Pointing correction math

use mast_device::{MountOffset, MountStatus};
use serde::{Deserialize, Serialize};

const ARCSEC_PER_DEGREE: f64 = 3600.0;
const DEGREES_PER_HOUR: f64 = 15.0;

/// Equatorial coordinates: RA in hours, Dec in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyCoordinates {
    pub ra_hours: f64,
    pub dec_degs: f64,
}

impl SkyCoordinates {
    pub fn new(ra_hours: f64, dec_degs: f64) -> Self {
        Self { ra_hours, dec_degs }
    }
}

impl From<MountStatus> for SkyCoordinates {
    fn from(status: MountStatus) -> Self {
        Self {
            ra_hours: status.ra_j2000_hours,
            dec_degs: status.dec_j2000_degs,
        }
    }
}

impl std::fmt::Display for SkyCoordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ra {:.6}h, dec {:+.6}°", self.ra_hours, self.dec_degs)
    }
}

/// Deliberate bias added to solve hints so a simulated solver reports a
/// non-zero drift. Off unless configured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestSkew {
    pub ra_hours: f64,
    pub dec_degs: f64,
}

impl RequestSkew {
    /// 20 seconds of time in RA, 15 arcseconds in Dec
    pub fn test_pattern() -> Self {
        Self {
            ra_hours: 20.0 / 3600.0,
            dec_degs: 15.0 / ARCSEC_PER_DEGREE,
        }
    }

    pub fn apply(&self, coordinates: SkyCoordinates) -> SkyCoordinates {
        SkyCoordinates {
            ra_hours: (coordinates.ra_hours + self.ra_hours).rem_euclid(24.0),
            dec_degs: (coordinates.dec_degs + self.dec_degs).clamp(-90.0, 90.0),
        }
    }
}

/// RA difference `to - from` wrapped into (-12, 12] hours
pub fn ra_delta_hours(from: f64, to: f64) -> f64 {
    let delta = (to - from).rem_euclid(24.0);
    if delta > 12.0 {
        delta - 24.0
    } else {
        delta
    }
}

/// Offset that moves the mount from where it believes it points to where the
/// solver says it points.
pub fn compute_offset(mount: SkyCoordinates, solved: SkyCoordinates) -> MountOffset {
    let ra_hours = ra_delta_hours(mount.ra_hours, solved.ra_hours);
    let dec_degs = solved.dec_degs - mount.dec_degs;
    MountOffset {
        ra_arcsec: ra_hours * DEGREES_PER_HOUR * ARCSEC_PER_DEGREE,
        dec_arcsec: dec_degs * ARCSEC_PER_DEGREE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_round_trip_offset() {
        let offset = compute_offset(SkyCoordinates::new(10.0, 20.0), SkyCoordinates::new(10.0056, 20.0042));
        assert!(close(offset.ra_arcsec, 302.4), "ra {}", offset.ra_arcsec);
        assert!(close(offset.dec_arcsec, 15.12), "dec {}", offset.dec_arcsec);
    }

    #[test]
    fn test_offset_sign_follows_delta() {
        let offset = compute_offset(SkyCoordinates::new(10.0, 20.0), SkyCoordinates::new(9.999, 19.999));
        assert!(offset.ra_arcsec < 0.0);
        assert!(offset.dec_arcsec < 0.0);

        let zero = compute_offset(SkyCoordinates::new(5.0, -30.0), SkyCoordinates::new(5.0, -30.0));
        assert!(zero.is_zero());
    }

    #[test]
    fn test_ra_wraps_across_zero_hours() {
        assert!(close(ra_delta_hours(23.99, 0.01), 0.02));
        assert!(close(ra_delta_hours(0.01, 23.99), -0.02));
        assert!(close(ra_delta_hours(6.0, 18.0), 12.0));

        let offset = compute_offset(SkyCoordinates::new(23.999, 0.0), SkyCoordinates::new(0.001, 0.0));
        assert!(close(offset.ra_arcsec, 0.002 * 54_000.0));
    }

    #[test]
    fn test_skew_wraps_and_clamps() {
        let skew = RequestSkew {
            ra_hours: 0.5,
            dec_degs: 5.0,
        };
        let skewed = skew.apply(SkyCoordinates::new(23.8, 88.0));
        assert!(close(skewed.ra_hours, 0.3));
        assert_eq!(skewed.dec_degs, 90.0);

        let pattern = RequestSkew::test_pattern().apply(SkyCoordinates::new(10.0, 20.0));
        let offset = compute_offset(SkyCoordinates::new(10.0, 20.0), pattern);
        assert!(close(offset.ra_arcsec, 300.0));
        assert!(close(offset.dec_arcsec, 15.0));
    }
}
