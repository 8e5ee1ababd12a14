//! Backbone reconstruction of gliding snakes from motion-capture markers.
//!
//! Per-marker signals are smoothed run by run with GCV-selected smoothing
//! splines, differentiated into kinematics, and each frame's markers are fit
//! with a global natural cubic spline that is resampled into a fixed number
//! of points along the body.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod backbone;
pub mod kinematics;
pub mod linalg;
pub mod numeric;
pub mod series;
pub mod smoothing;

pub use backbone::{allocate_points, global_natural_spline, BackboneSpline};
pub use kinematics::{extract, KinematicSample, KinematicsTable};
pub use series::{
    build_time_series, verify_landmark_index, BackboneTimeSeries, MarkerMetadata, Profile,
    TrialInput,
};
pub use smoothing::{
    fill_gaps, find_runs, fit, smooth_signal, ContiguousRun, SmoothedSignal, SmoothingSpline,
    MIN_RUN_LEN,
};

#[derive(Error, Debug)]
pub enum SplineError {
    #[error("run starting at frame {start} has {len} points; at least {min} are required")]
    DataGap { start: usize, len: usize, min: usize },
    #[error("singular linear system: {0}")]
    SingularSystem(String),
    #[error("smoothing spline fit failed: {0}")]
    SmoothingFailed(String),
    #[error("cannot allocate {budget} resample points: {reason}")]
    BudgetMismatch { budget: usize, reason: String },
    #[error("landmark resample index {found} at frame {frame} differs from {expected}")]
    LandmarkIndexMismatch {
        frame: usize,
        expected: usize,
        found: usize,
    },
    #[error("marker {marker} has a non-finite coordinate")]
    NonFiniteMarker { marker: usize },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("insufficient data for backbone reconstruction")]
    InsufficientData,
    #[error("frame {frame}: {source}")]
    Frame {
        frame: usize,
        #[source]
        source: Box<SplineError>,
    },
    #[error("run starting at frame {start}: {source}")]
    Run {
        start: usize,
        #[source]
        source: Box<SplineError>,
    },
}

impl SplineError {
    pub(crate) fn in_frame(self, frame: usize) -> Self {
        SplineError::Frame {
            frame,
            source: Box::new(self),
        }
    }

    pub(crate) fn in_run(self, start: usize) -> Self {
        SplineError::Run {
            start,
            source: Box::new(self),
        }
    }
}

/// What to do with runs too short for a smoothing spline.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShortRunPolicy {
    Reject,
    Drop,
}

impl Default for ShortRunPolicy {
    fn default() -> Self {
        ShortRunPolicy::Reject
    }
}

/// Coordinate used to look up the density and chord profiles.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProfileCoordinate {
    /// Cumulative spline parameter (sum of arc-length guesses).
    Parameter,
    /// Integrated arc length of the fitted spline.
    ArcLength,
}

impl Default for ProfileCoordinate {
    fn default() -> Self {
        ProfileCoordinate::Parameter
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub smoothing_scale: f64,
    pub fill_gap_sec: f64,
    pub short_runs: ShortRunPolicy,
    pub gcv_log10_min: f64,
    pub gcv_log10_max: f64,
    pub gcv_grid_points: usize,
    pub gcv_refine_iters: usize,
    pub resample_budget: usize,
    pub profile_coordinate: ProfileCoordinate,
    pub parallel: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            smoothing_scale: 1.0,
            fill_gap_sec: 0.0,
            short_runs: ShortRunPolicy::Reject,
            gcv_log10_min: -6.0,
            gcv_log10_max: 10.0,
            gcv_grid_points: 65,
            gcv_refine_iters: 60,
            resample_budget: 200,
            profile_coordinate: ProfileCoordinate::Parameter,
            parallel: true,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), SplineError> {
        if !(self.smoothing_scale.is_finite() && self.smoothing_scale > 0.0) {
            return Err(SplineError::InvalidParameter(format!(
                "smoothing_scale must be positive, got {}",
                self.smoothing_scale
            )));
        }
        if !(self.fill_gap_sec.is_finite() && self.fill_gap_sec >= 0.0) {
            return Err(SplineError::InvalidParameter(format!(
                "fill_gap_sec must be non-negative, got {}",
                self.fill_gap_sec
            )));
        }
        if !(self.gcv_log10_min < self.gcv_log10_max) {
            return Err(SplineError::InvalidParameter(
                "gcv_log10_min must be below gcv_log10_max".into(),
            ));
        }
        if self.gcv_grid_points < 3 {
            return Err(SplineError::InvalidParameter(
                "gcv_grid_points must be at least 3".into(),
            ));
        }
        Ok(())
    }

    /// Frames of a gap that `fill_gaps` may bridge at the given frame rate.
    pub fn fill_gap_frames(&self, frame_rate: f64) -> usize {
        (self.fill_gap_sec * frame_rate).floor().max(0.0) as usize
    }

    pub fn params_hash_sha256(&self) -> Result<String, SplineError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| SplineError::InvalidParameter(e.to_string()))?;
        let digest = Sha256::digest(&bytes);
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_validate() {
        assert!(Params::default().validate().is_ok());
    }

    #[test]
    fn test_params_hash_changes_with_scale() {
        let base = Params::default();
        let mut scaled = Params::default();
        scaled.smoothing_scale = 2.0;
        let a = base.params_hash_sha256().unwrap();
        let b = scaled.params_hash_sha256().unwrap();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(a, Params::default().params_hash_sha256().unwrap());
    }

    #[test]
    fn test_fill_gap_frames_truncates() {
        let mut params = Params::default();
        params.fill_gap_sec = 0.05;
        assert_eq!(params.fill_gap_frames(150.0), 7);
    }

    #[test]
    fn test_params_partial_json_uses_defaults() {
        let params: Params = serde_json::from_str(r#"{"smoothing_scale": 3.0}"#).unwrap();
        assert_eq!(params.smoothing_scale, 3.0);
        assert_eq!(params.resample_budget, 200);
        assert_eq!(params.short_runs, ShortRunPolicy::Reject);
    }

    #[test]
    fn test_frame_context_wraps_source() {
        let err = SplineError::SingularSystem("zero pivot".into()).in_frame(4);
        assert_eq!(err.to_string(), "frame 4: singular linear system: zero pivot");
    }

    #[test]
    fn test_run_context_wraps_source() {
        let err = SplineError::SmoothingFailed("no finite score".into()).in_run(3);
        assert_eq!(
            err.to_string(),
            "run starting at frame 3: smoothing spline fit failed: no finite score"
        );
    }
}
