//! Whole-trial backbone reconstruction.
//!
//! Every frame is fit independently with [`global_natural_spline`], the mass
//! and chord distributions are laid along the resampled body and the
//! per-frame outputs are stacked on a leading time axis.

use ndarray::{Array1, Array2, Array3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backbone::{global_natural_spline, BackboneSpline};
use crate::numeric::interp;
use crate::{Params, ProfileCoordinate, SplineError};

fn default_virtual_marker() -> Option<usize> {
    Some(1)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MarkerMetadata {
    /// Measured distance from each real marker to the next one.
    pub dist_btn_markers: Vec<f64>,
    /// Real-marker index of the anatomical landmark (the vent).
    pub landmark_index: usize,
    /// Snout-vent length.
    pub svl: f64,
    pub tail_length: f64,
    /// Position of the boundary-only marker in the fitted marker set.
    #[serde(default = "default_virtual_marker")]
    pub virtual_marker: Option<usize>,
}

impl MarkerMetadata {
    fn real_markers(&self) -> usize {
        self.dist_btn_markers.len() + 1
    }

    fn fitted_markers(&self) -> usize {
        self.real_markers() + usize::from(self.virtual_marker.is_some())
    }

    /// Resample index of the landmark, given the spline's marker indices.
    fn landmark_resample_index(&self, idx_pts: &[usize]) -> usize {
        let mut fitted = self.landmark_index;
        if let Some(v) = self.virtual_marker {
            if fitted >= v {
                fitted += 1;
            }
        }
        if fitted == 0 {
            0
        } else {
            idx_pts[fitted - 1]
        }
    }
}

/// Per-segment model lengths with the two segments around the virtual marker merged.
pub fn merge_virtual_segments(lengths: &[f64], virtual_marker: Option<usize>) -> Vec<f64> {
    match virtual_marker {
        None => lengths.to_vec(),
        Some(v) => {
            let mut out = Vec::with_capacity(lengths.len().saturating_sub(1));
            out.extend_from_slice(&lengths[..v - 1]);
            out.push(lengths[v - 1] + lengths[v]);
            out.extend_from_slice(&lengths[v + 1..]);
            out
        }
    }
}

/// Body property tabulated against normalized arc length.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Profile {
    pub s: Vec<f64>,
    pub values: Vec<f64>,
}

impl Profile {
    pub fn new(s: Vec<f64>, values: Vec<f64>) -> Result<Self, SplineError> {
        let profile = Self { s, values };
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), SplineError> {
        if self.s.is_empty() || self.s.len() != self.values.len() {
            return Err(SplineError::InvalidParameter(format!(
                "profile needs matching non-empty columns, got {} and {}",
                self.s.len(),
                self.values.len()
            )));
        }
        if self.s.windows(2).any(|w| !(w[1] >= w[0])) {
            return Err(SplineError::InvalidParameter(
                "profile arc-length column must be increasing".into(),
            ));
        }
        Ok(())
    }

    pub fn lookup(&self, s: f64) -> f64 {
        interp(s, &self.s, &self.values)
    }
}

/// Everything the builder needs for one trial.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrialInput {
    /// Marker positions, `ntime × markers × 3`, virtual marker included.
    pub frames: Array3<f64>,
    pub arclen_guess: Vec<f64>,
    pub times: Vec<f64>,
    pub mass: f64,
    pub metadata: MarkerMetadata,
    /// Density normalized by the mean density.
    pub density: Profile,
    /// Chord length normalized by SVL.
    pub chord: Profile,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackboneTimeSeries {
    /// Center of mass, `ntime × 3`.
    pub com: Array2<f64>,
    pub r: Array3<f64>,
    pub dr: Array3<f64>,
    pub ddr: Array3<f64>,
    pub dddr: Array3<f64>,
    pub spl_ds: Array2<f64>,
    pub mass_spl: Array2<f64>,
    pub chord_spl: Array2<f64>,
    /// Resample index of the landmark, identical for every frame.
    pub landmark_idx_spl: usize,
    pub times_2d: Array2<f64>,
    pub t_coord: Array2<f64>,
    pub s_coord: Array2<f64>,
    /// `(measured - model) / SVL` in percent, one column per real segment.
    pub spl_len_errors: Array2<f64>,
    pub idx_pts: Vec<usize>,
    pub svl: f64,
    pub tail_length: f64,
}

impl BackboneTimeSeries {
    pub fn ntime(&self) -> usize {
        self.com.nrows()
    }

    pub fn max_abs_length_error(&self) -> f64 {
        self.spl_len_errors
            .iter()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }
}

struct FrameFit {
    spline: BackboneSpline,
    len_errors: Vec<f64>,
    mass: Vec<f64>,
    chord: Vec<f64>,
    com: [f64; 3],
    landmark: usize,
}

fn validate_input(input: &TrialInput, budget: usize) -> Result<(), SplineError> {
    let (ntime, nmark, dim) = input.frames.dim();
    if ntime == 0 {
        return Err(SplineError::InsufficientData);
    }
    if dim != 3 {
        return Err(SplineError::InvalidParameter(format!(
            "frames must have 3 coordinates, got {}",
            dim
        )));
    }
    if input.times.len() != ntime {
        return Err(SplineError::InvalidParameter(format!(
            "{} frames but {} times",
            ntime,
            input.times.len()
        )));
    }
    let meta = &input.metadata;
    if meta.fitted_markers() != nmark {
        return Err(SplineError::InvalidParameter(format!(
            "metadata describes {} fitted markers, frames have {}",
            meta.fitted_markers(),
            nmark
        )));
    }
    if let Some(v) = meta.virtual_marker {
        if v == 0 || v + 1 >= nmark {
            return Err(SplineError::InvalidParameter(format!(
                "virtual marker {} must be an interior marker",
                v
            )));
        }
    }
    if meta.landmark_index >= meta.real_markers() {
        return Err(SplineError::InvalidParameter(format!(
            "landmark index {} out of range for {} markers",
            meta.landmark_index,
            meta.real_markers()
        )));
    }
    for (name, value) in [("mass", input.mass), ("svl", meta.svl)] {
        if !(value.is_finite() && value > 0.0) {
            return Err(SplineError::InvalidParameter(format!(
                "{} must be positive, got {}",
                name, value
            )));
        }
    }
    if budget == 0 {
        return Err(SplineError::InvalidParameter(
            "resample budget must be positive".into(),
        ));
    }
    input.density.validate()?;
    input.chord.validate()
}

fn fit_frame(
    input: &TrialInput,
    frame: usize,
    budget: usize,
    coordinate: ProfileCoordinate,
) -> Result<FrameFit, SplineError> {
    let meta = &input.metadata;
    let markers = input.frames.index_axis(Axis(0), frame).to_owned();
    let spline = global_natural_spline(&markers, &input.arclen_guess, budget)?;

    let lengths = merge_virtual_segments(
        spline.lengths_total.as_slice().unwrap_or(&[]),
        meta.virtual_marker,
    );
    let len_errors: Vec<f64> = meta
        .dist_btn_markers
        .iter()
        .zip(&lengths)
        .map(|(measured, model)| (measured - model) / meta.svl * 100.0)
        .collect();

    let coord: &Array1<f64> = match coordinate {
        ProfileCoordinate::Parameter => &spline.t_coord,
        ProfileCoordinate::ArcLength => &spline.s_coord,
    };
    let raw: Vec<f64> = coord
        .iter()
        .map(|c| input.density.lookup(c / meta.svl))
        .collect();
    let raw_total: f64 = raw.iter().sum();
    if !(raw_total.is_finite() && raw_total > 0.0) {
        return Err(SplineError::InvalidParameter(format!(
            "density profile sums to {} along the body",
            raw_total
        )));
    }
    let mass: Vec<f64> = raw.iter().map(|v| input.mass * v / raw_total).collect();
    let chord: Vec<f64> = coord
        .iter()
        .map(|c| meta.svl * input.chord.lookup(c / meta.svl))
        .collect();

    let mut com = [0.0; 3];
    for (row, m) in spline.r.outer_iter().zip(&mass) {
        for k in 0..3 {
            com[k] += row[k] * m;
        }
    }
    for value in &mut com {
        *value /= input.mass;
    }

    let landmark = meta.landmark_resample_index(&spline.idx_pts);
    debug!(frame, landmark, com = ?com, "fitted backbone frame");

    Ok(FrameFit {
        spline,
        len_errors,
        mass,
        chord,
        com,
        landmark,
    })
}

/// Check the landmark lands on the same resample index in every frame.
pub fn verify_landmark_index(indices: &[usize]) -> Result<usize, SplineError> {
    let expected = *indices.first().ok_or(SplineError::InsufficientData)?;
    if let Some((frame, &found)) = indices
        .iter()
        .enumerate()
        .find(|&(_, &idx)| idx != expected)
    {
        return Err(SplineError::LandmarkIndexMismatch {
            frame,
            expected,
            found,
        });
    }
    Ok(expected)
}

/// Fit every frame of a trial and stack the results.
pub fn build_time_series(
    input: &TrialInput,
    params: &Params,
) -> Result<BackboneTimeSeries, SplineError> {
    let budget = params.resample_budget;
    validate_input(input, budget)?;
    let ntime = input.frames.len_of(Axis(0));
    let coordinate = params.profile_coordinate;

    let run = |frame: usize| {
        fit_frame(input, frame, budget, coordinate).map_err(|e| e.in_frame(frame))
    };
    let fits: Vec<FrameFit> = if params.parallel {
        (0..ntime)
            .into_par_iter()
            .map(run)
            .collect::<Result<Vec<_>, _>>()?
    } else {
        (0..ntime).map(run).collect::<Result<Vec<_>, _>>()?
    };

    let landmarks: Vec<usize> = fits.iter().map(|f| f.landmark).collect();
    let landmark_idx_spl = verify_landmark_index(&landmarks)?;

    let nseg = input.metadata.dist_btn_markers.len();
    let mut out = BackboneTimeSeries {
        com: Array2::zeros((ntime, 3)),
        r: Array3::zeros((ntime, budget, 3)),
        dr: Array3::zeros((ntime, budget, 3)),
        ddr: Array3::zeros((ntime, budget, 3)),
        dddr: Array3::zeros((ntime, budget, 3)),
        spl_ds: Array2::zeros((ntime, budget)),
        mass_spl: Array2::zeros((ntime, budget)),
        chord_spl: Array2::zeros((ntime, budget)),
        landmark_idx_spl,
        times_2d: Array2::zeros((ntime, budget)),
        t_coord: Array2::zeros((ntime, budget)),
        s_coord: Array2::zeros((ntime, budget)),
        spl_len_errors: Array2::zeros((ntime, nseg)),
        idx_pts: fits
            .last()
            .map(|f| f.spline.idx_pts.clone())
            .unwrap_or_default(),
        svl: input.metadata.svl,
        tail_length: input.metadata.tail_length,
    };

    for (i, fit) in fits.iter().enumerate() {
        out.com
            .row_mut(i)
            .assign(&Array1::from_vec(fit.com.to_vec()));
        out.r.index_axis_mut(Axis(0), i).assign(&fit.spline.r);
        out.dr.index_axis_mut(Axis(0), i).assign(&fit.spline.dr);
        out.ddr.index_axis_mut(Axis(0), i).assign(&fit.spline.ddr);
        out.dddr.index_axis_mut(Axis(0), i).assign(&fit.spline.dddr);
        out.spl_ds.row_mut(i).assign(&fit.spline.seg_lens);
        out.mass_spl
            .row_mut(i)
            .assign(&Array1::from_vec(fit.mass.clone()));
        out.chord_spl
            .row_mut(i)
            .assign(&Array1::from_vec(fit.chord.clone()));
        out.times_2d.row_mut(i).fill(input.times[i]);
        out.t_coord.row_mut(i).assign(&fit.spline.t_coord);
        out.s_coord.row_mut(i).assign(&fit.spline.s_coord);
        out.spl_len_errors
            .row_mut(i)
            .assign(&Array1::from_vec(fit.len_errors.clone()));
    }

    info!(
        frames = ntime,
        budget,
        landmark = landmark_idx_spl,
        max_len_error_pct = out.max_abs_length_error(),
        "built backbone time series"
    );
    Ok(out)
}
