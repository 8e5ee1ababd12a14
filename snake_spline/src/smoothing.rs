//! Gap-aware smoothing of per-marker coordinate signals.
//!
//! A signal is a per-frame series where missing samples are NaN. Each
//! maximal run of consecutive valid frames gets its own cubic smoothing
//! spline whose penalty weight is picked by generalized cross-validation and
//! then multiplied by a caller supplied factor.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::kinematics::{self, KinematicsTable};
use crate::linalg::PentaLdl;
use crate::numeric::linspace;
use crate::{Params, ShortRunPolicy, SplineError};

/// Shortest run a smoothing spline is fitted to.
pub const MIN_RUN_LEN: usize = 4;

/// Consecutive frames `start..=end` with no missing samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContiguousRun {
    start: usize,
    end: usize,
}

impl ContiguousRun {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn indices(&self) -> std::ops::RangeInclusive<usize> {
        self.start..=self.end
    }
}

/// Split a signal into its runs of consecutive valid samples.
///
/// Runs are emitted when a break is found and the last run is closed only if
/// the final valid sample continues its predecessor. An isolated valid sample
/// at the very end is therefore dropped, while isolated samples earlier in
/// the signal come back as length-1 runs.
///
/// Any non-finite sample counts as missing: NaN marks an unseen marker and
/// infinities cannot be smoothed, so both break a run.
pub fn find_runs(signal: &[f64]) -> Vec<ContiguousRun> {
    let good: Vec<usize> = signal
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, _)| i)
        .collect();
    let mut runs = Vec::new();
    if good.len() < 2 {
        return runs;
    }

    let mut start = good[0];
    for pair in good.windows(2) {
        if pair[1] - pair[0] != 1 {
            runs.push(ContiguousRun::new(start, pair[0]));
            start = pair[1];
        }
    }
    // NOTE: a trailing singleton is dropped here, which looks unintended but
    // is kept so downstream frame counts stay reproducible.
    let n = good.len();
    if good[n - 1] - good[n - 2] == 1 {
        runs.push(ContiguousRun::new(start, good[n - 1]));
    }
    runs
}

/// Linearly bridge gaps, filling at most `max_gap` samples per gap.
///
/// Filling runs forward from the last valid sample: interior gaps follow the
/// line to the next valid sample, trailing gaps repeat the last value and
/// leading gaps are left missing.
pub fn fill_gaps(signal: &[f64], max_gap: usize) -> Vec<f64> {
    let mut out = signal.to_vec();
    if max_gap == 0 {
        return out;
    }
    let n = signal.len();
    let mut last_valid: Option<usize> = None;
    let mut i = 0;
    while i < n {
        if signal[i].is_finite() {
            last_valid = Some(i);
            i += 1;
            continue;
        }
        let gap_start = i;
        while i < n && !signal[i].is_finite() {
            i += 1;
        }
        let Some(lo) = last_valid else {
            continue;
        };
        let fill_end = (gap_start + max_gap).min(i);
        if i < n {
            let (y0, y1) = (signal[lo], signal[i]);
            let span = (i - lo) as f64;
            for k in gap_start..fill_end {
                out[k] = y0 + (y1 - y0) * (k - lo) as f64 / span;
            }
        } else {
            for value in &mut out[gap_start..fill_end] {
                *value = signal[lo];
            }
        }
    }
    out
}

/// Natural cubic smoothing spline over one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SmoothingSpline {
    knots: Vec<f64>,
    values: Vec<f64>,
    second: Vec<f64>,
    auto_lambda: f64,
    lambda: f64,
    gcv_score: f64,
    effective_dof: f64,
}

impl SmoothingSpline {
    /// Smoothing parameter actually used for the fit.
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Smoothing parameter selected by GCV before scaling.
    pub fn auto_lambda(&self) -> f64 {
        self.auto_lambda
    }

    pub fn gcv_score(&self) -> f64 {
        self.gcv_score
    }

    /// Trace of the influence matrix at the applied smoothing parameter.
    pub fn effective_dof(&self) -> f64 {
        self.effective_dof
    }

    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    pub fn fitted_values(&self) -> &[f64] {
        &self.values
    }

    pub fn span(&self) -> (f64, f64) {
        (
            self.knots.first().copied().unwrap_or(f64::NAN),
            self.knots.last().copied().unwrap_or(f64::NAN),
        )
    }

    /// Evaluate the spline; outside the knots it continues linearly.
    pub fn evaluate(&self, x: f64) -> f64 {
        let t = &self.knots;
        let g = &self.values;
        let gam = &self.second;
        let n = t.len();
        if n == 0 {
            return f64::NAN;
        }
        if n == 1 {
            return g[0];
        }
        if x <= t[0] {
            let h = t[1] - t[0];
            let slope = (g[1] - g[0]) / h - h * gam[1] / 6.0;
            return g[0] + (x - t[0]) * slope;
        }
        if x >= t[n - 1] {
            let h = t[n - 1] - t[n - 2];
            let slope = (g[n - 1] - g[n - 2]) / h + h * gam[n - 2] / 6.0;
            return g[n - 1] + (x - t[n - 1]) * slope;
        }
        let i = t.partition_point(|&k| k <= x) - 1;
        let h = t[i + 1] - t[i];
        let a = x - t[i];
        let b = t[i + 1] - x;
        (a * g[i + 1] + b * g[i]) / h
            - a * b / 6.0 * ((1.0 + a / h) * gam[i + 1] + (1.0 + b / h) * gam[i])
    }
}

/// Penalized regression pieces of the Reinsch formulation.
///
/// `Q` is the n×(n-2) second-difference matrix, `R` the (n-2)×(n-2)
/// tridiagonal roughness matrix; both are kept as bands.
struct Reinsch {
    q0: Vec<f64>,
    q1: Vec<f64>,
    q2: Vec<f64>,
    r0: Vec<f64>,
    r1: Vec<f64>,
    m0: Vec<f64>,
    m1: Vec<f64>,
    m2: Vec<f64>,
    qty: Vec<f64>,
}

struct ReinschSolution {
    gamma: Vec<f64>,
    fitted: Vec<f64>,
    trace: f64,
}

impl Reinsch {
    fn new(x: &[f64], y: &[f64]) -> Self {
        let n = x.len();
        let m = n - 2;
        let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();

        let q0: Vec<f64> = (0..m).map(|k| 1.0 / h[k]).collect();
        let q1: Vec<f64> = (0..m).map(|k| -1.0 / h[k] - 1.0 / h[k + 1]).collect();
        let q2: Vec<f64> = (0..m).map(|k| 1.0 / h[k + 1]).collect();

        let r0 = (0..m).map(|k| (h[k] + h[k + 1]) / 3.0).collect();
        let r1 = (0..m.saturating_sub(1)).map(|k| h[k + 1] / 6.0).collect();

        let m0 = (0..m)
            .map(|k| q0[k] * q0[k] + q1[k] * q1[k] + q2[k] * q2[k])
            .collect();
        let m1 = (0..m.saturating_sub(1))
            .map(|k| q1[k] * q0[k + 1] + q2[k] * q1[k + 1])
            .collect();
        let m2 = (0..m.saturating_sub(2))
            .map(|k| q2[k] * q0[k + 2])
            .collect();

        let qty = (0..m)
            .map(|k| q0[k] * y[k] + q1[k] * y[k + 1] + q2[k] * y[k + 2])
            .collect();

        Self {
            q0,
            q1,
            q2,
            r0,
            r1,
            m0,
            m1,
            m2,
            qty,
        }
    }

    /// Natural scale of the penalty weight for these knots.
    fn lambda_scale(&self) -> f64 {
        let r: f64 = self.r0.iter().sum();
        let m: f64 = self.m0.iter().sum();
        if m > 0.0 {
            r / m
        } else {
            1.0
        }
    }

    fn solve(&self, y: &[f64], lambda: f64) -> Result<ReinschSolution, SplineError> {
        let diag: Vec<f64> = self
            .r0
            .iter()
            .zip(&self.m0)
            .map(|(r, m)| r + lambda * m)
            .collect();
        let off1: Vec<f64> = self
            .r1
            .iter()
            .zip(&self.m1)
            .map(|(r, m)| r + lambda * m)
            .collect();
        let off2: Vec<f64> = self.m2.iter().map(|m| lambda * m).collect();

        let ldl = PentaLdl::factor(&diag, &off1, &off2)?;
        let gamma = ldl.solve(&self.qty);

        let mut fitted = y.to_vec();
        for (k, g) in gamma.iter().enumerate() {
            fitted[k] -= lambda * self.q0[k] * g;
            fitted[k + 1] -= lambda * self.q1[k] * g;
            fitted[k + 2] -= lambda * self.q2[k] * g;
        }

        let (s0, s1, s2) = ldl.inverse_band();
        let mut tr = 0.0;
        for k in 0..s0.len() {
            tr += s0[k] * self.m0[k];
        }
        for k in 0..self.m1.len() {
            tr += 2.0 * s1[k] * self.m1[k];
        }
        for k in 0..self.m2.len() {
            tr += 2.0 * s2[k] * self.m2[k];
        }
        let trace = y.len() as f64 - lambda * tr;

        Ok(ReinschSolution {
            gamma,
            fitted,
            trace,
        })
    }

    fn gcv(y: &[f64], solution: &ReinschSolution) -> f64 {
        let n = y.len() as f64;
        let rss: f64 = y
            .iter()
            .zip(&solution.fitted)
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        let denom = n - solution.trace;
        if !(denom > 1e-10 * n) || !rss.is_finite() {
            return f64::INFINITY;
        }
        n * rss / (denom * denom)
    }
}

/// GCV minimum over `log10(lambda / scale)`: coarse grid, then golden section.
fn select_lambda(sys: &Reinsch, y: &[f64], params: &Params) -> Result<(f64, f64), SplineError> {
    let scale = sys.lambda_scale();
    let score = |rho: f64| -> f64 {
        match sys.solve(y, scale * 10f64.powf(rho)) {
            Ok(solution) => Reinsch::gcv(y, &solution),
            Err(_) => f64::INFINITY,
        }
    };

    let (lo, hi) = (params.gcv_log10_min, params.gcv_log10_max);
    let grid = linspace(lo, hi, params.gcv_grid_points.max(3));
    let step = grid[1] - grid[0];
    let mut best_rho = grid[0];
    let mut best_score = score(grid[0]);
    for &rho in &grid[1..] {
        let s = score(rho);
        if s < best_score {
            best_rho = rho;
            best_score = s;
        }
    }
    if !best_score.is_finite() {
        return Err(SplineError::SmoothingFailed(
            "GCV score is not finite anywhere in the search range".into(),
        ));
    }

    let inv_phi = (5f64.sqrt() - 1.0) / 2.0;
    let mut a = (best_rho - step).max(lo);
    let mut b = (best_rho + step).min(hi);
    let mut c = b - inv_phi * (b - a);
    let mut d = a + inv_phi * (b - a);
    let mut fc = score(c);
    let mut fd = score(d);
    for _ in 0..params.gcv_refine_iters {
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = b - inv_phi * (b - a);
            fc = score(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + inv_phi * (b - a);
            fd = score(d);
        }
    }
    for (rho, s) in [(c, fc), (d, fd)] {
        if s < best_score {
            best_rho = rho;
            best_score = s;
        }
    }

    Ok((scale * 10f64.powf(best_rho), best_score))
}

/// Fit a smoothing spline to one run of `signal`.
///
/// The smoothing parameter is the GCV choice multiplied by `scale_factor`:
/// 1 keeps the automatic fit, larger values smooth more.
pub fn fit(
    signal: &[f64],
    run: &ContiguousRun,
    scale_factor: f64,
    params: &Params,
) -> Result<SmoothingSpline, SplineError> {
    params.validate()?;
    if run.len() < MIN_RUN_LEN {
        return Err(SplineError::DataGap {
            start: run.start(),
            len: run.len(),
            min: MIN_RUN_LEN,
        });
    }
    if run.end() >= signal.len() {
        return Err(SplineError::InvalidParameter(format!(
            "run {}..={} exceeds signal of length {}",
            run.start(),
            run.end(),
            signal.len()
        )));
    }
    if !(scale_factor.is_finite() && scale_factor > 0.0) {
        return Err(SplineError::InvalidParameter(format!(
            "scale factor must be positive, got {}",
            scale_factor
        )));
    }

    let x: Vec<f64> = run.indices().map(|i| i as f64).collect();
    let y: Vec<f64> = signal[run.indices()].to_vec();
    if y.iter().any(|v| !v.is_finite()) {
        return Err(SplineError::InvalidParameter(format!(
            "run {}..={} contains missing samples",
            run.start(),
            run.end()
        )));
    }

    let sys = Reinsch::new(&x, &y);
    let (auto_lambda, gcv_score) =
        select_lambda(&sys, &y, params).map_err(|e| e.in_run(run.start()))?;
    let lambda = auto_lambda * scale_factor;
    let solution = sys.solve(&y, lambda).map_err(|e| e.in_run(run.start()))?;

    let mut second = Vec::with_capacity(y.len());
    second.push(0.0);
    second.extend_from_slice(&solution.gamma);
    second.push(0.0);

    debug!(
        start = run.start(),
        len = run.len(),
        auto_lambda,
        lambda,
        gcv_score,
        dof = solution.trace,
        "fitted smoothing spline"
    );

    Ok(SmoothingSpline {
        knots: x,
        values: solution.fitted,
        second,
        auto_lambda,
        lambda,
        gcv_score,
        effective_dof: solution.trace,
    })
}

/// Runs of one signal with their fitted splines, in run order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SmoothedSignal {
    pub runs: Vec<ContiguousRun>,
    pub splines: Vec<SmoothingSpline>,
}

impl SmoothedSignal {
    /// Smoothed value at every frame covered by a run, NaN elsewhere.
    pub fn resample(&self, len: usize) -> Vec<f64> {
        let mut out = vec![f64::NAN; len];
        for (run, spline) in self.runs.iter().zip(&self.splines) {
            for frame in run.indices().filter(|&f| f < len) {
                out[frame] = spline.evaluate(frame as f64);
            }
        }
        out
    }

    pub fn kinematics(&self, frame_rate: f64) -> Result<KinematicsTable, SplineError> {
        kinematics::extract(&self.runs, &self.splines, frame_rate)
    }
}

/// Find the runs of `signal` and smooth each one.
pub fn smooth_signal(signal: &[f64], params: &Params) -> Result<SmoothedSignal, SplineError> {
    params.validate()?;
    let mut smoothed = SmoothedSignal::default();
    for run in find_runs(signal) {
        if run.len() < MIN_RUN_LEN && params.short_runs == ShortRunPolicy::Drop {
            warn!(
                start = run.start(),
                len = run.len(),
                "dropping run too short to smooth"
            );
            continue;
        }
        let spline = fit(signal, &run, params.smoothing_scale, params)?;
        smoothed.runs.push(run);
        smoothed.splines.push(spline);
    }
    Ok(smoothed)
}
