//! Global natural cubic spline through one frame of backbone markers.
//!
//! The tangent at every marker comes from one joint linear solve, so slope
//! and curvature are continuous at interior markers. Segment `j` is
//! parameterized by `0..=t[j]`, where `t` is the arc-length guess between
//! markers; the guess does not have to match the true arc length and can be
//! tuned to shape the tangents.

use ndarray::{s, Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::linalg::solve_dense;
use crate::numeric::{cumsum, gradient, linspace};
use crate::SplineError;

/// Resampled spline for one frame. Geometric arrays have one row per resample point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackboneSpline {
    /// Position.
    pub r: Array2<f64>,
    /// First derivative with respect to the spline parameter.
    pub dr: Array2<f64>,
    pub ddr: Array2<f64>,
    pub dddr: Array2<f64>,
    /// Cumulative spline parameter at each resample point.
    pub t_coord: Array1<f64>,
    /// Cumulative integrated arc length at each resample point.
    pub s_coord: Array1<f64>,
    /// Arc length attributed to each resample point.
    pub seg_lens: Array1<f64>,
    /// Integrated arc length of each marker-to-marker segment.
    pub lengths_total: Array1<f64>,
    /// Resample index of markers `1..n`.
    pub idx_pts: Vec<usize>,
}

impl BackboneSpline {
    pub fn len(&self) -> usize {
        self.t_coord.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t_coord.is_empty()
    }
}

/// Resample points per segment, proportional to the arc-length guess.
///
/// Shares are rounded half-to-even and whatever residue remains is taken
/// from or given to the last segment only. Every segment must keep at least
/// one point (two for the last one) so each marker lands on its own sample.
/// This is stricter than only rejecting `budget < segments`: a budget of
/// exactly one point per segment is refused with `BudgetMismatch`, since
/// the final marker would then have no sample of its own.
pub fn allocate_points(arclen_guess: &[f64], budget: usize) -> Result<Vec<usize>, SplineError> {
    let nseg = arclen_guess.len();
    if nseg == 0 {
        return Err(SplineError::InvalidParameter(
            "arc-length guess needs at least one segment".into(),
        ));
    }
    if budget < nseg + 1 {
        return Err(SplineError::BudgetMismatch {
            budget,
            reason: format!("{} segments need at least {} points", nseg, nseg + 1),
        });
    }

    let total: f64 = arclen_guess.iter().sum();
    let per_point = total / budget as f64;
    let mut counts: Vec<i64> = arclen_guess
        .iter()
        .map(|t| (t / per_point).round_ties_even() as i64)
        .collect();
    let allocated: i64 = counts.iter().sum();
    counts[nseg - 1] += budget as i64 - allocated;

    let last_min = if nseg == 1 { budget as i64 } else { 2 };
    if let Some(j) = counts[..nseg - 1].iter().position(|&c| c < 1) {
        return Err(SplineError::BudgetMismatch {
            budget,
            reason: format!("segment {} gets {} points", j, counts[j]),
        });
    }
    if counts[nseg - 1] < last_min {
        return Err(SplineError::BudgetMismatch {
            budget,
            reason: format!(
                "last segment left with {} points after residue adjustment",
                counts[nseg - 1]
            ),
        });
    }
    Ok(counts.into_iter().map(|c| c as usize).collect())
}

fn validate(markers: &Array2<f64>, arclen_guess: &[f64]) -> Result<(), SplineError> {
    let (n, dim) = markers.dim();
    if dim != 3 {
        return Err(SplineError::InvalidParameter(format!(
            "markers must have 3 columns, got {}",
            dim
        )));
    }
    if n < 2 {
        return Err(SplineError::InvalidParameter(format!(
            "need at least 2 markers, got {}",
            n
        )));
    }
    if arclen_guess.len() != n - 1 {
        return Err(SplineError::InvalidParameter(format!(
            "{} markers need {} arc-length guesses, got {}",
            n,
            n - 1,
            arclen_guess.len()
        )));
    }
    if let Some((marker, _)) = markers
        .outer_iter()
        .enumerate()
        .find(|(_, row)| row.iter().any(|v| !v.is_finite()))
    {
        return Err(SplineError::NonFiniteMarker { marker });
    }
    if let Some((j, t)) = arclen_guess
        .iter()
        .enumerate()
        .find(|(_, t)| !(t.is_finite() && **t > 0.0))
    {
        return Err(SplineError::SingularSystem(format!(
            "arc-length guess {} for segment {} is not positive",
            t, j
        )));
    }
    Ok(())
}

/// Tangent vectors at every marker from `D · m = C · p`.
///
/// Rows `0..n-2` match first and second derivatives across interior markers,
/// the last two rows hold the natural end conditions.
fn solve_tangents(p: &Array2<f64>, t: &[f64]) -> Result<Array2<f64>, SplineError> {
    let n = p.nrows();
    let mut c = Array2::<f64>::zeros((n, n));
    let mut d = Array2::<f64>::zeros((n, n));

    for j in 0..n.saturating_sub(2) {
        d[[j, j]] = t[j + 1];
        d[[j, j + 1]] = 2.0 * (t[j + 1] + t[j]);
        d[[j, j + 2]] = t[j];

        c[[j, j]] = 3.0 * (-t[j + 1] / t[j]);
        c[[j, j + 1]] = 3.0 * (t[j + 1] / t[j] - t[j] / t[j + 1]);
        c[[j, j + 2]] = 3.0 * (t[j] / t[j + 1]);
    }

    let t_last = t[n - 2];
    c[[n - 2, 0]] = -3.0 / t[0];
    c[[n - 2, 1]] = 3.0 / t[0];
    c[[n - 1, n - 2]] = -3.0 / t_last;
    c[[n - 1, n - 1]] = 3.0 / t_last;
    d[[n - 2, 0]] = 2.0;
    d[[n - 2, 1]] = 1.0;
    d[[n - 1, n - 2]] = 1.0;
    d[[n - 1, n - 1]] = 2.0;

    solve_dense(&d, &c.dot(p))
}

/// Cubic coefficients of one segment: `a + b·τ + c·τ² + d·τ³`.
struct Segment {
    a: Array1<f64>,
    b: Array1<f64>,
    c: Array1<f64>,
    d: Array1<f64>,
}

impl Segment {
    fn hermite(
        p0: ArrayView1<f64>,
        p1: ArrayView1<f64>,
        m0: ArrayView1<f64>,
        m1: ArrayView1<f64>,
        t: f64,
    ) -> Self {
        let c = (&p1 - &p0) * (3.0 / (t * t)) - (&m0 * 2.0 + &m1) / t;
        let d = (&p0 - &p1) * (2.0 / (t * t * t)) + (&m0 + &m1) / (t * t);
        Self {
            a: p0.to_owned(),
            b: m0.to_owned(),
            c,
            d,
        }
    }

    fn position(&self, tau: f64) -> Array1<f64> {
        &self.a + &(&self.b * tau) + &(&self.c * tau.powi(2)) + &(&self.d * tau.powi(3))
    }

    fn first(&self, tau: f64) -> Array1<f64> {
        &self.b + &(&self.c * (2.0 * tau)) + &(&self.d * (3.0 * tau * tau))
    }

    fn second(&self, tau: f64) -> Array1<f64> {
        &self.c * 2.0 + &(&self.d * (6.0 * tau))
    }

    fn third(&self) -> Array1<f64> {
        &self.d * 6.0
    }
}

/// Fit the global natural spline through `markers` (n × 3) and resample it at
/// exactly `budget` points.
pub fn global_natural_spline(
    markers: &Array2<f64>,
    arclen_guess: &[f64],
    budget: usize,
) -> Result<BackboneSpline, SplineError> {
    validate(markers, arclen_guess)?;
    let n = markers.nrows();
    let t = arclen_guess;

    let m = solve_tangents(markers, t)?;
    let segments: Vec<Segment> = (0..n - 1)
        .map(|j| {
            Segment::hermite(
                markers.row(j),
                markers.row(j + 1),
                m.row(j),
                m.row(j + 1),
                t[j],
            )
        })
        .collect();

    let counts = allocate_points(t, budget)?;
    let nseg = counts.len();
    // Points evaluated per segment; all but the last share their final point
    // with the next segment's skipped first point.
    let eval_counts: Vec<usize> = counts
        .iter()
        .enumerate()
        .map(|(j, &c)| if j + 1 < nseg { c + 1 } else { c })
        .collect();
    let mut idx_pts = Vec::with_capacity(nseg);
    let mut acc = 0usize;
    for &k in &eval_counts {
        acc += k - 1;
        idx_pts.push(acc);
    }

    let mut r = Array2::<f64>::zeros((budget, 3));
    let mut dr = Array2::<f64>::zeros((budget, 3));
    let mut ddr = Array2::<f64>::zeros((budget, 3));
    let mut dddr = Array2::<f64>::zeros((budget, 3));
    let mut t_coord = vec![0.0; budget];

    let mut cnt = 0usize;
    let mut offset = 0.0;
    for (j, seg) in segments.iter().enumerate() {
        let taus = linspace(0.0, t[j], eval_counts[j]);
        let skip = usize::from(j > 0);
        for &tau in taus.iter().skip(skip) {
            if cnt >= budget {
                return Err(SplineError::BudgetMismatch {
                    budget,
                    reason: format!("segment {} overruns the resample array", j),
                });
            }
            r.row_mut(cnt).assign(&seg.position(tau));
            dr.row_mut(cnt).assign(&seg.first(tau));
            ddr.row_mut(cnt).assign(&seg.second(tau));
            dddr.row_mut(cnt).assign(&seg.third());
            t_coord[cnt] = offset + tau;
            cnt += 1;
        }
        offset += t[j];
    }
    if cnt != budget {
        return Err(SplineError::BudgetMismatch {
            budget,
            reason: format!("evaluated {} points", cnt),
        });
    }

    let dts = gradient(&t_coord);
    let seg_lens: Vec<f64> = dr
        .outer_iter()
        .zip(&dts)
        .map(|(row, dt)| row.dot(&row).sqrt() * dt)
        .collect();
    let s_coord = cumsum(&seg_lens);

    let mut lengths_total = Array1::<f64>::zeros(nseg);
    let mut i0 = 0usize;
    for (j, &c) in counts.iter().enumerate() {
        let i1 = i0 + c;
        if i1 > budget {
            return Err(SplineError::BudgetMismatch {
                budget,
                reason: format!("segment {} integrates past point {}", j, budget),
            });
        }
        lengths_total[j] = seg_lens[i0..i1].iter().sum();
        i0 = i1;
    }

    Ok(BackboneSpline {
        r,
        dr,
        ddr,
        dddr,
        t_coord: Array1::from_vec(t_coord),
        s_coord: Array1::from_vec(s_coord),
        seg_lens: Array1::from_vec(seg_lens),
        lengths_total,
        idx_pts,
    })
}

/// Position of every marker read back from the resampled spline.
pub fn marker_positions(spline: &BackboneSpline) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((spline.idx_pts.len() + 1, 3));
    out.row_mut(0).assign(&spline.r.row(0));
    for (k, &idx) in spline.idx_pts.iter().enumerate() {
        out.row_mut(k + 1).assign(&spline.r.slice(s![idx, ..]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn helix(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 3), |(i, k)| {
            let a = i as f64 * 0.6;
            match k {
                0 => 40.0 * a.cos(),
                1 => 40.0 * a.sin(),
                _ => 5.0 * i as f64,
            }
        })
    }

    fn chord_lengths(p: &Array2<f64>) -> Vec<f64> {
        (0..p.nrows() - 1)
            .map(|j| {
                let d = &p.row(j + 1) - &p.row(j);
                d.dot(&d).sqrt()
            })
            .collect()
    }

    #[test]
    fn test_straight_line_scenario() {
        let p = array![[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [20.0, 0.0, 0.0]];
        let spl = global_natural_spline(&p, &[10.0, 10.0], 21).unwrap();
        assert_eq!(spl.len(), 21);
        assert_eq!(spl.idx_pts, vec![10, 20]);
        assert!((spl.r[[10, 0]] - 10.0).abs() < 1e-9);
        assert!(spl.r[[10, 1]].abs() < 1e-9);
        assert!(spl.r[[10, 2]].abs() < 1e-9);
        for i in 0..21 {
            assert!((spl.r[[i, 0]] - i as f64).abs() < 1e-9);
            assert!((spl.dr[[i, 0]] - 1.0).abs() < 1e-9);
            assert!(spl.ddr[[i, 0]].abs() < 1e-9);
        }
        // Points are counted 10 and 11 after the residue goes to the last segment.
        assert!((spl.lengths_total[0] - 10.0).abs() < 1e-9);
        assert!((spl.lengths_total[1] - 11.0).abs() < 1e-9);
        assert!((spl.s_coord[20] - 21.0).abs() < 1e-9);
        assert!((spl.t_coord[20] - 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_allocation_sums_to_budget() {
        let guesses: [&[f64]; 5] = [
            &[10.0, 10.0],
            &[1.0, 2.0, 3.0, 4.0],
            &[7.3, 0.9, 12.1, 3.3, 3.3, 5.0],
            &[100.0],
            &[0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5],
        ];
        for guess in guesses {
            for budget in [guess.len() + 20, 57, 200, 1001] {
                let counts = allocate_points(guess, budget).unwrap();
                assert_eq!(counts.iter().sum::<usize>(), budget, "{:?} {}", guess, budget);
            }
        }
    }

    #[test]
    fn test_allocation_residue_on_last_segment() {
        // 10.5 rounds to 10 twice, the missing point goes to the last segment.
        assert_eq!(allocate_points(&[10.0, 10.0], 21).unwrap(), vec![10, 11]);
        // 3 x 3.33 rounds to 3 each, residue 1 lands on the last one.
        assert_eq!(allocate_points(&[1.0, 1.0, 1.0], 10).unwrap(), vec![3, 3, 4]);
    }

    #[test]
    fn test_one_point_per_segment_is_refused() {
        assert!(matches!(
            allocate_points(&[1.0, 1.0, 1.0], 3),
            Err(SplineError::BudgetMismatch { budget: 3, .. })
        ));
        assert_eq!(allocate_points(&[1.0, 1.0, 1.0], 4).unwrap(), vec![1, 1, 2]);
    }

    #[test]
    fn test_markers_round_trip() {
        let p = helix(8);
        let guess = chord_lengths(&p);
        let spl = global_natural_spline(&p, &guess, 150).unwrap();
        assert_eq!(spl.len(), 150);
        assert_eq!(spl.idx_pts.len(), 7);
        assert_eq!(*spl.idx_pts.last().unwrap(), 149);
        let back = marker_positions(&spl);
        for i in 0..8 {
            for k in 0..3 {
                assert!((back[[i, k]] - p[[i, k]]).abs() < 1e-8, "marker {} axis {}", i, k);
            }
        }
    }

    #[test]
    fn test_natural_end_conditions_and_continuity() {
        let p = helix(6);
        let guess = chord_lengths(&p);
        let spl = global_natural_spline(&p, &guess, 120).unwrap();
        for k in 0..3 {
            assert!(spl.ddr[[0, k]].abs() < 1e-8);
            assert!(spl.ddr[[119, k]].abs() < 1e-8);
        }
        // Second derivative is continuous across an interior marker.
        let idx = spl.idx_pts[1];
        let segs = solve_tangents(&p, &guess).unwrap();
        let left = Segment::hermite(p.row(1), p.row(2), segs.row(1), segs.row(2), guess[1]);
        let right = Segment::hermite(p.row(2), p.row(3), segs.row(2), segs.row(3), guess[2]);
        let l = left.second(guess[1]);
        let r = right.second(0.0);
        for k in 0..3 {
            assert!((l[k] - r[k]).abs() < 1e-8);
            assert!((spl.ddr[[idx, k]] - l[k]).abs() < 1e-8);
        }
    }

    #[test]
    fn test_lengths_track_arc_length() {
        let p = helix(10);
        let guess = chord_lengths(&p);
        let spl = global_natural_spline(&p, &guess, 400).unwrap();
        let total: f64 = spl.lengths_total.sum();
        assert!((total - spl.s_coord[399]).abs() < 1e-9);
        let chord_total: f64 = guess.iter().sum();
        assert!(total > chord_total * 0.98);
        assert!(total < chord_total * 1.1);
        assert_eq!(spl.seg_lens.len(), 400);
    }

    #[test]
    fn test_two_markers() {
        let p = array![[0.0, 0.0, 0.0], [0.0, 3.0, 4.0]];
        let spl = global_natural_spline(&p, &[5.0], 11).unwrap();
        assert_eq!(spl.idx_pts, vec![10]);
        assert!((spl.r[[10, 1]] - 3.0).abs() < 1e-9);
        assert!((spl.r[[10, 2]] - 4.0).abs() < 1e-9);
        assert!((spl.r[[5, 2]] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_errors() {
        let p = array![[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [20.0, 0.0, 0.0]];
        assert!(matches!(
            global_natural_spline(&p, &[10.0, 0.0], 21),
            Err(SplineError::SingularSystem(_))
        ));
        assert!(matches!(
            global_natural_spline(&p, &[10.0, -1.0], 21),
            Err(SplineError::SingularSystem(_))
        ));
        assert!(matches!(
            global_natural_spline(&p, &[10.0, 10.0], 2),
            Err(SplineError::BudgetMismatch { .. })
        ));
        assert!(matches!(
            global_natural_spline(&p, &[10.0], 21),
            Err(SplineError::InvalidParameter(_))
        ));
        let mut holed = p.clone();
        holed[[1, 2]] = f64::NAN;
        assert!(matches!(
            global_natural_spline(&holed, &[10.0, 10.0], 21),
            Err(SplineError::NonFiniteMarker { marker: 1 })
        ));
    }

    #[test]
    fn test_lopsided_guess_rejected() {
        // The tiny middle segment rounds to zero points.
        assert!(matches!(
            allocate_points(&[100.0, 0.1, 100.0], 20),
            Err(SplineError::BudgetMismatch { .. })
        ));
    }
}
