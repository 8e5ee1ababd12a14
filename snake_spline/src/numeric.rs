//! Small array helpers shared by the spline stages.

/// `count` evenly spaced values from `start` to `end` inclusive.
///
/// A single value yields `[start]`; the last value is exactly `end`.
pub fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (count as f64 - 1.0);
            let mut out: Vec<f64> = (0..count).map(|i| start + step * i as f64).collect();
            out[count - 1] = end;
            out
        }
    }
}

/// Numerical gradient with unit sample spacing.
///
/// Interior points use central differences, the two edges use second-order
/// one-sided differences when at least three samples are available.
pub fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        2 => {
            let d = values[1] - values[0];
            vec![d, d]
        }
        _ => {
            let mut out = vec![0.0; n];
            out[0] = (-3.0 * values[0] + 4.0 * values[1] - values[2]) / 2.0;
            for i in 1..n - 1 {
                out[i] = (values[i + 1] - values[i - 1]) / 2.0;
            }
            out[n - 1] = (3.0 * values[n - 1] - 4.0 * values[n - 2] + values[n - 3]) / 2.0;
            out
        }
    }
}

/// Linear lookup in an increasing table, clamped to the edge values.
pub fn interp(target: f64, xs: &[f64], ys: &[f64]) -> f64 {
    let len = xs.len().min(ys.len());
    if len == 0 {
        return f64::NAN;
    }
    if target <= xs[0] {
        return ys[0];
    }
    if target >= xs[len - 1] {
        return ys[len - 1];
    }
    let hi = xs[..len].partition_point(|&x| x <= target);
    let lo = hi - 1;
    let (x0, x1) = (xs[lo], xs[hi]);
    let (y0, y1) = (ys[lo], ys[hi]);
    if (x1 - x0).abs() < f64::EPSILON {
        return y1;
    }
    y0 + (y1 - y0) * (target - x0) / (x1 - x0)
}

pub fn cumsum(values: &[f64]) -> Vec<f64> {
    let mut total = 0.0;
    values
        .iter()
        .map(|v| {
            total += v;
            total
        })
        .collect()
}
