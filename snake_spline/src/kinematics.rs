//! Finite-difference kinematics of smoothed marker signals.

use serde::{Deserialize, Serialize};

use crate::smoothing::{ContiguousRun, SmoothingSpline};
use crate::SplineError;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct KinematicSample {
    pub frame: usize,
    pub time: f64,
    pub position: f64,
    /// `None` on the first and last frame of a run.
    pub velocity: Option<f64>,
    /// `None` on the first and last frame of a run.
    pub acceleration: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KinematicsTable {
    pub samples: Vec<KinematicSample>,
}

impl KinematicsTable {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn times(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.time).collect()
    }

    pub fn positions(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.position).collect()
    }

    pub fn velocities(&self) -> Vec<Option<f64>> {
        self.samples.iter().map(|s| s.velocity).collect()
    }

    pub fn accelerations(&self) -> Vec<Option<f64>> {
        self.samples.iter().map(|s| s.acceleration).collect()
    }
}

fn run_table(run: &ContiguousRun, spline: &SmoothingSpline, frame_rate: f64) -> KinematicsTable {
    let dt = 1.0 / frame_rate;
    let frames: Vec<usize> = run.indices().collect();
    let pos: Vec<f64> = frames.iter().map(|&f| spline.evaluate(f as f64)).collect();
    let last = frames.len() - 1;

    let samples = frames
        .iter()
        .enumerate()
        .map(|(i, &frame)| {
            let (velocity, acceleration) = if i == 0 || i == last {
                (None, None)
            } else {
                (
                    Some((pos[i + 1] - pos[i - 1]) / (2.0 * dt)),
                    Some((pos[i + 1] - 2.0 * pos[i] + pos[i - 1]) / (dt * dt)),
                )
            };
            KinematicSample {
                frame,
                time: frame as f64 / frame_rate,
                position: pos[i],
                velocity,
                acceleration,
            }
        })
        .collect();
    KinematicsTable { samples }
}

/// Sample each run's spline at its frames and difference the positions.
///
/// Runs are concatenated in order without bridging the gaps between them.
pub fn extract(
    runs: &[ContiguousRun],
    splines: &[SmoothingSpline],
    frame_rate: f64,
) -> Result<KinematicsTable, SplineError> {
    if runs.len() != splines.len() {
        return Err(SplineError::InvalidParameter(format!(
            "{} runs but {} splines",
            runs.len(),
            splines.len()
        )));
    }
    if !(frame_rate.is_finite() && frame_rate > 0.0) {
        return Err(SplineError::InvalidParameter(format!(
            "frame rate must be positive, got {}",
            frame_rate
        )));
    }

    let mut tables: Vec<KinematicsTable> = runs
        .iter()
        .zip(splines)
        .map(|(run, spline)| run_table(run, spline, frame_rate))
        .collect();
    if tables.len() == 1 {
        return Ok(tables.remove(0));
    }
    Ok(KinematicsTable {
        samples: tables.into_iter().flat_map(|t| t.samples).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smoothing::{find_runs, fit};
    use crate::Params;

    fn smoothed(signal: &[f64]) -> (Vec<ContiguousRun>, Vec<SmoothingSpline>) {
        let runs = find_runs(signal);
        let splines = runs
            .iter()
            .map(|r| fit(signal, r, 1.0, &Params::default()).unwrap())
            .collect();
        (runs, splines)
    }

    #[test]
    fn test_constant_velocity() {
        let frame_rate = 100.0;
        let signal: Vec<f64> = (0..30).map(|i| 2.0 + 0.3 * i as f64).collect();
        let (runs, splines) = smoothed(&signal);
        let table = extract(&runs, &splines, frame_rate).unwrap();
        assert_eq!(table.len(), 30);

        let undefined_v = table.velocities().iter().filter(|v| v.is_none()).count();
        let undefined_a = table.accelerations().iter().filter(|a| a.is_none()).count();
        assert_eq!(undefined_v, 2);
        assert_eq!(undefined_a, 2);
        assert!(table.samples[0].velocity.is_none());
        assert!(table.samples[29].acceleration.is_none());

        for sample in &table.samples[1..29] {
            assert!((sample.velocity.unwrap() - 30.0).abs() < 1e-6);
            assert!(sample.acceleration.unwrap().abs() < 1e-3);
        }
        assert!((table.samples[10].time - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_runs_concatenated_in_order() {
        let mut signal: Vec<f64> = (0..20).map(|i| i as f64).collect();
        for v in &mut signal[8..11] {
            *v = f64::NAN;
        }
        let (runs, splines) = smoothed(&signal);
        assert_eq!(runs.len(), 2);
        let table = extract(&runs, &splines, 50.0).unwrap();
        assert_eq!(table.len(), 8 + 9);
        let frames: Vec<usize> = table.samples.iter().map(|s| s.frame).collect();
        assert_eq!(frames[7], 7);
        assert_eq!(frames[8], 11);
        assert!(table.samples[7].velocity.is_none());
        assert!(table.samples[8].velocity.is_none());
        assert_eq!(table.velocities().iter().filter(|v| v.is_none()).count(), 4);
    }

    #[test]
    fn test_mismatched_inputs_rejected() {
        let signal: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let (runs, splines) = smoothed(&signal);
        assert!(extract(&runs, &[], 100.0).is_err());
        assert!(extract(&runs, &splines, 0.0).is_err());
        assert!(extract(&[], &[], 100.0).unwrap().is_empty());
    }
}
