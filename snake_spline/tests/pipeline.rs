use ndarray::Array3;
use snake_spline::backbone::marker_positions;
use snake_spline::{
    build_time_series, fill_gaps, global_natural_spline, smooth_signal, MarkerMetadata, Params,
    Profile, TrialInput,
};

const FRAME_RATE: f64 = 100.0;
const NTIME: usize = 60;
const XS: [f64; 7] = [0.0, 5.0, 20.0, 40.0, 60.0, 80.0, 100.0];

fn truth(frame: usize, marker: usize, axis: usize) -> f64 {
    let f = frame as f64;
    let x = XS[marker];
    match axis {
        0 => x + 3.0 * f,
        1 => 8.0 * (0.06 * x - 0.1 * f).sin(),
        _ => 50.0 - 0.5 * f,
    }
}

struct Noise(u64);

impl Noise {
    fn next(&mut self, amp: f64) -> f64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        let unit = (self.0 >> 11) as f64 / (1u64 << 53) as f64;
        amp * (2.0 * unit - 1.0)
    }
}

fn raw_signal(marker: usize, axis: usize, noise: &mut Noise) -> Vec<f64> {
    (0..NTIME)
        .map(|f| {
            if marker == 3 && (20..24).contains(&f) {
                f64::NAN
            } else {
                truth(f, marker, axis) + noise.next(0.2)
            }
        })
        .collect()
}

#[test]
fn smoothing_to_time_series() {
    let mut params = Params::default();
    params.fill_gap_sec = 0.1;
    params.resample_budget = 100;
    let gap_frames = params.fill_gap_frames(FRAME_RATE);
    assert_eq!(gap_frames, 10);

    let mut noise = Noise(0x9e37_79b9_7f4a_7c15);
    let mut frames = Array3::<f64>::zeros((NTIME, XS.len(), 3));
    for marker in 0..XS.len() {
        for axis in 0..3 {
            let raw = raw_signal(marker, axis, &mut noise);
            let filled = fill_gaps(&raw, gap_frames);
            assert!(filled.iter().all(|v| v.is_finite()));

            let smoothed = smooth_signal(&filled, &params).unwrap();
            assert_eq!(smoothed.runs.len(), 1);
            let positions = smoothed.resample(NTIME);
            for (f, value) in positions.iter().enumerate() {
                assert!(
                    (value - truth(f, marker, axis)).abs() < 1.0,
                    "marker {} axis {} frame {}",
                    marker,
                    axis,
                    f
                );
                frames[[f, marker, axis]] = *value;
            }

            if axis == 0 {
                let table = smoothed.kinematics(FRAME_RATE).unwrap();
                let defined: Vec<f64> = table.velocities().into_iter().flatten().collect();
                assert_eq!(defined.len(), NTIME - 2);
                let mean = defined.iter().sum::<f64>() / defined.len() as f64;
                assert!((mean - 300.0).abs() < 6.0, "mean velocity {}", mean);
            }
        }
    }

    let input = TrialInput {
        frames,
        arclen_guess: vec![5.0, 15.0, 20.0, 20.0, 20.0, 20.0],
        times: (0..NTIME).map(|f| f as f64 / FRAME_RATE).collect(),
        mass: 55.0,
        metadata: MarkerMetadata {
            dist_btn_markers: vec![21.0; 5],
            landmark_index: 4,
            svl: 85.0,
            tail_length: 15.0,
            virtual_marker: Some(1),
        },
        density: Profile::new(vec![0.0, 1.2], vec![1.0, 1.0]).unwrap(),
        chord: Profile::new(vec![0.0, 1.2], vec![0.03, 0.01]).unwrap(),
    };
    let series = build_time_series(&input, &params).unwrap();
    assert_eq!(series.ntime(), NTIME);
    assert_eq!(series.landmark_idx_spl, series.idx_pts[4]);
    for f in 0..NTIME {
        assert!((series.mass_spl.row(f).sum() - 55.0).abs() < 1e-9);
    }

    let first = input.frames.index_axis(ndarray::Axis(0), 0).to_owned();
    let spline = global_natural_spline(&first, &input.arclen_guess, 100).unwrap();
    let back = marker_positions(&spline);
    for i in 0..XS.len() {
        for k in 0..3 {
            assert!((back[[i, k]] - first[[i, k]]).abs() < 1e-8);
        }
    }
}
