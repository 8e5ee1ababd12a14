use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use ndarray::Array3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use snake_spline::{
    build_time_series, fill_gaps, smooth_signal, BackboneTimeSeries, KinematicsTable,
    MarkerMetadata, Params, Profile, ProfileCoordinate, ShortRunPolicy, TrialInput,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const AXES: [&str; 3] = ["x", "y", "z"];

#[derive(Parser, Debug)]
#[command(author, version, about = "Snake backbone reconstruction CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Smooth every marker coordinate and write per-marker kinematics
    Smooth(SmoothArgs),
    /// Fit the global backbone spline to every frame of a trial
    Backbone(BackboneArgs),
}

#[derive(Parser, Debug)]
struct SmoothArgs {
    /// Trial JSON with `frame_rate` and `positions`
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output kinematics CSV path (`-` for stdout)
    #[arg(short, long, default_value = "kinematics.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Write the trial back with smoothed positions (gaps stay null)
    #[arg(long, value_hint = ValueHint::FilePath)]
    positions_out: Option<PathBuf>,

    /// Multiplier applied to the GCV smoothing parameter
    #[arg(long)]
    scale: Option<f64>,

    /// Bridge gaps up to this many seconds by linear interpolation
    #[arg(long)]
    fill_gap_sec: Option<f64>,

    /// Drop runs too short to smooth instead of failing
    #[arg(long, action = ArgAction::SetTrue)]
    drop_short_runs: bool,

    /// Parameter JSON overriding the defaults
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct BackboneArgs {
    /// Trial JSON with positions, arc-length guess, mass, metadata and profiles
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output JSON report path (`-` for stdout)
    #[arg(short, long, default_value = "backbone.json", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Number of resample points along the body
    #[arg(long)]
    budget: Option<usize>,

    /// Coordinate used to look up density and chord profiles
    #[arg(long, value_enum)]
    profile_coordinate: Option<CoordinateOpt>,

    /// Fit frames one after another instead of in parallel
    #[arg(long, action = ArgAction::SetTrue)]
    sequential: bool,

    /// Parameter JSON overriding the defaults
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CoordinateOpt {
    Parameter,
    ArcLength,
}

impl From<CoordinateOpt> for ProfileCoordinate {
    fn from(value: CoordinateOpt) -> Self {
        match value {
            CoordinateOpt::Parameter => ProfileCoordinate::Parameter,
            CoordinateOpt::ArcLength => ProfileCoordinate::ArcLength,
        }
    }
}

/// Trial as handed over by the ingestion and alignment stages.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct TrialFile {
    frame_rate: f64,
    /// frames × markers × xyz, `null` where the marker was not seen
    positions: Vec<Vec<[Option<f64>; 3]>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    times: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arclen_guess: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mass: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<MarkerMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    density: Option<Profile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chord: Option<Profile>,
}

impl TrialFile {
    fn markers(&self) -> usize {
        self.positions.first().map(|f| f.len()).unwrap_or(0)
    }

    fn signal(&self, marker: usize, axis: usize) -> Vec<f64> {
        self.positions
            .iter()
            .map(|frame| frame[marker][axis].unwrap_or(f64::NAN))
            .collect()
    }
}

#[derive(Serialize)]
struct BackboneReport<'a> {
    generated_at: String,
    source: String,
    params: &'a Params,
    params_hash: String,
    series: &'a BackboneTimeSeries,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Smooth(args) => args.verbose,
        Command::Backbone(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Smooth(args) => handle_smooth(args),
        Command::Backbone(args) => handle_backbone(args),
    }
}

fn load_params(path: Option<&PathBuf>) -> Result<Params> {
    let params = match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("{} is not a valid parameter file", path.display()))?
        }
        None => Params::default(),
    };
    Ok(params)
}

fn load_trial(path: &Path) -> Result<TrialFile> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read trial {}", path.display()))?;
    let trial: TrialFile = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid trial file", path.display()))?;
    if trial.positions.is_empty() {
        return Err(anyhow!("{} has no frames", path.display()));
    }
    let markers = trial.markers();
    if let Some(frame) = trial.positions.iter().position(|f| f.len() != markers) {
        return Err(anyhow!(
            "frame {} has {} markers, expected {}",
            frame,
            trial.positions[frame].len(),
            markers
        ));
    }
    if !(trial.frame_rate.is_finite() && trial.frame_rate > 0.0) {
        return Err(anyhow!("frame rate must be positive, got {}", trial.frame_rate));
    }
    Ok(trial)
}

struct SignalResult {
    marker: usize,
    axis: usize,
    table: KinematicsTable,
    smoothed: Vec<f64>,
}

fn handle_smooth(args: SmoothArgs) -> Result<()> {
    let mut params = load_params(args.config.as_ref())?;
    if let Some(scale) = args.scale {
        params.smoothing_scale = scale;
    }
    if let Some(sec) = args.fill_gap_sec {
        params.fill_gap_sec = sec;
    }
    if args.drop_short_runs {
        params.short_runs = ShortRunPolicy::Drop;
    }
    params.validate()?;

    let trial = load_trial(&args.input)?;
    let gap_frames = params.fill_gap_frames(trial.frame_rate);
    let nframes = trial.positions.len();
    info!(
        "Smoothing {} markers over {} frames (gap fill {} frames, scale {})",
        trial.markers(),
        nframes,
        gap_frames,
        params.smoothing_scale
    );

    let tasks: Vec<(usize, usize)> = (0..trial.markers())
        .flat_map(|m| (0..3).map(move |a| (m, a)))
        .collect();
    let results = tasks
        .par_iter()
        .map(|&(marker, axis)| -> Result<SignalResult> {
            let raw = trial.signal(marker, axis);
            let filled = fill_gaps(&raw, gap_frames);
            let smoothed = smooth_signal(&filled, &params).with_context(|| {
                format!("failed to smooth marker {} axis {}", marker, AXES[axis])
            })?;
            let table = smoothed.kinematics(trial.frame_rate)?;
            if smoothed.runs.is_empty() {
                warn!("Marker {} axis {} has no usable runs", marker, AXES[axis]);
            }
            Ok(SignalResult {
                marker,
                axis,
                table,
                smoothed: smoothed.resample(nframes),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut writer = csv::Writer::from_writer(stdout.lock());
        write_kinematics_rows(&results, &mut writer)?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        write_kinematics_rows(&results, &mut writer)?;
        info!("Wrote kinematics CSV: {}", args.output.display());
    }

    if let Some(path) = args.positions_out.as_ref() {
        let mut out = trial.clone();
        for result in &results {
            for (frame, value) in result.smoothed.iter().enumerate() {
                out.positions[frame][result.marker][result.axis] =
                    value.is_finite().then_some(*value);
            }
        }
        let json = serde_json::to_string(&out)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote smoothed positions: {}", path.display());
    }
    Ok(())
}

fn write_kinematics_rows<W: Write>(
    results: &[SignalResult],
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "marker",
        "axis",
        "frame",
        "time_s",
        "position",
        "velocity",
        "acceleration",
    ])?;
    let fmt = |v: Option<f64>| v.map(|x| format!("{:.6}", x)).unwrap_or_default();
    for result in results {
        for sample in &result.table.samples {
            writer.write_record([
                result.marker.to_string(),
                AXES[result.axis].to_string(),
                sample.frame.to_string(),
                format!("{:.6}", sample.time),
                format!("{:.6}", sample.position),
                fmt(sample.velocity),
                fmt(sample.acceleration),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn trial_input(trial: TrialFile) -> Result<TrialInput> {
    let nframes = trial.positions.len();
    let markers = trial.markers();
    let mut frames = Array3::<f64>::from_elem((nframes, markers, 3), f64::NAN);
    for (f, frame) in trial.positions.iter().enumerate() {
        for (m, xyz) in frame.iter().enumerate() {
            for (a, value) in xyz.iter().enumerate() {
                if let Some(v) = value {
                    frames[[f, m, a]] = *v;
                }
            }
        }
    }
    let times = trial.times.unwrap_or_else(|| {
        (0..nframes)
            .map(|f| f as f64 / trial.frame_rate)
            .collect()
    });
    Ok(TrialInput {
        frames,
        arclen_guess: trial
            .arclen_guess
            .ok_or_else(|| anyhow!("trial is missing `arclen_guess`"))?,
        times,
        mass: trial.mass.ok_or_else(|| anyhow!("trial is missing `mass`"))?,
        metadata: trial
            .metadata
            .ok_or_else(|| anyhow!("trial is missing `metadata`"))?,
        density: trial
            .density
            .ok_or_else(|| anyhow!("trial is missing `density`"))?,
        chord: trial
            .chord
            .ok_or_else(|| anyhow!("trial is missing `chord`"))?,
    })
}

fn handle_backbone(args: BackboneArgs) -> Result<()> {
    let mut params = load_params(args.config.as_ref())?;
    if let Some(budget) = args.budget {
        params.resample_budget = budget;
    }
    if let Some(coord) = args.profile_coordinate {
        params.profile_coordinate = coord.into();
    }
    if args.sequential {
        params.parallel = false;
    }
    params.validate()?;

    let t_load = Instant::now();
    let trial = load_trial(&args.input)?;
    let input = trial_input(trial)
        .with_context(|| format!("{} cannot be used for backbone fitting", args.input.display()))?;
    if args.profile || args.verbose {
        info!(
            "Load stage: {:.1} ms",
            t_load.elapsed().as_secs_f64() * 1000.0
        );
    }

    let t_fit = Instant::now();
    let series = build_time_series(&input, &params)
        .with_context(|| format!("backbone fit failed for {}", args.input.display()))?;
    if args.profile || args.verbose {
        info!(
            "Fit stage: {:.1} ms ({} frames)",
            t_fit.elapsed().as_secs_f64() * 1000.0,
            series.ntime()
        );
    }
    info!(
        "Backbone fitted: {} frames, landmark at point {}, max length error {:.2}% SVL",
        series.ntime(),
        series.landmark_idx_spl,
        series.max_abs_length_error()
    );

    let report = BackboneReport {
        generated_at: Utc::now().to_rfc3339(),
        source: args.input.display().to_string(),
        params: &params,
        params_hash: params.params_hash_sha256()?,
        series: &series,
    };
    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        serde_json::to_writer(stdout.lock(), &report)?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        serde_json::to_writer(io::BufWriter::new(file), &report)?;
        info!("Wrote backbone report: {}", args.output.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trial_json() -> String {
        let frames: Vec<String> = (0..3)
            .map(|f| {
                let y = if f == 1 { "null".to_string() } else { "0.0".to_string() };
                format!(
                    "[[{}, {}, 0.0], [{}, 0.0, 0.0], [{}, 0.0, 0.0]]",
                    f as f64,
                    y,
                    10.0 + f as f64,
                    20.0 + f as f64
                )
            })
            .collect();
        format!(
            r#"{{
                "frame_rate": 100.0,
                "positions": [{}],
                "arclen_guess": [10.0, 10.0],
                "mass": 30.0,
                "metadata": {{
                    "dist_btn_markers": [10.0],
                    "landmark_index": 1,
                    "svl": 20.0,
                    "tail_length": 0.0,
                    "virtual_marker": null
                }},
                "density": {{"s": [0.0, 1.0], "values": [1.0, 1.0]}},
                "chord": {{"s": [0.0, 1.0], "values": [0.02, 0.02]}}
            }}"#,
            frames.join(",")
        )
    }

    #[test]
    fn missing_coordinates_become_nan() {
        let trial: TrialFile = serde_json::from_str(&trial_json()).unwrap();
        assert_eq!(trial.markers(), 3);
        let y = trial.signal(0, 1);
        assert_eq!(y[0], 0.0);
        assert!(y[1].is_nan());

        let input = trial_input(trial).unwrap();
        assert_eq!(input.frames.dim(), (3, 3, 3));
        assert!(input.frames[[1, 0, 1]].is_nan());
        assert_eq!(input.frames[[2, 2, 0]], 22.0);
        assert!((input.times[2] - 0.02).abs() < 1e-12);
    }

    #[test]
    fn backbone_requires_body_description() {
        let mut trial: TrialFile = serde_json::from_str(&trial_json()).unwrap();
        trial.mass = None;
        let err = trial_input(trial).unwrap_err();
        assert!(err.to_string().contains("mass"));
    }

    #[test]
    fn cli_overrides_parse() {
        let cli = Cli::try_parse_from([
            "snake-spline",
            "backbone",
            "trial.json",
            "--budget",
            "150",
            "--profile-coordinate",
            "arc-length",
            "--sequential",
        ])
        .unwrap();
        match cli.command {
            Command::Backbone(args) => {
                assert_eq!(args.budget, Some(150));
                assert!(matches!(
                    args.profile_coordinate,
                    Some(CoordinateOpt::ArcLength)
                ));
                assert!(args.sequential);
            }
            Command::Smooth(_) => panic!("parsed the wrong subcommand"),
        }
    }
}
