mod chart;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use indicatif::{ProgressBar, ProgressStyle};
use roadbook::{
    annotate_profile, build_roadbook, parse_track, LocalityResolver, NominatimConfig,
    NominatimGeocoder, Params, PointClassifier, Progress, SegmentRow, ThrottledLookup,
    TimingProjector, TrackPoint,
};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::chart::{render_profile_guard, ChartKind};

#[derive(Parser, Debug)]
#[command(author, version, about = "Road book and elevation profile from a GPX track", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Segment the track by road and write the timing table as CSV
    Roads(RoadsArgs),
    /// Render an annotated elevation profile chart
    Profile(ProfileArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// GPX track to read
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// JSON settings file: {"params": {...}, "geocoder": {...}}
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Minimum seconds between two geocoder calls
    #[arg(long)]
    delay: Option<f64>,

    /// Geocoder request timeout (seconds)
    #[arg(long)]
    timeout: Option<f64>,

    /// Preferred language for place names
    #[arg(long)]
    language: Option<String>,

    /// User agent sent to the geocoder
    #[arg(long)]
    user_agent: Option<String>,

    /// Reverse geocoding endpoint URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Decimal degrees kept in the lookup cache key
    #[arg(long)]
    precision: Option<u32>,

    /// Hide the progress bar
    #[arg(long, action = ArgAction::SetTrue)]
    no_progress: bool,

    /// Log per-stage timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,

    /// Verbose logging
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct RoadsArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "roads.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Also dump blocks, rows and statistics as JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    json: Option<PathBuf>,

    /// Travel speeds in km/h (comma separated)
    #[arg(long)]
    speeds: Option<String>,

    /// Start-of-day time, H:MM
    #[arg(long)]
    start: Option<String>,

    /// Blocks shorter than this many metres are dropped as noise
    #[arg(long)]
    min_block: Option<f64>,

    /// Number of leading blocks kept even when short
    #[arg(long)]
    exempt_leading: Option<usize>,
}

#[derive(Parser, Debug)]
struct ProfileArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Output PNG figure path
    #[arg(long, default_value = "profile.png", value_hint = ValueHint::FilePath)]
    png: PathBuf,

    /// Output SVG figure path
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Also dump the annotations as JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    json: Option<PathBuf>,

    /// Chart title (defaults to the track file name)
    #[arg(long)]
    title: Option<String>,

    /// Resolve one point out of this many for locality labels
    #[arg(long)]
    stride: Option<usize>,

    /// Maximum number of climb markers
    #[arg(long)]
    markers: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    params: Params,
    geocoder: NominatimConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Roads(args) => args.common.verbose,
        Command::Profile(args) => args.common.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Roads(args) => handle_roads(args),
        Command::Profile(args) => handle_profile(args),
    }
}

fn handle_roads(args: RoadsArgs) -> Result<()> {
    let (mut params, geocoder) = load_settings(&args.common)?;
    if let Some(speeds) = args.speeds.as_deref() {
        params.speeds_kmh = parse_speeds(speeds)?;
    }
    if let Some(start) = args.start.clone() {
        params.start_time = start;
    }
    if let Some(min_block) = args.min_block {
        params.min_block_m = min_block;
    }
    if let Some(exempt) = args.exempt_leading {
        params.exempt_leading_blocks = exempt;
    }
    if let Some(precision) = args.common.precision {
        params.segment_precision = precision;
    }
    params.validate()?;
    let timings = args.common.profile || args.common.verbose;

    let t_parse = Instant::now();
    let points = read_track(&args.common.input)?;
    if timings {
        info!(
            "Parse stage: {:.1} ms ({} points)",
            t_parse.elapsed().as_secs_f64() * 1000.0,
            points.len()
        );
    }
    if points.is_empty() {
        warn!("{} contains no track points; nothing written", args.common.input.display());
        return Ok(());
    }

    let lookup = ThrottledLookup::new(
        NominatimGeocoder::new(&geocoder)?,
        geocoder.throttle(),
        geocoder.max_attempts,
    );
    let mut classifier = PointClassifier::new(lookup, params.segment_precision)?;
    let mut progress = BarProgress::new("Classifying", !args.common.no_progress);

    let t_segment = Instant::now();
    let roadbook = build_roadbook(&points, &mut classifier, &params, &mut progress)?;
    if timings {
        info!(
            "Segment stage: {:.1} ms",
            t_segment.elapsed().as_secs_f64() * 1000.0
        );
    }
    info!(
        "Geocoder: {} external calls, {} cached addresses at {} decimals, {} cache hits",
        classifier.lookup().calls(),
        classifier.cache().len(),
        classifier.cache().precision(),
        classifier.cache().hits()
    );
    if roadbook.stats.degraded_lookups > 0 {
        warn!(
            "{} points fell back to the unknown classification",
            roadbook.stats.degraded_lookups
        );
    }

    if let Some(json_path) = args.json.as_ref() {
        write_json(&roadbook, json_path)?;
        info!("Wrote road book JSON: {}", json_path.display());
    }

    if roadbook.rows.is_empty() {
        warn!("No road segment survived filtering; nothing written");
        return Ok(());
    }

    let projector = TimingProjector::new(&params.start_time, &params.speeds_kmh)?;
    if args.output.as_os_str() == "-" {
        write_rows_stdout(&projector, &roadbook.rows)?;
    } else {
        write_rows_csv(&projector, &roadbook.rows, &args.output)?;
        info!(
            "Wrote {} segments over {:.2} km: {}",
            roadbook.rows.len(),
            roadbook.total_km,
            args.output.display()
        );
    }
    Ok(())
}

fn handle_profile(args: ProfileArgs) -> Result<()> {
    let (mut params, geocoder) = load_settings(&args.common)?;
    if let Some(stride) = args.stride {
        params.profile_stride = stride;
    }
    if let Some(markers) = args.markers {
        params.max_climb_markers = markers;
    }
    if let Some(precision) = args.common.precision {
        params.profile_precision = precision;
    }
    params.validate()?;
    let timings = args.common.profile || args.common.verbose;

    let points = read_track(&args.common.input)?;
    if points.is_empty() {
        warn!("{} contains no track points; nothing written", args.common.input.display());
        return Ok(());
    }
    if points.iter().all(|p| p.elevation.is_none()) {
        warn!("{} carries no elevation data", args.common.input.display());
    }

    let lookup = ThrottledLookup::new(
        NominatimGeocoder::new(&geocoder)?,
        geocoder.throttle(),
        geocoder.max_attempts,
    );
    let mut resolver = LocalityResolver::new(lookup, params.profile_precision)?;
    let mut progress = BarProgress::new("Localities", !args.common.no_progress);

    let t_annotate = Instant::now();
    let profile = annotate_profile(&points, &mut resolver, &params, &mut progress)?;
    if timings {
        info!(
            "Annotate stage: {:.1} ms ({} external calls)",
            t_annotate.elapsed().as_secs_f64() * 1000.0,
            resolver.lookup().calls()
        );
    }
    info!(
        "Profile: {:.2} km, {} locality labels, {} climb markers ({} cache hits)",
        profile.total_km,
        profile.labels.len(),
        profile.markers.len(),
        resolver.cache().hits()
    );

    if let Some(json_path) = args.json.as_ref() {
        write_json(&profile, json_path)?;
        info!("Wrote profile JSON: {}", json_path.display());
    }

    let title = args.title.clone().unwrap_or_else(|| default_title(&args.common.input));
    let t_plot = Instant::now();
    let mut targets = vec![(args.png.clone(), ChartKind::Png)];
    if let Some(svg) = args.svg.clone() {
        targets.push((svg, ChartKind::Svg));
    }
    for (path, kind) in targets {
        render_profile_guard(&profile, &title, &path, kind)
            .map_err(|e| anyhow!("failed to render {}: {e}", path.display()))?;
        info!("Wrote plot: {}", path.display());
    }
    if timings {
        info!(
            "Plot stage: {:.1} ms",
            t_plot.elapsed().as_secs_f64() * 1000.0
        );
    }
    Ok(())
}

fn load_settings(common: &CommonArgs) -> Result<(Params, NominatimConfig)> {
    let Settings {
        params,
        mut geocoder,
    } = match common.config.as_ref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse settings {}", path.display()))?
        }
        None => Settings::default(),
    };
    if let Some(delay) = common.delay {
        geocoder.delay_s = delay;
    }
    if let Some(timeout) = common.timeout {
        geocoder.timeout_s = timeout;
    }
    if let Some(language) = common.language.clone() {
        geocoder.language = language;
    }
    if let Some(user_agent) = common.user_agent.clone() {
        geocoder.user_agent = user_agent;
    }
    if let Some(endpoint) = common.endpoint.clone() {
        geocoder.endpoint = endpoint;
    }
    geocoder.validate()?;
    Ok((params, geocoder))
}

fn parse_speeds(input: &str) -> Result<Vec<f64>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .with_context(|| format!("invalid speed '{s}'"))
        })
        .collect()
}

fn read_track(path: &Path) -> Result<Vec<TrackPoint>> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let points =
        parse_track(&data).with_context(|| format!("failed to parse {}", path.display()))?;
    info!("Read {} track points from {}", points.len(), path.display());
    Ok(points)
}

fn default_title(input: &Path) -> String {
    input
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.replace(['_', '-'], " "))
        .unwrap_or_else(|| "Elevation profile".to_string())
}

fn write_json<T: serde::Serialize>(value: &T, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn write_rows_stdout(projector: &TimingProjector, rows: &[SegmentRow]) -> Result<()> {
    let stdout = io::stdout();
    let handle = stdout.lock();
    let mut writer = csv::Writer::from_writer(handle);
    write_rows(projector, rows, &mut writer)
}

/// Rows are staged in a sibling `.partial` file and renamed over `path` once
/// flushed. On failure `path` is left untouched.
fn write_rows_csv(projector: &TimingProjector, rows: &[SegmentRow], path: &Path) -> Result<()> {
    let staging = partial_path(path);
    let file = File::create(&staging)
        .with_context(|| format!("failed to create {}", staging.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    let outcome = write_rows(projector, rows, &mut writer).and_then(|()| {
        drop(writer);
        fs::rename(&staging, path)
            .with_context(|| format!("failed to move table into {}", path.display()))
    });
    if outcome.is_err() {
        let _ = fs::remove_file(&staging);
    }
    outcome
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

fn write_rows<W: Write>(
    projector: &TimingProjector,
    rows: &[SegmentRow],
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record(projector.header())?;
    for row in rows {
        writer.write_record(row.to_record())?;
    }
    writer.flush()?;
    Ok(())
}

/// Terminal progress bar, created on the first update so that runs which
/// never reach the geocoding stage print nothing.
struct BarProgress {
    message: &'static str,
    enabled: bool,
    bar: Option<ProgressBar>,
}

impl BarProgress {
    fn new(message: &'static str, enabled: bool) -> Self {
        Self {
            message,
            enabled,
            bar: None,
        }
    }
}

impl Progress for BarProgress {
    fn advance(&mut self, processed: usize, total: usize) {
        if !self.enabled {
            return;
        }
        let message = self.message;
        let bar = self.bar.get_or_insert_with(|| {
            let bar = ProgressBar::new(total as u64);
            if let Ok(style) =
                ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} ({eta})")
            {
                bar.set_style(style.progress_chars("=> "));
            }
            bar.set_message(message);
            bar
        });
        bar.set_position(processed as u64);
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
