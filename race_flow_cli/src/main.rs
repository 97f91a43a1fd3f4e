use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use race_flow::engine::SCHEMA_IDS;
use race_flow::io::{parse_race_config, parse_runners, parse_segments, read_input};
use race_flow::zones::display_bounds;
use race_flow::{
    analyze, run_id, AnalysisRun, CancelToken, ConvergencePoint, DensityBin, Engine, EngineConfig,
    EventTracks, FlowSummary, RaceInputs, Runner, RunnerParticipation, SegmentDensitySummary,
};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Race course density and flow analysis CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run density, reconciliation and flow analysis and write the run artifacts
    Analyze(AnalyzeArgs),
    /// Load and check inputs and configuration without running the analysis
    Validate(ValidateArgs),
}

#[derive(Parser, Debug)]
struct InputArgs {
    /// Segment table CSV
    #[arg(long, value_hint = ValueHint::FilePath)]
    segments: PathBuf,

    /// Runner table CSVs (one per event or combined)
    #[arg(long, required = true, num_args = 1.., value_hint = ValueHint::FilePath)]
    runners: Vec<PathBuf>,

    /// Race configuration JSON: events, flow pairs, event groups
    #[arg(long, value_hint = ValueHint::FilePath)]
    race: PathBuf,

    /// Engine configuration JSON (defaults when omitted)
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Time window in seconds
    #[arg(long)]
    window_s: Option<f64>,

    /// Distance bin in kilometres
    #[arg(long)]
    bin_km: Option<f64>,

    /// Zone metrics engine
    #[arg(long, value_enum)]
    engine: Option<EngineOpt>,

    /// Reconciliation relative-error tolerance
    #[arg(long)]
    tolerance: Option<f64>,
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    #[command(flatten)]
    inputs: InputArgs,

    /// Directory that receives one sub-directory per run id
    #[arg(short, long, default_value = "runs", value_hint = ValueHint::DirPath)]
    out: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    #[command(flatten)]
    inputs: InputArgs,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum EngineOpt {
    Auto,
    Direct,
    Binned,
}

impl From<EngineOpt> for Engine {
    fn from(value: EngineOpt) -> Self {
        match value {
            EngineOpt::Auto => Engine::Auto,
            EngineOpt::Direct => Engine::Direct,
            EngineOpt::Binned => Engine::Binned,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Analyze(args) => args.verbose,
        Command::Validate(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Analyze(args) => handle_analyze(args).map(|_| ()),
        Command::Validate(args) => handle_validate(args),
    }
}

fn load_inputs(args: &InputArgs) -> Result<RaceInputs> {
    let data = read_input(&args.race, "race config")?;
    let race = parse_race_config(&data)
        .with_context(|| format!("failed to parse {}", args.race.display()))?;

    let data = read_input(&args.segments, "segment table")?;
    let segments = parse_segments(&data)
        .with_context(|| format!("failed to parse {}", args.segments.display()))?;

    let tables = args
        .runners
        .par_iter()
        .map(|path| -> Result<Vec<Runner>> {
            let data = read_input(path, "runner table")?;
            parse_runners(&data).with_context(|| format!("failed to parse {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    let runners: Vec<Runner> = tables.into_iter().flatten().collect();
    if runners.is_empty() {
        return Err(anyhow!("runner tables contain no runners"));
    }

    Ok(RaceInputs::new(race, segments, runners))
}

fn load_config(args: &InputArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(window_s) = args.window_s {
        config.binning.window_s = window_s;
        config.coarsening.max_window_s = config.coarsening.max_window_s.max(window_s);
    }
    if let Some(bin_km) = args.bin_km {
        config.binning.bin_km = bin_km;
        config.coarsening.max_bin_km = config.coarsening.max_bin_km.max(bin_km);
    }
    if let Some(engine) = args.engine {
        config.interactions.engine = engine.into();
    }
    if let Some(tolerance) = args.tolerance {
        config.reconciliation.tolerance = tolerance;
    }
    config.validate().context("invalid engine configuration")?;
    Ok(config)
}

fn handle_analyze(args: AnalyzeArgs) -> Result<PathBuf> {
    let timed = args.profile || args.verbose;

    let t_parse = Instant::now();
    let inputs = load_inputs(&args.inputs)?;
    let config = load_config(&args.inputs)?;
    if timed {
        info!(
            "Parse stage: {:.1} ms",
            t_parse.elapsed().as_secs_f64() * 1000.0
        );
    }

    let t_compute = Instant::now();
    let run = analyze(&inputs, &config, &CancelToken::new()).context("analysis failed")?;
    if timed {
        info!(
            "Compute stage: {:.1} ms",
            t_compute.elapsed().as_secs_f64() * 1000.0
        );
    }

    let t_write = Instant::now();
    let dir = write_run(&run, &args.out)?;
    if timed {
        info!(
            "Write stage: {:.1} ms",
            t_write.elapsed().as_secs_f64() * 1000.0
        );
    }

    if !run.valid() {
        warn!(
            "Reconciliation flagged segments {:?}; run {} is marked invalid",
            run.reconciliation
                .flagged_segments()
                .map(|s| s.seg_id.as_str())
                .collect::<Vec<_>>(),
            run.run_id
        );
    }
    for warning in &run.warnings {
        warn!("{}", warning);
    }
    info!("Run {} written to {}", run.run_id, dir.display());
    Ok(dir)
}

fn handle_validate(args: ValidateArgs) -> Result<()> {
    let inputs = load_inputs(&args.inputs)?;
    let config = load_config(&args.inputs)?;
    inputs.validate().context("input validation failed")?;

    let mut usable = 0;
    for event in &inputs.events {
        let (tracks, warnings) = EventTracks::build(
            event,
            inputs.runners.iter().filter(|r| r.event == event.name),
        );
        for warning in &warnings {
            warn!("{}", warning);
        }
        info!(
            "Event {}: {} usable runners, start {}",
            event.name,
            tracks.len(),
            race_flow::density::clock_label(event.start_s())
        );
        usable += tracks.len();
    }
    for segment in &inputs.segments {
        if let Some(reason) = segment.degenerate_reason() {
            warn!("Segment {} will be skipped: {}", segment.seg_id, reason);
        }
    }

    info!(
        "{} events, {} of {} runners usable, {} segments, {} flow pairs",
        inputs.events.len(),
        usable,
        inputs.runners.len(),
        inputs.segments.len(),
        inputs.flow_pairs.len()
    );
    println!("{}", run_id(&inputs, &config)?);
    Ok(())
}

/// Write every artifact into a hidden temp directory, then move it into
/// place as `<out>/<run_id>`.
fn write_run(run: &AnalysisRun, out: &Path) -> Result<PathBuf> {
    fs::create_dir_all(out).with_context(|| format!("failed to create {}", out.display()))?;
    let final_dir = out.join(&run.run_id);
    let tmp_dir = out.join(format!(".{}.tmp", run.run_id));
    if tmp_dir.exists() {
        fs::remove_dir_all(&tmp_dir)
            .with_context(|| format!("failed to clear {}", tmp_dir.display()))?;
    }
    fs::create_dir_all(&tmp_dir)
        .with_context(|| format!("failed to create {}", tmp_dir.display()))?;

    write_density_bins(&run.density_bins, &tmp_dir.join("density_bins.csv"))?;
    write_segment_summaries(
        &run.segment_summaries,
        &tmp_dir.join("segment_summaries.csv"),
    )?;
    write_flow_zones(run, &tmp_dir.join("flow_zones.csv"))?;
    write_participation(
        &run.participation,
        &tmp_dir.join("runner_participation.csv"),
    )?;
    write_convergence_points(
        &run.convergence_points,
        &tmp_dir.join("convergence_points.csv"),
    )?;
    write_json(
        &tmp_dir.join("reconciliation.json"),
        &Versioned {
            schema: SCHEMA_IDS.reconciliation,
            run_id: &run.run_id,
            data: &run.reconciliation,
        },
    )?;
    write_json(
        &tmp_dir.join("scores.json"),
        &Versioned {
            schema: SCHEMA_IDS.scores,
            run_id: &run.run_id,
            data: &run.scores,
        },
    )?;
    write_json(
        &tmp_dir.join("manifest.json"),
        &run.manifest(Utc::now().to_rfc3339()),
    )?;

    let stale = out.join(format!(".{}.old", run.run_id));
    publish_dir(&tmp_dir, &final_dir, &stale)?;
    Ok(final_dir)
}

/// Move `tmp_dir` into place. An existing directory for the run id holds the
/// same inputs and config; it is set aside and restored if the move fails.
fn publish_dir(tmp_dir: &Path, final_dir: &Path, stale: &Path) -> Result<()> {
    if !final_dir.exists() {
        return fs::rename(tmp_dir, final_dir)
            .with_context(|| format!("failed to publish {}", final_dir.display()));
    }
    fs::rename(final_dir, stale)
        .with_context(|| format!("failed to move aside {}", final_dir.display()))?;
    if let Err(err) = fs::rename(tmp_dir, final_dir) {
        if let Err(restore) = fs::rename(stale, final_dir) {
            warn!(
                "Could not restore previous run from {}: {}",
                stale.display(),
                restore
            );
        }
        return Err(err).with_context(|| format!("failed to publish {}", final_dir.display()));
    }
    fs::remove_dir_all(stale).with_context(|| format!("failed to remove {}", stale.display()))
}

#[derive(Serialize)]
struct Versioned<'a, T: Serialize> {
    schema: &'static str,
    run_id: &'a str,
    data: &'a T,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn csv_writer(path: &Path) -> Result<csv::Writer<File>> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    Ok(csv::Writer::from_writer(file))
}

fn write_density_bins(bins: &[DensityBin], path: &Path) -> Result<()> {
    let mut writer = csv_writer(path)?;
    writer.write_record([
        "seg_id",
        "bin_index",
        "window_index",
        "bin_start_km",
        "bin_end_km",
        "window_start_s",
        "window_end_s",
        "window_start_clock",
        "occupant_count",
        "density_p_per_m2",
        "mean_speed_mps",
        "flow_rate",
        "los_class",
    ])?;
    for bin in bins {
        writer.write_record([
            bin.seg_id.clone(),
            bin.bin_index.to_string(),
            bin.window_index.to_string(),
            format!("{:.3}", bin.bin_start_km),
            format!("{:.3}", bin.bin_end_km),
            format!("{:.0}", bin.window_start_s),
            format!("{:.0}", bin.window_end_s),
            bin.window_start_clock.clone(),
            bin.occupant_count.to_string(),
            format!("{:.4}", bin.density_p_per_m2),
            format!("{:.3}", bin.mean_speed_mps),
            format!("{:.3}", bin.flow_rate),
            bin.los_class.as_str().to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_segment_summaries(summaries: &[SegmentDensitySummary], path: &Path) -> Result<()> {
    let mut writer = csv_writer(path)?;
    writer.write_record([
        "seg_id",
        "seg_label",
        "length_km",
        "width_m",
        "windows_evaluated",
        "occupied_bins",
        "peak_density_p_per_m2",
        "peak_los",
        "peak_flow_rate",
        "peak_window_clock",
    ])?;
    for summary in summaries {
        writer.write_record([
            summary.seg_id.clone(),
            summary.label.clone(),
            format!("{:.3}", summary.length_km),
            format!("{:.2}", summary.width_m),
            summary.windows_evaluated.to_string(),
            summary.occupied_bins.to_string(),
            format!("{:.4}", summary.peak_density),
            summary.peak_los.as_str().to_string(),
            format!("{:.3}", summary.peak_flow_rate),
            summary.peak_window_clock.clone().unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_flow_zones(run: &AnalysisRun, path: &Path) -> Result<()> {
    let worst: BTreeMap<(&str, &str, &str), Option<usize>> = run
        .flow_summaries
        .iter()
        .map(|s: &FlowSummary| {
            (
                (s.seg_id.as_str(), s.event_a.as_str(), s.event_b.as_str()),
                s.worst_zone_index,
            )
        })
        .collect();

    let mut writer = csv_writer(path)?;
    writer.write_record([
        "seg_id",
        "event_a",
        "event_b",
        "zone_index",
        "zone_start_km_a",
        "zone_end_km_a",
        "zone_start_km_b",
        "zone_end_km_b",
        "start_kind",
        "end_kind",
        "strategy",
        "runners_a",
        "runners_b",
        "overtaking_a",
        "overtaking_b",
        "overtaken_a",
        "overtaken_b",
        "copresence_a",
        "copresence_b",
        "unique_encounters",
        "participants_involved",
        "multi_category_runners",
        "worst_zone",
    ])?;
    for report in &run.zones {
        let (zone, m) = (&report.zone, &report.metrics);
        let [start_a, end_a, start_b, end_b] = display_bounds(zone);
        let is_worst = worst
            .get(&(
                zone.seg_id.as_str(),
                zone.event_a.as_str(),
                zone.event_b.as_str(),
            ))
            .copied()
            .flatten()
            == Some(zone.zone_index);
        writer.write_record([
            zone.seg_id.clone(),
            zone.event_a.clone(),
            zone.event_b.clone(),
            zone.zone_index.to_string(),
            format!("{:.3}", start_a),
            format!("{:.3}", end_a),
            format!("{:.3}", start_b),
            format!("{:.3}", end_b),
            zone.start_kind.as_str().to_string(),
            zone.end_kind.as_str().to_string(),
            m.strategy.as_str().to_string(),
            m.runners_a.to_string(),
            m.runners_b.to_string(),
            m.overtaking_a.to_string(),
            m.overtaking_b.to_string(),
            m.overtaken_a.to_string(),
            m.overtaken_b.to_string(),
            m.copresence_a.to_string(),
            m.copresence_b.to_string(),
            m.unique_encounters.to_string(),
            m.participants_involved.to_string(),
            m.multi_category_runners.to_string(),
            is_worst.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_participation(rows: &[RunnerParticipation], path: &Path) -> Result<()> {
    let mut writer = csv_writer(path)?;
    writer.write_record([
        "seg_id",
        "event_a",
        "event_b",
        "zone_index",
        "runner_id",
        "event",
        "side",
        "role",
    ])?;
    for row in rows {
        writer.write_record([
            row.seg_id.as_str(),
            row.event_a.as_str(),
            row.event_b.as_str(),
            row.zone_index.to_string().as_str(),
            row.runner_id.as_str(),
            row.event.as_str(),
            row.side.as_str(),
            row.role.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_convergence_points(points: &[ConvergencePoint], path: &Path) -> Result<()> {
    let mut writer = csv_writer(path)?;
    writer.write_record([
        "seg_id",
        "event_a",
        "event_b",
        "cp_km",
        "cp_km_b",
        "fraction",
        "crossings",
    ])?;
    for point in points {
        writer.write_record([
            point.seg_id.clone(),
            point.event_a.clone(),
            point.event_b.clone(),
            format!("{:.3}", point.cp_km),
            format!("{:.3}", point.cp_km_b),
            format!("{:.4}", point.fraction),
            point.crossings.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SEGMENTS: &str = "\
seg_id,seg_label,start_km,end_km,width_m,events,flow_type
A1,Start straight,0.0,1.0,6.0,Full;10K,overtake
B1,Water station,1.0,1.0,3.0,Full,
";

    const RACE: &str = r#"{
  "events": [
    {"name": "Full", "start_offset_minutes": 420, "distance_km": 42.2},
    {"name": "10K", "start_offset_minutes": 425, "distance_km": 10.0}
  ],
  "flow_pairs": [{"seg_id": "A1", "event_a": "Full", "event_b": "10K"}]
}"#;

    const FULL_RUNNERS: &str = "\
event,runner_id,pace,start_offset
Full,1001,7.0,150
Full,1002,7.0,160
Full,1003,7.0,170
";

    const TEN_K_RUNNERS: &str = "\
event,runner_id,pace,start_offset
10K,2001,4.0,0
10K,2002,4.0,5
";

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn fixture(dir: &Path) -> Vec<String> {
        let segments = write(dir, "segments.csv", SEGMENTS);
        let race = write(dir, "race.json", RACE);
        let full = write(dir, "runners_full.csv", FULL_RUNNERS);
        let ten_k = write(dir, "runners_10k.csv", TEN_K_RUNNERS);
        vec![
            "--segments".into(),
            segments.display().to_string(),
            "--race".into(),
            race.display().to_string(),
            "--runners".into(),
            full.display().to_string(),
            ten_k.display().to_string(),
        ]
    }

    fn analyze_args(argv: Vec<String>) -> AnalyzeArgs {
        let cli = Cli::try_parse_from(
            ["race-flow".to_string(), "analyze".to_string()]
                .into_iter()
                .chain(argv),
        )
        .unwrap();
        match cli.command {
            Command::Analyze(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn analyze_writes_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("runs");
        let mut argv = fixture(dir.path());
        argv.extend(["--out".into(), out.display().to_string()]);

        let run_dir = handle_analyze(analyze_args(argv)).unwrap();
        for name in [
            "density_bins.csv",
            "segment_summaries.csv",
            "flow_zones.csv",
            "runner_participation.csv",
            "convergence_points.csv",
            "reconciliation.json",
            "scores.json",
            "manifest.json",
        ] {
            assert!(run_dir.join(name).is_file(), "missing {name}");
        }
        let leftovers: Vec<_> = fs::read_dir(&out)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());

        let manifest: serde_json::Value =
            serde_json::from_slice(&fs::read(run_dir.join("manifest.json")).unwrap()).unwrap();
        assert_eq!(
            manifest["run_id"].as_str(),
            run_dir.file_name().and_then(|n| n.to_str())
        );
        assert_eq!(manifest["valid"], serde_json::Value::Bool(true));
        assert_eq!(manifest["skipped_segments"][0]["seg_id"], "B1");
        assert_eq!(manifest["schema"]["flow_zones"], "race_flow.flow_zones.v1");

        let mut zones = csv::Reader::from_path(run_dir.join("flow_zones.csv")).unwrap();
        let rows: Vec<csv::StringRecord> = zones.records().map(|r| r.unwrap()).collect();
        assert!(!rows.is_empty());
        assert_eq!(rows.iter().filter(|r| &r[22] == "true").count(), 1);
    }

    #[test]
    fn rerun_replaces_the_same_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("runs");
        let mut argv = fixture(dir.path());
        argv.extend(["--out".into(), out.display().to_string()]);

        let first = handle_analyze(analyze_args(argv.clone())).unwrap();
        let bins = fs::read(first.join("density_bins.csv")).unwrap();
        let second = handle_analyze(analyze_args(argv)).unwrap();
        assert_eq!(first, second);
        assert_eq!(bins, fs::read(second.join("density_bins.csv")).unwrap());
        assert_eq!(fs::read_dir(&out).unwrap().count(), 1);
    }

    #[test]
    fn overrides_change_the_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("runs");
        let mut argv = fixture(dir.path());
        argv.extend(["--out".into(), out.display().to_string()]);
        let base = handle_analyze(analyze_args(argv.clone())).unwrap();

        argv.extend([
            "--engine".into(),
            "binned".into(),
            "--window-s".into(),
            "120".into(),
        ]);
        let args = analyze_args(argv);
        let config = load_config(&args.inputs).unwrap();
        assert_eq!(config.interactions.engine, Engine::Binned);
        assert_eq!(config.binning.window_s, 120.0);
        let overridden = handle_analyze(args).unwrap();
        assert_ne!(base, overridden);
    }

    #[test]
    fn missing_runner_table_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut argv = fixture(dir.path());
        let missing = dir.path().join("runners_half.csv");
        argv.push(missing.display().to_string());
        argv.extend([
            "--out".into(),
            dir.path().join("runs").display().to_string(),
        ]);

        let err = handle_analyze(analyze_args(argv)).unwrap_err();
        assert!(format!("{:#}", err).contains("runners_half.csv"));
        assert!(!dir.path().join("runs").exists());
    }

    #[test]
    fn undeclared_flow_pair_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let argv = fixture(dir.path());
        write(
            dir.path(),
            "race.json",
            r#"{"events": [
                {"name": "Full", "start_offset_minutes": 420, "distance_km": 42.2},
                {"name": "10K", "start_offset_minutes": 425, "distance_km": 10.0}
            ]}"#,
        );
        let cli = Cli::try_parse_from(
            ["race-flow".to_string(), "validate".to_string()]
                .into_iter()
                .chain(argv),
        )
        .unwrap();
        let Command::Validate(args) = cli.command else {
            panic!("expected validate");
        };
        let err = handle_validate(args).unwrap_err();
        assert!(format!("{:#}", err).contains("A1"));
    }

    #[test]
    fn failed_publish_restores_the_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let final_dir = dir.path().join("abc123");
        fs::create_dir(&final_dir).unwrap();
        write(&final_dir, "manifest.json", "{}");
        let stale = dir.path().join(".abc123.old");

        let missing_tmp = dir.path().join(".abc123.tmp");
        assert!(publish_dir(&missing_tmp, &final_dir, &stale).is_err());
        assert!(final_dir.join("manifest.json").is_file());
        assert!(!stale.exists());

        fs::create_dir(&missing_tmp).unwrap();
        write(&missing_tmp, "scores.json", "[]");
        publish_dir(&missing_tmp, &final_dir, &stale).unwrap();
        assert!(final_dir.join("scores.json").is_file());
        assert!(!final_dir.join("manifest.json").exists());
        assert!(!stale.exists());
    }
}
