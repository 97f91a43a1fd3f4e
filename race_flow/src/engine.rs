//! One analysis run: validate, track, bin, reconcile, analyse flow, score.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::convergence::{self, ConvergencePoint};
use crate::course::{FlowPair, RaceInputs};
use crate::density::{
    CoarseningAttempt, DensityBin, DensityBinner, Resolution, SegmentDensitySummary, SkippedSegment,
};
use crate::interp::EventTracks;
use crate::metrics::{compute_zone_metrics, worst_zone, RunnerParticipation, ZoneReport};
use crate::reconcile::{reconcile, ReconciliationReport};
use crate::score::{score_groups, GroupScore};
use crate::zones::build_zones;
use crate::{DataQualityWarning, FlowError};

/// Cooperative cancellation shared between the caller and worker tasks.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<(), FlowError> {
        if self.is_cancelled() {
            Err(FlowError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Versioned identifiers of every dataset a run produces.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct SchemaIds {
    pub density_bins: &'static str,
    pub flow_zones: &'static str,
    pub runner_participation: &'static str,
    pub convergence_points: &'static str,
    pub reconciliation: &'static str,
    pub scores: &'static str,
}

pub const SCHEMA_IDS: SchemaIds = SchemaIds {
    density_bins: "race_flow.density_bins.v1",
    flow_zones: "race_flow.flow_zones.v1",
    runner_participation: "race_flow.runner_participation.v1",
    convergence_points: "race_flow.convergence_points.v1",
    reconciliation: "race_flow.reconciliation.v1",
    scores: "race_flow.scores.v1",
};

/// Roll-up of one declared pair on one segment.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FlowSummary {
    pub seg_id: String,
    pub event_a: String,
    pub event_b: String,
    pub convergence_points: usize,
    pub zones: usize,
    pub interacting_zones: usize,
    pub worst_zone_index: Option<usize>,
    pub unique_encounters: usize,
    /// Set when the segment could not be analysed; the pair then has no zones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AnalysisRun {
    pub run_id: String,
    pub schema: SchemaIds,
    pub resolution: Resolution,
    pub coarsening: Vec<CoarseningAttempt>,
    pub density_bins: Vec<DensityBin>,
    pub segment_summaries: Vec<SegmentDensitySummary>,
    pub convergence_points: Vec<ConvergencePoint>,
    pub zones: Vec<ZoneReport>,
    pub participation: Vec<RunnerParticipation>,
    pub flow_summaries: Vec<FlowSummary>,
    pub reconciliation: ReconciliationReport,
    pub scores: Vec<GroupScore>,
    pub warnings: Vec<DataQualityWarning>,
    pub skipped_segments: Vec<SkippedSegment>,
}

impl AnalysisRun {
    /// False when reconciliation flagged any segment.
    pub fn valid(&self) -> bool {
        self.reconciliation.valid
    }

    pub fn manifest(&self, generated_at: String) -> RunManifest {
        RunManifest {
            run_id: self.run_id.clone(),
            generated_at,
            schema: self.schema,
            resolution: self.resolution,
            coarsening: self.coarsening.clone(),
            valid: self.valid(),
            density_bins: self.density_bins.len(),
            convergence_points: self.convergence_points.len(),
            zones: self.zones.len(),
            participation_rows: self.participation.len(),
            warnings: self.warnings.clone(),
            skipped_segments: self.skipped_segments.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunManifest {
    pub run_id: String,
    pub generated_at: String,
    pub schema: SchemaIds,
    pub resolution: Resolution,
    pub coarsening: Vec<CoarseningAttempt>,
    pub valid: bool,
    pub density_bins: usize,
    pub convergence_points: usize,
    pub zones: usize,
    pub participation_rows: usize,
    pub warnings: Vec<DataQualityWarning>,
    pub skipped_segments: Vec<SkippedSegment>,
}

/// Stable identifier for a run: the first 16 hex digits of the SHA-256 of the
/// serialized inputs and configuration.
pub fn run_id(inputs: &RaceInputs, config: &EngineConfig) -> Result<String, FlowError> {
    #[derive(Serialize)]
    struct Identity<'a> {
        inputs: &'a RaceInputs,
        config: &'a EngineConfig,
    }
    let bytes = serde_json::to_vec(&Identity { inputs, config })?;
    let hex = sha256_hex(&bytes);
    Ok(hex[..16].to_string())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

struct PairFlow {
    points: Vec<ConvergencePoint>,
    zones: Vec<ZoneReport>,
    participation: Vec<RunnerParticipation>,
    summary: FlowSummary,
}

fn analyze_pair(
    inputs: &RaceInputs,
    pair: &FlowPair,
    tracks: &BTreeMap<String, EventTracks>,
    config: &EngineConfig,
) -> Result<PairFlow, FlowError> {
    let segment = inputs
        .segment(&pair.seg_id)
        .ok_or_else(|| FlowError::UnknownSegment(pair.seg_id.clone()))?;
    let tracks_a = tracks
        .get(&pair.event_a)
        .ok_or_else(|| FlowError::UnknownEvent(pair.event_a.clone()))?;
    let tracks_b = tracks
        .get(&pair.event_b)
        .ok_or_else(|| FlowError::UnknownEvent(pair.event_b.clone()))?;
    if let Some(reason) = segment.degenerate_reason() {
        debug!("Flow skipped on degenerate segment {}", segment.seg_id);
        return Ok(PairFlow {
            points: Vec::new(),
            zones: Vec::new(),
            participation: Vec::new(),
            summary: FlowSummary {
                seg_id: pair.seg_id.clone(),
                event_a: pair.event_a.clone(),
                event_b: pair.event_b.clone(),
                convergence_points: 0,
                zones: 0,
                interacting_zones: 0,
                worst_zone_index: None,
                unique_encounters: 0,
                skipped_reason: Some(reason),
            },
        });
    }

    let points = convergence::detect(segment, pair, tracks_a, tracks_b, &config.zones);
    let zones = build_zones(segment, pair, &points, &config.zones);
    let evaluated: Vec<(ZoneReport, Vec<RunnerParticipation>)> = zones
        .into_par_iter()
        .map(|zone| {
            let (metrics, rows) =
                compute_zone_metrics(&zone, tracks_a, tracks_b, &config.interactions);
            (ZoneReport { zone, metrics }, rows)
        })
        .collect();
    let (zones, rows): (Vec<ZoneReport>, Vec<Vec<RunnerParticipation>>) =
        evaluated.into_iter().unzip();

    let summary = FlowSummary {
        seg_id: pair.seg_id.clone(),
        event_a: pair.event_a.clone(),
        event_b: pair.event_b.clone(),
        convergence_points: points.len(),
        zones: zones.len(),
        interacting_zones: zones.iter().filter(|z| z.metrics.has_interaction()).count(),
        worst_zone_index: worst_zone(zones.iter().map(|z| (z.zone.zone_index, &z.metrics))),
        unique_encounters: zones.iter().map(|z| z.metrics.unique_encounters).sum(),
        skipped_reason: None,
    };
    debug!(
        "{}/{} on {}: {} zones, worst {:?}",
        pair.event_a, pair.event_b, pair.seg_id, summary.zones, summary.worst_zone_index
    );
    Ok(PairFlow {
        points,
        zones,
        participation: rows.into_iter().flatten().collect(),
        summary,
    })
}

/// Run the full pipeline over `inputs`. Configuration and budget problems
/// are errors; data-quality and reconciliation issues land in the result.
pub fn analyze(
    inputs: &RaceInputs,
    config: &EngineConfig,
    cancel: &CancelToken,
) -> Result<AnalysisRun, FlowError> {
    config.validate()?;
    inputs.validate()?;
    let run_id = run_id(inputs, config)?;
    info!(
        "Run {}: {} events, {} runners, {} segments, {} flow pairs",
        run_id,
        inputs.events.len(),
        inputs.runners.len(),
        inputs.segments.len(),
        inputs.flow_pairs.len()
    );

    let t_tracks = Instant::now();
    let mut warnings = Vec::new();
    let mut tracks = BTreeMap::new();
    for event in &inputs.events {
        let (event_tracks, event_warnings) = EventTracks::build(
            event,
            inputs.runners.iter().filter(|r| r.event == event.name),
        );
        warnings.extend(event_warnings);
        tracks.insert(event.name.clone(), event_tracks);
    }
    let origin_s = inputs
        .events
        .iter()
        .map(|e| e.start_s())
        .chain(
            tracks
                .values()
                .filter_map(|t| t.time_span())
                .map(|(start, _)| start),
        )
        .fold(f64::INFINITY, f64::min);
    debug!(
        "Tracks built in {:.1} ms",
        t_tracks.elapsed().as_secs_f64() * 1000.0
    );
    cancel.check()?;

    let t_density = Instant::now();
    let density = DensityBinner::new(&inputs.segments, &tracks, config, origin_s).run(cancel)?;
    warnings.extend(
        density
            .skipped
            .iter()
            .map(|s| DataQualityWarning::DegenerateSegment {
                seg_id: s.seg_id.clone(),
                reason: s.reason.clone(),
            }),
    );
    let density_bins = density.bins(&inputs.segments, &config.los);
    let segment_summaries = density.summaries(&inputs.segments, &density_bins);
    debug!(
        "Density stage: {:.1} ms ({} bins)",
        t_density.elapsed().as_secs_f64() * 1000.0,
        density_bins.len()
    );
    cancel.check()?;

    let reconciliation = reconcile(&density, &inputs.segments, &tracks, &config.reconciliation);
    cancel.check()?;

    let t_flow = Instant::now();
    let flows = inputs
        .flow_pairs
        .par_iter()
        .map(|pair| {
            cancel.check()?;
            analyze_pair(inputs, pair, &tracks, config)
        })
        .collect::<Result<Vec<_>, FlowError>>()?;
    let mut convergence_points = Vec::new();
    let mut zones = Vec::new();
    let mut participation = Vec::new();
    let mut flow_summaries = Vec::new();
    for flow in flows {
        convergence_points.extend(flow.points);
        zones.extend(flow.zones);
        participation.extend(flow.participation);
        flow_summaries.push(flow.summary);
    }
    debug!(
        "Flow stage: {:.1} ms ({} zones)",
        t_flow.elapsed().as_secs_f64() * 1000.0,
        zones.len()
    );

    let scores = score_groups(
        &inputs.event_groups(),
        &inputs.segments,
        &density_bins,
        &tracks,
        &config.score,
    );

    if !warnings.is_empty() {
        warn!(
            "Run {} finished with {} data-quality warnings",
            run_id,
            warnings.len()
        );
    }
    info!(
        "Run {}: {} density bins, {} convergence points, {} zones, valid={}",
        run_id,
        density_bins.len(),
        convergence_points.len(),
        zones.len(),
        reconciliation.valid
    );

    Ok(AnalysisRun {
        run_id,
        schema: SCHEMA_IDS,
        resolution: density.resolution,
        coarsening: density.attempts,
        density_bins,
        segment_summaries,
        convergence_points,
        zones,
        participation,
        flow_summaries,
        reconciliation,
        scores,
        warnings,
        skipped_segments: density.skipped,
    })
}
