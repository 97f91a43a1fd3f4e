//! Time-window × distance-bin occupancy, density and Level of Service.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::NaiveTime;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{BinningConfig, CoarseningPolicy, EngineConfig, LosClass, LosTable};
use crate::course::{KmRange, Segment};
use crate::engine::CancelToken;
use crate::interp::EventTracks;
use crate::FlowError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Resolution {
    pub bin_km: f64,
    pub window_s: f64,
    pub coarsening_steps: usize,
}

impl Resolution {
    pub fn base(binning: &BinningConfig) -> Self {
        Self {
            bin_km: binning.bin_km,
            window_s: binning.window_s,
            coarsening_steps: 0,
        }
    }

    /// Next coarser resolution: widen windows and bins in turn, skipping a
    /// dimension already at its cap. `None` once both are capped.
    pub fn coarsen(&self, policy: &CoarseningPolicy) -> Option<Self> {
        let next_window = (self.window_s * policy.window_factor).min(policy.max_window_s);
        let next_bin = (self.bin_km * policy.bin_factor).min(policy.max_bin_km);
        let can_window = next_window > self.window_s;
        let can_bin = next_bin > self.bin_km;
        let prefer_window = self.coarsening_steps % 2 == 0;
        let (window_s, bin_km) = match (prefer_window, can_window, can_bin) {
            (true, true, _) | (false, true, false) => (next_window, self.bin_km),
            (_, _, true) => (self.window_s, next_bin),
            _ => return None,
        };
        Some(Self {
            bin_km,
            window_s,
            coarsening_steps: self.coarsening_steps + 1,
        })
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    OverWorkBudget,
    OverTimeBudget,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CoarseningAttempt {
    pub resolution: Resolution,
    pub work_units: u64,
    pub elapsed_s: Option<f64>,
    pub outcome: AttemptOutcome,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SkippedSegment {
    pub seg_id: String,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DensityBin {
    pub seg_id: String,
    pub bin_index: usize,
    pub window_index: usize,
    pub bin_start_km: f64,
    pub bin_end_km: f64,
    pub window_start_s: f64,
    pub window_end_s: f64,
    pub window_start_clock: String,
    pub occupant_count: u32,
    pub density_p_per_m2: f64,
    pub mean_speed_mps: f64,
    /// Persons per metre of width per minute.
    pub flow_rate: f64,
    pub los_class: LosClass,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SegmentDensitySummary {
    pub seg_id: String,
    pub label: String,
    pub length_km: f64,
    pub width_m: f64,
    pub windows_evaluated: usize,
    pub occupied_bins: usize,
    pub peak_density: f64,
    pub peak_los: LosClass,
    pub peak_flow_rate: f64,
    pub peak_window_index: Option<usize>,
    pub peak_bin_index: Option<usize>,
    pub peak_window_clock: Option<String>,
}

/// Occupancy arena for one segment, indexed `[window, bin]`.
#[derive(Clone, Debug)]
pub struct SegmentGrid {
    pub seg_index: usize,
    pub seg_id: String,
    /// Global index of row 0.
    pub first_window: usize,
    /// Physical bin boundaries measured from the segment start, in km.
    pub bin_edges_km: Vec<f64>,
    pub counts: Array2<u32>,
    pub speed_sums: Array2<f64>,
}

impl SegmentGrid {
    pub fn n_windows(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_bins(&self) -> usize {
        self.counts.ncols()
    }

    /// Bin length snapped to the millimetre, so equal bins have equal area.
    pub fn bin_length_m(&self, bin: usize) -> f64 {
        ((self.bin_edges_km[bin + 1] - self.bin_edges_km[bin]) * 1_000_000.0).round() / 1000.0
    }

    /// Bin holding a point `offset_km` from the segment start.
    pub fn bin_for(&self, offset_km: f64) -> usize {
        bin_for(&self.bin_edges_km, offset_km)
    }

    pub fn window_total(&self, row: usize) -> u64 {
        self.counts.row(row).iter().map(|&c| c as u64).sum()
    }
}

#[derive(Clone, Debug)]
pub struct DensityOutcome {
    pub origin_s: f64,
    pub resolution: Resolution,
    pub attempts: Vec<CoarseningAttempt>,
    pub grids: Vec<SegmentGrid>,
    pub skipped: Vec<SkippedSegment>,
}

impl DensityOutcome {
    pub fn window_start_s(&self, window: usize) -> f64 {
        self.origin_s + window as f64 * self.resolution.window_s
    }

    /// Sample instant used for `window`.
    pub fn sample_time(&self, window: usize) -> f64 {
        sample_time(self.origin_s, self.resolution.window_s, window)
    }

    /// Occupied bins in segment order, then window, then distance.
    pub fn bins(&self, segments: &[Segment], los: &LosTable) -> Vec<DensityBin> {
        let mut out = Vec::new();
        for grid in &self.grids {
            let segment = &segments[grid.seg_index];
            for ((row, bin), &count) in grid.counts.indexed_iter() {
                if count == 0 {
                    continue;
                }
                let window = grid.first_window + row;
                let area = grid.bin_length_m(bin) * segment.width_m;
                let density = count as f64 / area;
                let mean_speed = grid.speed_sums[[row, bin]] / count as f64;
                let start_s = self.window_start_s(window);
                out.push(DensityBin {
                    seg_id: segment.seg_id.clone(),
                    bin_index: bin,
                    window_index: window,
                    bin_start_km: crate::round_km(segment.start_km + grid.bin_edges_km[bin]),
                    bin_end_km: crate::round_km(segment.start_km + grid.bin_edges_km[bin + 1]),
                    window_start_s: start_s,
                    window_end_s: start_s + self.resolution.window_s,
                    window_start_clock: clock_label(start_s),
                    occupant_count: count,
                    density_p_per_m2: density,
                    mean_speed_mps: mean_speed,
                    flow_rate: density * mean_speed * 60.0,
                    los_class: los.classify(density),
                });
            }
        }
        out
    }

    pub fn summaries(
        &self,
        segments: &[Segment],
        bins: &[DensityBin],
    ) -> Vec<SegmentDensitySummary> {
        self.grids
            .iter()
            .map(|grid| {
                let segment = &segments[grid.seg_index];
                let mut summary = SegmentDensitySummary {
                    seg_id: segment.seg_id.clone(),
                    label: segment.label.clone(),
                    length_km: segment.length_km(),
                    width_m: segment.width_m,
                    windows_evaluated: grid.n_windows(),
                    occupied_bins: 0,
                    peak_density: 0.0,
                    peak_los: LosClass::A,
                    peak_flow_rate: 0.0,
                    peak_window_index: None,
                    peak_bin_index: None,
                    peak_window_clock: None,
                };
                for bin in bins.iter().filter(|b| b.seg_id == segment.seg_id) {
                    summary.occupied_bins += 1;
                    if bin.density_p_per_m2 > summary.peak_density {
                        summary.peak_density = bin.density_p_per_m2;
                        summary.peak_window_index = Some(bin.window_index);
                        summary.peak_bin_index = Some(bin.bin_index);
                        summary.peak_window_clock = Some(bin.window_start_clock.clone());
                    }
                    summary.peak_los = summary.peak_los.max(bin.los_class);
                    summary.peak_flow_rate = summary.peak_flow_rate.max(bin.flow_rate);
                }
                summary
            })
            .collect()
    }
}

fn bin_for(edges_km: &[f64], offset_km: f64) -> usize {
    let last = edges_km.len().saturating_sub(2);
    edges_km
        .partition_point(|&edge| edge <= offset_km)
        .saturating_sub(1)
        .min(last)
}

pub(crate) fn sample_time(origin_s: f64, window_s: f64, window: usize) -> f64 {
    origin_s + (window as f64 + 0.5) * window_s
}

/// `HH:MM:SS` for a time after the run epoch, prefixed with `+Nd` past midnight.
pub fn clock_label(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let day = total / 86_400;
    let secs = (total % 86_400) as u32;
    let clock = NaiveTime::from_num_seconds_from_midnight_opt(secs, 0)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "00:00:00".to_string());
    if day == 0 {
        clock
    } else {
        format!("+{day}d {clock}")
    }
}

struct SegmentPlan<'a> {
    index: usize,
    segment: &'a Segment,
    members: Vec<(&'a EventTracks, KmRange)>,
    span: Option<(f64, f64)>,
    runners: usize,
}

pub struct DensityBinner<'a> {
    segments: &'a [Segment],
    tracks: &'a BTreeMap<String, EventTracks>,
    config: &'a EngineConfig,
    origin_s: f64,
}

impl<'a> DensityBinner<'a> {
    pub fn new(
        segments: &'a [Segment],
        tracks: &'a BTreeMap<String, EventTracks>,
        config: &'a EngineConfig,
        origin_s: f64,
    ) -> Self {
        Self {
            segments,
            tracks,
            config,
            origin_s,
        }
    }

    fn plan(&self) -> (Vec<SegmentPlan<'a>>, Vec<SkippedSegment>) {
        let mut plans = Vec::new();
        let mut skipped = Vec::new();
        for (index, segment) in self.segments.iter().enumerate() {
            if let Some(reason) = segment.degenerate_reason() {
                warn!("Skipping segment {}: {}", segment.seg_id, reason);
                skipped.push(SkippedSegment {
                    seg_id: segment.seg_id.clone(),
                    reason,
                });
                continue;
            }
            let members: Vec<(&EventTracks, KmRange)> = segment
                .applicable_events
                .iter()
                .filter_map(|name| {
                    let tracks = self.tracks.get(name)?;
                    Some((tracks, segment.range_for(name)?))
                })
                .filter(|(tracks, _)| !tracks.is_empty())
                .collect();
            let span = members
                .iter()
                .filter_map(|(tracks, range)| tracks.active_span(*range))
                .reduce(|a, b| (a.0.min(b.0), a.1.max(b.1)));
            let runners = members.iter().map(|(tracks, _)| tracks.len()).sum();
            plans.push(SegmentPlan {
                index,
                segment,
                members,
                span,
                runners,
            });
        }
        (plans, skipped)
    }

    /// Global index of the first window and the number of windows covering `span`.
    fn window_range(&self, span: Option<(f64, f64)>, window_s: f64) -> (usize, usize) {
        match span {
            Some((start, end)) => {
                let first = ((start - self.origin_s).max(0.0) / window_s).floor() as usize;
                let last = ((end - self.origin_s).max(0.0) / window_s).floor() as usize;
                (first, last - first + 1)
            }
            None => (0, 0),
        }
    }

    fn estimate_work(&self, plans: &[SegmentPlan<'_>], resolution: &Resolution) -> u64 {
        plans
            .iter()
            .map(|plan| {
                let (_, windows) = self.window_range(plan.span, resolution.window_s);
                windows as u64 * plan.runners as u64
            })
            .sum()
    }

    fn bin_segment(&self, plan: &SegmentPlan<'_>, resolution: &Resolution) -> SegmentGrid {
        let len_km = plan.segment.length_km();
        let bin_km = resolution.bin_km;
        let n_bins = ((len_km / bin_km) - 1e-9).ceil().max(1.0) as usize;
        let bin_edges_km: Vec<f64> = (0..=n_bins)
            .map(|b| crate::round_km(b as f64 * bin_km).min(len_km))
            .collect();
        let (first_window, n_windows) = self.window_range(plan.span, resolution.window_s);
        let mut counts = Array2::<u32>::zeros((n_windows, n_bins));
        let mut speed_sums = Array2::<f64>::zeros((n_windows, n_bins));

        for row in 0..n_windows {
            let t = sample_time(self.origin_s, resolution.window_s, first_window + row);
            for (tracks, range) in &plan.members {
                let (positions, speeds) = tracks.positions_and_speeds_at(t);
                for (&km, &speed) in positions.iter().zip(speeds.iter()) {
                    if km.is_nan() || !range.contains(km) {
                        continue;
                    }
                    let offset_km = range.fraction_of(km) * len_km;
                    let bin = bin_for(&bin_edges_km, offset_km);
                    counts[[row, bin]] += 1;
                    speed_sums[[row, bin]] += speed;
                }
            }
        }
        debug!(
            "Binned {}: {} windows x {} bins",
            plan.segment.seg_id, n_windows, n_bins
        );

        SegmentGrid {
            seg_index: plan.index,
            seg_id: plan.segment.seg_id.clone(),
            first_window,
            bin_edges_km,
            counts,
            speed_sums,
        }
    }

    /// Bin every usable segment, coarsening until the run fits its budget.
    pub fn run(&self, cancel: &CancelToken) -> Result<DensityOutcome, FlowError> {
        let (plans, skipped) = self.plan();
        let policy = &self.config.coarsening;
        let mut resolution = Resolution::base(&self.config.binning);
        let mut attempts = Vec::new();
        let started = Instant::now();

        loop {
            cancel.check()?;
            let work_units = self.estimate_work(&plans, &resolution);
            if work_units > policy.max_work_units {
                attempts.push(CoarseningAttempt {
                    resolution,
                    work_units,
                    elapsed_s: None,
                    outcome: AttemptOutcome::OverWorkBudget,
                });
            } else {
                let attempt_started = Instant::now();
                let grids = plans
                    .par_iter()
                    .map(|plan| {
                        cancel.check()?;
                        Ok(self.bin_segment(plan, &resolution))
                    })
                    .collect::<Result<Vec<_>, FlowError>>()?;
                let elapsed = attempt_started.elapsed().as_secs_f64();
                let total = started.elapsed().as_secs_f64();
                if total > policy.time_budget_s {
                    attempts.push(CoarseningAttempt {
                        resolution,
                        work_units,
                        elapsed_s: Some(elapsed),
                        outcome: AttemptOutcome::OverTimeBudget,
                    });
                    warn!(
                        "Density binning took {:.3} s over {} attempts, budget is {:.3} s",
                        total,
                        attempts.len(),
                        policy.time_budget_s
                    );
                    return Err(FlowError::BudgetExceeded(format!(
                        "density binning took {:.3} s over {} attempts ({:.3} km x {:.0} s), budget is {:.3} s",
                        total,
                        attempts.len(),
                        resolution.bin_km,
                        resolution.window_s,
                        policy.time_budget_s
                    )));
                }
                attempts.push(CoarseningAttempt {
                    resolution,
                    work_units,
                    elapsed_s: Some(elapsed),
                    outcome: AttemptOutcome::Accepted,
                });
                info!(
                    "Density binned: {} segments at {:.3} km x {:.0} s ({} work units, {:.1} ms)",
                    grids.len(),
                    resolution.bin_km,
                    resolution.window_s,
                    work_units,
                    total * 1000.0
                );
                return Ok(DensityOutcome {
                    origin_s: self.origin_s,
                    resolution,
                    attempts,
                    grids,
                    skipped,
                });
            }

            if resolution.coarsening_steps >= policy.max_steps {
                break;
            }
            match resolution.coarsen(policy) {
                Some(next) => {
                    warn!(
                        "Coarsening density grid to {:.3} km x {:.0} s (step {})",
                        next.bin_km, next.window_s, next.coarsening_steps
                    );
                    resolution = next;
                }
                None => break,
            }
        }

        debug!("Coarsening attempts: {:?}", attempts);
        Err(FlowError::BudgetExceeded(format!(
            "density binning still over budget after {} coarsening steps ({:.3} km x {:.0} s)",
            resolution.coarsening_steps, resolution.bin_km, resolution.window_s
        )))
    }
}
