//! Cross-check of bin-aggregated occupancy against a direct per-runner count.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ReconcileConfig;
use crate::course::Segment;
use crate::density::{clock_label, DensityOutcome, SegmentGrid};
use crate::interp::EventTracks;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WindowMismatch {
    pub window_index: usize,
    pub window_start_clock: String,
    pub canonical_count: u64,
    pub aggregated_count: u64,
    pub relative_error: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SegmentReconciliation {
    pub seg_id: String,
    pub windows_checked: usize,
    pub max_relative_error: f64,
    /// Peak segment-level density from the direct count.
    pub canonical_peak_density: f64,
    /// Peak segment-level density from summed bins.
    pub aggregated_peak_density: f64,
    /// Highest single-bin density in the segment.
    pub peak_bin_density: f64,
    pub flagged: bool,
    pub mismatches: Vec<WindowMismatch>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationReport {
    pub tolerance: f64,
    pub windows_checked: usize,
    pub max_relative_error: f64,
    pub segments: Vec<SegmentReconciliation>,
    pub valid: bool,
}

impl ReconciliationReport {
    pub fn flagged_segments(&self) -> impl Iterator<Item = &SegmentReconciliation> {
        self.segments.iter().filter(|s| s.flagged)
    }
}

/// `|aggregated - canonical| / canonical`, with an empty canonical window
/// scoring 0 when the bins agree and 1 otherwise.
pub fn relative_error(canonical: u64, aggregated: u64) -> f64 {
    if canonical == 0 {
        if aggregated == 0 {
            0.0
        } else {
            1.0
        }
    } else {
        (aggregated as f64 - canonical as f64).abs() / canonical as f64
    }
}

/// Runners on the segment at `t`, counted one track at a time.
fn canonical_count(segment: &Segment, tracks: &BTreeMap<String, EventTracks>, t: f64) -> u64 {
    let mut count = 0;
    for name in &segment.applicable_events {
        let (Some(event_tracks), Some(range)) = (tracks.get(name), segment.range_for(name)) else {
            continue;
        };
        count += event_tracks
            .tracks
            .iter()
            .filter_map(|track| track.position_at(t).km())
            .filter(|&km| range.contains(km))
            .count() as u64;
    }
    count
}

fn reconcile_segment(
    grid: &SegmentGrid,
    segment: &Segment,
    outcome: &DensityOutcome,
    tracks: &BTreeMap<String, EventTracks>,
    tolerance: f64,
) -> SegmentReconciliation {
    let area = segment.length_m() * segment.width_m;
    let mut report = SegmentReconciliation {
        seg_id: segment.seg_id.clone(),
        windows_checked: grid.n_windows(),
        max_relative_error: 0.0,
        canonical_peak_density: 0.0,
        aggregated_peak_density: 0.0,
        peak_bin_density: 0.0,
        flagged: false,
        mismatches: Vec::new(),
    };

    for row in 0..grid.n_windows() {
        let window = grid.first_window + row;
        let canonical = canonical_count(segment, tracks, outcome.sample_time(window));
        let aggregated = grid.window_total(row);
        report.canonical_peak_density = report.canonical_peak_density.max(canonical as f64 / area);
        report.aggregated_peak_density =
            report.aggregated_peak_density.max(aggregated as f64 / area);
        for bin in 0..grid.n_bins() {
            let count = grid.counts[[row, bin]];
            if count > 0 {
                let density = count as f64 / (grid.bin_length_m(bin) * segment.width_m);
                report.peak_bin_density = report.peak_bin_density.max(density);
            }
        }

        let error = relative_error(canonical, aggregated);
        report.max_relative_error = report.max_relative_error.max(error);
        if error > tolerance {
            report.mismatches.push(WindowMismatch {
                window_index: window,
                window_start_clock: clock_label(outcome.window_start_s(window)),
                canonical_count: canonical,
                aggregated_count: aggregated,
                relative_error: error,
            });
        }
    }
    report.flagged = report.max_relative_error > tolerance;
    report
}

/// Compare every evaluated window of every binned segment. Mismatches are
/// recorded in the report, never raised.
pub fn reconcile(
    outcome: &DensityOutcome,
    segments: &[Segment],
    tracks: &BTreeMap<String, EventTracks>,
    config: &ReconcileConfig,
) -> ReconciliationReport {
    let segment_reports: Vec<SegmentReconciliation> = outcome
        .grids
        .par_iter()
        .map(|grid| {
            reconcile_segment(
                grid,
                &segments[grid.seg_index],
                outcome,
                tracks,
                config.tolerance,
            )
        })
        .collect();

    let windows_checked = segment_reports.iter().map(|s| s.windows_checked).sum();
    let max_relative_error = segment_reports
        .iter()
        .map(|s| s.max_relative_error)
        .fold(0.0, f64::max);
    for flagged in segment_reports.iter().filter(|s| s.flagged) {
        warn!(
            "Reconciliation flagged {}: max relative error {:.4} over tolerance {:.4}",
            flagged.seg_id, flagged.max_relative_error, config.tolerance
        );
    }
    let valid = segment_reports.iter().all(|s| !s.flagged);
    info!(
        "Reconciled {} windows across {} segments (max error {:.4}, valid={})",
        windows_checked,
        segment_reports.len(),
        max_relative_error,
        valid
    );

    ReconciliationReport {
        tolerance: config.tolerance,
        windows_checked,
        max_relative_error,
        segments: segment_reports,
        valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::course::fixtures::{event, runner, segment};
    use crate::density::DensityBinner;
    use crate::engine::CancelToken;

    fn binned() -> (Vec<Segment>, BTreeMap<String, EventTracks>, DensityOutcome) {
        let full = event("Full", 0.0, 42.2);
        let tenk = event("10K", 10.0, 10.0);
        let runners: Vec<_> = (0..40)
            .map(|i| {
                runner(
                    &format!("f{i}"),
                    "Full",
                    4.0 + i as f64 * 0.05,
                    i as f64 * 7.0,
                )
            })
            .chain((0..25).map(|i| {
                runner(
                    &format!("t{i}"),
                    "10K",
                    3.5 + i as f64 * 0.1,
                    i as f64 * 3.0,
                )
            }))
            .collect();
        let mut tracks = BTreeMap::new();
        for ev in [&full, &tenk] {
            let (t, _) = EventTracks::build(ev, runners.iter().filter(|r| r.event == ev.name));
            tracks.insert(ev.name.clone(), t);
        }
        let segments = vec![
            segment("A1", 0.0, 0.95, 4.0, &["Full", "10K"]),
            segment("A2", 2.0, 3.0, 6.0, &["Full"]),
        ];
        let config = EngineConfig::default();
        let outcome = DensityBinner::new(&segments, &tracks, &config, 0.0)
            .run(&CancelToken::default())
            .unwrap();
        (segments, tracks, outcome)
    }

    #[test]
    fn relative_error_handles_empty_windows() {
        assert_eq!(relative_error(0, 0), 0.0);
        assert_eq!(relative_error(0, 3), 1.0);
        assert_eq!(relative_error(50, 49), 0.02);
    }

    #[test]
    fn binned_counts_reconcile_within_tolerance() {
        let (segments, tracks, outcome) = binned();
        let report = reconcile(&outcome, &segments, &tracks, &ReconcileConfig::default());
        assert!(report.valid);
        assert!(report.windows_checked > 0);
        assert!(report.max_relative_error <= 0.02);
        assert_eq!(report.flagged_segments().count(), 0);
        for seg in &report.segments {
            assert!(seg.canonical_peak_density > 0.0);
            assert!(seg.peak_bin_density >= seg.aggregated_peak_density);
        }
    }

    #[test]
    fn drifted_bins_flag_segment_and_invalidate_run() {
        let (segments, tracks, mut outcome) = binned();
        let grid = &mut outcome.grids[1];
        let row = (0..grid.n_windows())
            .find(|&r| grid.window_total(r) > 0)
            .unwrap();
        grid.counts[[row, 0]] += 5;
        let report = reconcile(&outcome, &segments, &tracks, &ReconcileConfig::default());
        assert!(!report.valid);
        let flagged: Vec<&str> = report
            .flagged_segments()
            .map(|s| s.seg_id.as_str())
            .collect();
        assert_eq!(flagged, vec!["A2"]);
        assert_eq!(
            report.segments[1].mismatches[0].window_index,
            outcome.grids[1].first_window + row
        );
    }
}
