//! Where two events' position-time trajectories meet inside a shared segment.
//!
//! Each event is mapped onto the segment's physical fraction `f ∈ [0, 1]`
//! through its own km range, so a runner's arrival curve `t(f)` is
//! piecewise linear. Every cross-event runner pair whose curves intersect
//! contributes one crossing; nearby crossings collapse into one point.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ZoneConfig;
use crate::course::{FlowPair, KmRange, Segment};
use crate::interp::EventTracks;
use crate::round_km;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConvergencePoint {
    pub seg_id: String,
    pub event_a: String,
    pub event_b: String,
    /// Distance on event A's course, rounded to the metre.
    pub cp_km: f64,
    /// The same physical point on event B's course.
    pub cp_km_b: f64,
    /// Position along the segment, 0 at its start and 1 at its end.
    pub fraction: f64,
    /// Runner-pair crossings merged into this point.
    pub crossings: usize,
}

/// Wall-clock time of an arrival curve at fraction `f`.
fn time_at_fraction(curve: &[(f64, f64)], f: f64) -> f64 {
    let idx = curve
        .partition_point(|&(x, _)| x < f)
        .clamp(1, curve.len() - 1);
    let (f0, t0) = curve[idx - 1];
    let (f1, t1) = curve[idx];
    if f1 > f0 {
        t0 + (f - f0) / (f1 - f0) * (t1 - t0)
    } else {
        t0
    }
}

/// Fractions in `[0, 1]` where `a` and `b` reach the same point at the same time.
pub(crate) fn pair_crossings(a: &[(f64, f64)], b: &[(f64, f64)], out: &mut Vec<f64>) {
    let mut knots: Vec<f64> = a.iter().chain(b).map(|&(f, _)| f).collect();
    knots.sort_by(f64::total_cmp);
    knots.dedup();
    let last = knots.len().saturating_sub(1);
    for i in 0..last {
        let (f0, f1) = (knots[i], knots[i + 1]);
        let d0 = time_at_fraction(a, f0) - time_at_fraction(b, f0);
        let d1 = time_at_fraction(a, f1) - time_at_fraction(b, f1);
        if d0 == 0.0 && d1 == 0.0 {
            // identical trajectories over this piece
            continue;
        }
        if d0 == 0.0 {
            out.push(f0);
        } else if d0 * d1 < 0.0 {
            out.push(f0 + d0 / (d0 - d1) * (f1 - f0));
        }
        if i + 1 == last && d1 == 0.0 {
            out.push(f1);
        }
    }
}

/// Group sorted crossings into runs whose neighbours sit within `gap`.
fn cluster(sorted: &[f64], gap: f64) -> Vec<&[f64]> {
    let mut clusters = Vec::new();
    let mut start = 0;
    for i in 1..=sorted.len() {
        if i == sorted.len() || sorted[i] - sorted[i - 1] > gap {
            if i > start {
                clusters.push(&sorted[start..i]);
            }
            start = i;
        }
    }
    clusters
}

/// Convergence points for one declared pair on one segment, ascending.
pub fn detect(
    segment: &Segment,
    pair: &FlowPair,
    tracks_a: &EventTracks,
    tracks_b: &EventTracks,
    config: &ZoneConfig,
) -> Vec<ConvergencePoint> {
    let (Some(range_a), Some(range_b)) = (
        segment.range_for(&pair.event_a),
        segment.range_for(&pair.event_b),
    ) else {
        return Vec::new();
    };
    let curves_a = arrival_curves(tracks_a, range_a);
    let curves_b = arrival_curves(tracks_b, range_b);

    let mut roots: Vec<f64> = curves_a
        .par_iter()
        .flat_map_iter(|a| {
            let mut out = Vec::new();
            for b in &curves_b {
                pair_crossings(a, b, &mut out);
            }
            out
        })
        .collect();
    roots.sort_by(f64::total_cmp);

    if roots.is_empty() {
        debug!(
            "No crossings for {}/{} on {}",
            pair.event_a, pair.event_b, segment.seg_id
        );
        return Vec::new();
    }

    let length_m = segment.length_m();
    let gap = if length_m > 0.0 {
        config.cp_merge_m / length_m
    } else {
        0.0
    };
    let points: Vec<ConvergencePoint> = cluster(&roots, gap)
        .into_iter()
        .map(|members| {
            let median = members[(members.len() - 1) / 2];
            let cp_km = round_km(range_a.at_fraction(median));
            let fraction = range_a.fraction_of(cp_km).clamp(0.0, 1.0);
            ConvergencePoint {
                seg_id: segment.seg_id.clone(),
                event_a: pair.event_a.clone(),
                event_b: pair.event_b.clone(),
                cp_km,
                cp_km_b: round_km(range_b.at_fraction(fraction)),
                fraction,
                crossings: members.len(),
            }
        })
        .collect();
    debug!(
        "{}/{} on {}: {} crossings in {} convergence points",
        pair.event_a,
        pair.event_b,
        segment.seg_id,
        roots.len(),
        points.len()
    );
    points
}

fn arrival_curves(tracks: &EventTracks, range: KmRange) -> Vec<Vec<(f64, f64)>> {
    tracks
        .tracks
        .iter()
        .filter_map(|track| track.arrivals_across(range))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::fixtures::{event, runner, segment};
    use crate::course::Runner;

    fn tracks(name: &str, start_min: f64, runners: &[Runner]) -> EventTracks {
        EventTracks::build(&event(name, start_min, 21.1), runners).0
    }

    fn pair() -> FlowPair {
        FlowPair {
            seg_id: "S".into(),
            event_a: "A".into(),
            event_b: "B".into(),
        }
    }

    #[test]
    fn crossing_of_two_constant_paces() {
        let a = [(0.0, 100.0), (1.0, 400.0)];
        let b = [(0.0, 160.0), (1.0, 340.0)];
        let mut out = Vec::new();
        pair_crossings(&a, &b, &mut out);
        assert_eq!(out.len(), 1);
        assert!((out[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn parallel_and_identical_curves_do_not_cross() {
        let a = [(0.0, 100.0), (1.0, 400.0)];
        let mut out = Vec::new();
        pair_crossings(&a, &[(0.0, 150.0), (1.0, 450.0)], &mut out);
        pair_crossings(&a, &a, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn split_curves_can_cross_twice() {
        let a = [(0.0, 0.0), (1.0, 300.0)];
        let b = [(0.0, 30.0), (0.5, 120.0), (1.0, 330.0)];
        let mut out = Vec::new();
        pair_crossings(&a, &b, &mut out);
        assert_eq!(out.len(), 2);
        assert!(out[0] < 0.5 && out[1] > 0.5);
    }

    #[test]
    fn touching_at_segment_end_counts_once() {
        let a = [(0.0, 0.0), (1.0, 300.0)];
        let b = [(0.0, 60.0), (1.0, 300.0)];
        let mut out = Vec::new();
        pair_crossings(&a, &b, &mut out);
        assert_eq!(out, vec![1.0]);
    }

    #[test]
    fn crossings_cluster_into_rounded_points() {
        // B runners gain 240 s/km and cross the A runner just past km 1.330.
        let a = tracks("A", 0.0, &[runner("a1", "A", 8.0, 0.0)]);
        let b_runners: Vec<Runner> = (1..=5)
            .map(|k| runner(&format!("b{k}"), "B", 4.0, 19.2 + 0.024 * k as f64))
            .collect();
        let b = tracks("B", 5.0, &b_runners);
        let seg = segment("S", 1.0, 2.0, 5.0, &["A", "B"]);
        let points = detect(&seg, &pair(), &a, &b, &ZoneConfig::default());
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].cp_km, 1.33);
        assert_eq!(points[0].cp_km_b, 1.33);
        assert_eq!(points[0].crossings, 5);
        assert!((points[0].fraction - 0.33).abs() < 1e-9);
    }

    #[test]
    fn event_ranges_place_point_on_both_axes() {
        // B reaches the shared stretch at its own km 10 and catches A halfway.
        let a = tracks("A", 33.0, &[runner("a1", "A", 6.0, 0.0)]);
        let b = tracks("B", 0.0, &[runner("b1", "B", 4.0, 0.0)]);
        let mut seg = segment("S", 1.0, 2.0, 5.0, &["A", "B"]);
        seg.event_ranges
            .insert("B".into(), KmRange::new(10.0, 11.0));
        let points = detect(&seg, &pair(), &a, &b, &ZoneConfig::default());
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].cp_km, 1.5);
        assert_eq!(points[0].cp_km_b, 10.5);
    }

    #[test]
    fn distant_crossings_stay_separate() {
        let sorted = [0.10, 0.105, 0.109, 0.5, 0.9, 0.904];
        let clusters = cluster(&sorted, 0.01);
        let sizes: Vec<usize> = clusters.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![3, 1, 2]);
    }

    #[test]
    fn no_crossings_means_no_points() {
        let a = tracks("A", 0.0, &[runner("a1", "A", 4.0, 0.0)]);
        let b = tracks("B", 60.0, &[runner("b1", "B", 4.0, 0.0)]);
        let seg = segment("S", 1.0, 2.0, 5.0, &["A", "B"]);
        assert!(detect(&seg, &pair(), &a, &b, &ZoneConfig::default()).is_empty());
    }
}
