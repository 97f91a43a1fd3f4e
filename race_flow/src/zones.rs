//! Partition of a shared segment into flow zones bounded by convergence points.

use serde::{Deserialize, Serialize};

use crate::config::ZoneConfig;
use crate::convergence::ConvergencePoint;
use crate::course::{FlowPair, KmRange, Segment};
use crate::round_km;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryKind {
    SegmentEdge,
    Convergence,
    Split,
}

impl BoundaryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BoundaryKind::SegmentEdge => "segment_edge",
            BoundaryKind::Convergence => "convergence",
            BoundaryKind::Split => "split",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FlowZone {
    pub seg_id: String,
    pub event_a: String,
    pub event_b: String,
    pub zone_index: usize,
    pub start_fraction: f64,
    pub end_fraction: f64,
    pub zone_start_km_a: f64,
    pub zone_end_km_a: f64,
    pub zone_start_km_b: f64,
    pub zone_end_km_b: f64,
    pub start_kind: BoundaryKind,
    pub end_kind: BoundaryKind,
}

impl FlowZone {
    pub fn range_a(&self) -> KmRange {
        KmRange::new(self.zone_start_km_a, self.zone_end_km_a)
    }

    pub fn range_b(&self) -> KmRange {
        KmRange::new(self.zone_start_km_b, self.zone_end_km_b)
    }

    pub fn length_m(&self, segment: &Segment) -> f64 {
        (self.end_fraction - self.start_fraction) * segment.length_m()
    }
}

/// Boundary fractions after merging short gaps and splitting long ones.
pub(crate) fn boundaries(
    cp_fractions: &[f64],
    length_m: f64,
    config: &ZoneConfig,
) -> Vec<(f64, BoundaryKind)> {
    let mut kept = vec![(0.0, BoundaryKind::SegmentEdge)];
    for &f in cp_fractions {
        if f <= 0.0 || f >= 1.0 {
            continue;
        }
        let (last, _) = kept[kept.len() - 1];
        if (f - last) * length_m < config.min_zone_m {
            continue;
        }
        kept.push((f, BoundaryKind::Convergence));
    }
    // a short tail zone merges into its predecessor
    if kept.len() > 1 && (1.0 - kept[kept.len() - 1].0) * length_m < config.min_zone_m {
        kept.pop();
    }
    kept.push((1.0, BoundaryKind::SegmentEdge));

    let mut out = vec![kept[0]];
    for window in kept.windows(2) {
        let (f0, f1) = (window[0].0, window[1].0);
        let gap_m = (f1 - f0) * length_m;
        if gap_m > config.max_zone_m {
            let parts = (gap_m / config.target_zone_m).ceil() as usize;
            for k in 1..parts {
                out.push((
                    f0 + (f1 - f0) * k as f64 / parts as f64,
                    BoundaryKind::Split,
                ));
            }
        }
        out.push(window[1]);
    }
    out
}

/// Zones for one segment/event pair, indexed by ascending distance. No
/// convergence points means no zones.
pub fn build_zones(
    segment: &Segment,
    pair: &FlowPair,
    points: &[ConvergencePoint],
    config: &ZoneConfig,
) -> Vec<FlowZone> {
    let (Some(range_a), Some(range_b)) = (
        segment.range_for(&pair.event_a),
        segment.range_for(&pair.event_b),
    ) else {
        return Vec::new();
    };
    if points.is_empty() {
        return Vec::new();
    }
    let mut fractions: Vec<f64> = points.iter().map(|p| p.fraction).collect();
    fractions.sort_by(f64::total_cmp);

    let bounds = boundaries(&fractions, segment.length_m(), config);
    bounds
        .windows(2)
        .enumerate()
        .map(|(zone_index, w)| {
            let ((f0, start_kind), (f1, end_kind)) = (w[0], w[1]);
            FlowZone {
                seg_id: segment.seg_id.clone(),
                event_a: pair.event_a.clone(),
                event_b: pair.event_b.clone(),
                zone_index,
                start_fraction: f0,
                end_fraction: f1,
                zone_start_km_a: range_a.at_fraction(f0),
                zone_end_km_a: range_a.at_fraction(f1),
                zone_start_km_b: range_b.at_fraction(f0),
                zone_end_km_b: range_b.at_fraction(f1),
                start_kind,
                end_kind,
            }
        })
        .collect()
}

/// Kilometre bounds rounded to the metre for reporting.
pub fn display_bounds(zone: &FlowZone) -> [f64; 4] {
    [
        round_km(zone.zone_start_km_a),
        round_km(zone.zone_end_km_a),
        round_km(zone.zone_start_km_b),
        round_km(zone.zone_end_km_b),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::fixtures::segment;

    fn point(fraction: f64) -> ConvergencePoint {
        ConvergencePoint {
            seg_id: "S".into(),
            event_a: "A".into(),
            event_b: "B".into(),
            cp_km: 0.0,
            cp_km_b: 0.0,
            fraction,
            crossings: 1,
        }
    }

    fn pair() -> FlowPair {
        FlowPair {
            seg_id: "S".into(),
            event_a: "A".into(),
            event_b: "B".into(),
        }
    }

    fn assert_contiguous(zones: &[FlowZone]) {
        assert_eq!(zones.first().unwrap().start_fraction, 0.0);
        assert_eq!(zones.last().unwrap().end_fraction, 1.0);
        for (i, w) in zones.windows(2).enumerate() {
            assert_eq!(w[0].end_fraction, w[1].start_fraction);
            assert_eq!(w[0].zone_index, i);
            assert!(w[0].end_fraction > w[0].start_fraction);
        }
    }

    #[test]
    fn convergence_points_bound_zones() {
        let seg = segment("S", 0.0, 0.4, 5.0, &["A", "B"]);
        let zones = build_zones(&seg, &pair(), &[point(0.5)], &ZoneConfig::default());
        assert_eq!(zones.len(), 2);
        assert_contiguous(&zones);
        assert_eq!(zones[0].end_kind, BoundaryKind::Convergence);
        assert_eq!(zones[1].start_kind, BoundaryKind::Convergence);
        assert!((zones[0].zone_end_km_a - 0.2).abs() < 1e-12);
    }

    #[test]
    fn close_points_merge_and_short_tail_folds_back() {
        let seg = segment("S", 0.0, 0.4, 5.0, &["A", "B"]);
        // 0.55 is 20 m after 0.5; 0.9 leaves a 40 m tail
        let zones = build_zones(
            &seg,
            &pair(),
            &[point(0.5), point(0.55), point(0.9)],
            &ZoneConfig::default(),
        );
        assert_eq!(zones.len(), 2);
        assert_contiguous(&zones);
        assert_eq!(zones[1].end_kind, BoundaryKind::SegmentEdge);
    }

    #[test]
    fn long_gaps_split_into_target_sized_parts() {
        let seg = segment("S", 1.0, 2.0, 5.0, &["A", "B"]);
        let zones = build_zones(&seg, &pair(), &[point(0.33)], &ZoneConfig::default());
        // 330 m -> 3 parts, 670 m -> 6 parts
        assert_eq!(zones.len(), 9);
        assert_contiguous(&zones);
        assert_eq!(zones[3].start_kind, BoundaryKind::Convergence);
        assert_eq!(zones[1].start_kind, BoundaryKind::Split);
        for zone in &zones {
            let len = zone.length_m(&seg);
            assert!(len <= 250.0 && len >= 50.0);
        }
    }

    #[test]
    fn per_event_axes_follow_their_own_ranges() {
        let mut seg = segment("S", 1.0, 1.2, 5.0, &["A", "B"]);
        seg.event_ranges
            .insert("B".into(), KmRange::new(11.0, 11.2));
        let zones = build_zones(&seg, &pair(), &[point(0.5)], &ZoneConfig::default());
        assert_eq!(display_bounds(&zones[1]), [1.1, 1.2, 11.1, 11.2]);
    }

    #[test]
    fn no_points_no_zones() {
        let seg = segment("S", 0.0, 1.0, 5.0, &["A", "B"]);
        assert!(build_zones(&seg, &pair(), &[], &ZoneConfig::default()).is_empty());
    }
}
