//! Composite operational score per event group.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{LosClass, ScoreWeights};
use crate::course::{EventGroup, Segment};
use crate::density::DensityBin;
use crate::interp::EventTracks;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GroupScore {
    pub group: String,
    pub events: Vec<String>,
    pub worst_los: LosClass,
    pub worst_los_segment: Option<String>,
    pub peak_density: f64,
    pub peak_density_segment: Option<String>,
    pub peak_flow_rate: f64,
    pub peak_flow_segment: Option<String>,
    pub composite: f64,
}

/// `100 × weighted mean of the LOS rank, density and flow terms`, each term
/// normalized to `0..=1`.
pub fn composite(
    worst_los: LosClass,
    peak_density: f64,
    peak_flow_rate: f64,
    weights: &ScoreWeights,
) -> f64 {
    let total = weights.los + weights.density + weights.flow;
    if total <= 0.0 {
        return 0.0;
    }
    let los_term = worst_los.rank() as f64 / LosClass::F.rank() as f64;
    let density_term = (peak_density / weights.ref_density).min(1.0);
    let flow_term = (peak_flow_rate / weights.ref_flow_rate).min(1.0);
    100.0 * (weights.los * los_term + weights.density * density_term + weights.flow * flow_term)
        / total
}

/// Score every group over the bins of segments its events use, restricted to
/// windows inside the group's active span.
pub fn score_groups(
    groups: &[EventGroup],
    segments: &[Segment],
    bins: &[DensityBin],
    tracks: &BTreeMap<String, EventTracks>,
    weights: &ScoreWeights,
) -> Vec<GroupScore> {
    groups
        .iter()
        .map(|group| {
            let span = group
                .events
                .iter()
                .filter_map(|name| tracks.get(name)?.time_span())
                .reduce(|a, b| (a.0.min(b.0), a.1.max(b.1)));
            let in_group: Vec<&str> = segments
                .iter()
                .filter(|s| group.events.iter().any(|e| s.applies_to(e)))
                .map(|s| s.seg_id.as_str())
                .collect();

            let mut score = GroupScore {
                group: group.name.clone(),
                events: group.events.clone(),
                worst_los: LosClass::A,
                worst_los_segment: None,
                peak_density: 0.0,
                peak_density_segment: None,
                peak_flow_rate: 0.0,
                peak_flow_segment: None,
                composite: 0.0,
            };
            if let Some((start, finish)) = span {
                let relevant = bins.iter().filter(|b| {
                    in_group.contains(&b.seg_id.as_str())
                        && b.window_end_s > start
                        && b.window_start_s < finish
                });
                for bin in relevant {
                    if score.worst_los_segment.is_none() || bin.los_class > score.worst_los {
                        score.worst_los = bin.los_class;
                        score.worst_los_segment = Some(bin.seg_id.clone());
                    }
                    if bin.density_p_per_m2 > score.peak_density {
                        score.peak_density = bin.density_p_per_m2;
                        score.peak_density_segment = Some(bin.seg_id.clone());
                    }
                    if bin.flow_rate > score.peak_flow_rate {
                        score.peak_flow_rate = bin.flow_rate;
                        score.peak_flow_segment = Some(bin.seg_id.clone());
                    }
                }
            }
            score.composite = composite(
                score.worst_los,
                score.peak_density,
                score.peak_flow_rate,
                weights,
            );
            score
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::fixtures::{event, runner, segment};

    fn bin(
        seg_id: &str,
        window_start_s: f64,
        density: f64,
        flow_rate: f64,
        los: LosClass,
    ) -> DensityBin {
        DensityBin {
            seg_id: seg_id.into(),
            bin_index: 0,
            window_index: 0,
            bin_start_km: 0.0,
            bin_end_km: 0.1,
            window_start_s,
            window_end_s: window_start_s + 60.0,
            window_start_clock: String::new(),
            occupant_count: 1,
            density_p_per_m2: density,
            mean_speed_mps: 3.0,
            flow_rate,
            los_class: los,
        }
    }

    #[test]
    fn composite_is_bounded_and_weighted() {
        let weights = ScoreWeights::default();
        assert_eq!(composite(LosClass::A, 0.0, 0.0, &weights), 0.0);
        assert_eq!(composite(LosClass::F, 5.0, 200.0, &weights), 100.0);
        let mid = composite(LosClass::C, 0.815, 41.0, &weights);
        assert!((mid - 100.0 * (0.4 + 0.5 + 0.5) / 3.0).abs() < 1e-9);

        let los_only = ScoreWeights {
            density: 0.0,
            flow: 0.0,
            ..ScoreWeights::default()
        };
        assert!((composite(LosClass::D, 9.0, 9.0, &los_only) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn groups_only_see_their_segments_and_hours() {
        let day1 = event("Sat5K", 480.0, 5.0);
        let day2 = event("SunFull", 1440.0 + 420.0, 42.2);
        let mut tracks = BTreeMap::new();
        for (ev, id) in [(&day1, "s1"), (&day2, "f1")] {
            let (t, _) = EventTracks::build(ev, &[runner(id, &ev.name, 5.0, 0.0)]);
            tracks.insert(ev.name.clone(), t);
        }
        let segments = vec![
            segment("P1", 0.0, 1.0, 5.0, &["Sat5K"]),
            segment("M1", 0.0, 1.0, 5.0, &["SunFull"]),
        ];
        let sat_start = day1.start_s();
        let sun_start = day2.start_s();
        let bins = vec![
            bin("P1", sat_start + 60.0, 0.4, 20.0, LosClass::B),
            bin("M1", sun_start + 600.0, 1.2, 50.0, LosClass::E),
            // outside every group's hours
            bin("P1", sun_start, 3.0, 90.0, LosClass::F),
        ];
        let groups = vec![
            EventGroup {
                name: "saturday".into(),
                events: vec!["Sat5K".into()],
            },
            EventGroup {
                name: "sunday".into(),
                events: vec!["SunFull".into()],
            },
        ];
        let scores = score_groups(&groups, &segments, &bins, &tracks, &ScoreWeights::default());
        assert_eq!(scores[0].worst_los, LosClass::B);
        assert_eq!(scores[0].peak_density_segment.as_deref(), Some("P1"));
        assert_eq!(scores[1].worst_los, LosClass::E);
        assert_eq!(scores[1].peak_flow_rate, 50.0);
        assert!(scores[1].composite > scores[0].composite);
    }
}
