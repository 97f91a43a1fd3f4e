//! Per-zone overtaking, co-presence and participant accounting.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::InteractionConfig;
use crate::interp::EventTracks;
use crate::strategy::{select_strategy, PairOutcome, StrategyKind, ZoneTimes};
use crate::zones::FlowZone;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::A => "a",
            Side::B => "b",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Overtaking,
    Overtaken,
    Copresent,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Overtaking => "overtaking",
            Role::Overtaken => "overtaken",
            Role::Copresent => "copresent",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunnerParticipation {
    pub seg_id: String,
    pub event_a: String,
    pub event_b: String,
    pub zone_index: usize,
    pub runner_id: String,
    pub event: String,
    pub role: Role,
    pub side: Side,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ZoneMetrics {
    pub overtaking_a: usize,
    pub overtaking_b: usize,
    pub overtaken_a: usize,
    pub overtaken_b: usize,
    pub copresence_a: usize,
    pub copresence_b: usize,
    pub unique_encounters: usize,
    pub participants_involved: usize,
    pub multi_category_runners: usize,
    pub runners_a: usize,
    pub runners_b: usize,
    pub strategy: StrategyKind,
}

impl ZoneMetrics {
    pub fn role_count_sum(&self) -> usize {
        self.overtaking_a
            + self.overtaking_b
            + self.overtaken_a
            + self.overtaken_b
            + self.copresence_a
            + self.copresence_b
    }

    pub fn has_interaction(&self) -> bool {
        self.role_count_sum() > 0
    }

    pub fn overtaking_total(&self) -> usize {
        self.overtaking_a + self.overtaking_b
    }

    pub fn copresence_total(&self) -> usize {
        self.copresence_a + self.copresence_b
    }
}

/// A zone with its metrics, one row of the zone dataset.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ZoneReport {
    pub zone: FlowZone,
    pub metrics: ZoneMetrics,
}

#[derive(Default)]
struct RoleSets {
    overtaking: BTreeSet<usize>,
    overtaken: BTreeSet<usize>,
    copresent: BTreeSet<usize>,
}

impl RoleSets {
    fn union(&self) -> BTreeSet<usize> {
        self.overtaking
            .iter()
            .chain(&self.overtaken)
            .chain(&self.copresent)
            .copied()
            .collect()
    }

    fn rows(&self) -> impl Iterator<Item = (usize, Role)> + '_ {
        self.overtaking
            .iter()
            .map(|&i| (i, Role::Overtaking))
            .chain(self.overtaken.iter().map(|&i| (i, Role::Overtaken)))
            .chain(self.copresent.iter().map(|&i| (i, Role::Copresent)))
    }
}

/// Entry/exit times of every on-course runner at the zone's bounds.
pub fn zone_times(
    zone: &FlowZone,
    tracks_a: &EventTracks,
    tracks_b: &EventTracks,
) -> (ZoneTimes, ZoneTimes) {
    let a = ZoneTimes::from_arrivals(
        tracks_a.arrival_times(zone.zone_start_km_a),
        tracks_a.arrival_times(zone.zone_end_km_a),
    );
    let b = ZoneTimes::from_arrivals(
        tracks_b.arrival_times(zone.zone_start_km_b),
        tracks_b.arrival_times(zone.zone_end_km_b),
    );
    (a, b)
}

/// Metrics and participation rows for one zone. Zones without any
/// interaction return no participation rows.
pub fn compute_zone_metrics(
    zone: &FlowZone,
    tracks_a: &EventTracks,
    tracks_b: &EventTracks,
    config: &InteractionConfig,
) -> (ZoneMetrics, Vec<RunnerParticipation>) {
    let (a, b) = zone_times(zone, tracks_a, tracks_b);
    let kind = select_strategy(a.len(), b.len(), config);
    let hits = kind.build(config).evaluate(&a, &b, config.dwell_s);

    let mut side_a = RoleSets::default();
    let mut side_b = RoleSets::default();
    for hit in &hits {
        let (ra, rb) = (a.rows[hit.a], b.rows[hit.b]);
        match hit.outcome {
            PairOutcome::AOvertakesB => {
                side_a.overtaking.insert(ra);
                side_b.overtaken.insert(rb);
            }
            PairOutcome::BOvertakesA => {
                side_b.overtaking.insert(rb);
                side_a.overtaken.insert(ra);
            }
            PairOutcome::Copresent => {
                side_a.copresent.insert(ra);
                side_b.copresent.insert(rb);
            }
        }
    }

    let participants_involved = side_a.union().len() + side_b.union().len();
    let mut metrics = ZoneMetrics {
        overtaking_a: side_a.overtaking.len(),
        overtaking_b: side_b.overtaking.len(),
        overtaken_a: side_a.overtaken.len(),
        overtaken_b: side_b.overtaken.len(),
        copresence_a: side_a.copresent.len(),
        copresence_b: side_b.copresent.len(),
        unique_encounters: hits.len(),
        participants_involved,
        multi_category_runners: 0,
        runners_a: a.len(),
        runners_b: b.len(),
        strategy: kind,
    };
    metrics.multi_category_runners = metrics.role_count_sum() - participants_involved;

    if !metrics.has_interaction() {
        return (metrics, Vec::new());
    }

    let row = |side: Side, tracks: &EventTracks, index: usize, role: Role| RunnerParticipation {
        seg_id: zone.seg_id.clone(),
        event_a: zone.event_a.clone(),
        event_b: zone.event_b.clone(),
        zone_index: zone.zone_index,
        runner_id: tracks.tracks[index].runner_id.clone(),
        event: tracks.event.clone(),
        role,
        side,
    };
    let participation = side_a
        .rows()
        .map(|(i, role)| row(Side::A, tracks_a, i, role))
        .chain(
            side_b
                .rows()
                .map(|(i, role)| row(Side::B, tracks_b, i, role)),
        )
        .collect();
    (metrics, participation)
}

/// The zone with the most overtaking; ties go to the most co-presence, then
/// to the lowest zone index.
pub fn worst_zone<'a, I>(zones: I) -> Option<usize>
where
    I: IntoIterator<Item = (usize, &'a ZoneMetrics)>,
{
    zones
        .into_iter()
        .max_by(|(ia, a), (ib, b)| {
            a.overtaking_total()
                .cmp(&b.overtaking_total())
                .then(a.copresence_total().cmp(&b.copresence_total()))
                .then(ib.cmp(ia))
        })
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Engine;
    use crate::course::fixtures::{event, runner};
    use crate::course::Runner;
    use crate::zones::BoundaryKind;

    fn zone(start_km: f64, end_km: f64) -> FlowZone {
        FlowZone {
            seg_id: "S".into(),
            event_a: "A".into(),
            event_b: "B".into(),
            zone_index: 0,
            start_fraction: 0.0,
            end_fraction: 1.0,
            zone_start_km_a: start_km,
            zone_end_km_a: end_km,
            zone_start_km_b: start_km,
            zone_end_km_b: end_km,
            start_kind: BoundaryKind::SegmentEdge,
            end_kind: BoundaryKind::SegmentEdge,
        }
    }

    fn tracks(name: &str, runners: &[Runner]) -> EventTracks {
        EventTracks::build(&event(name, 0.0, 10.0), runners).0
    }

    fn metrics(overtaking: (usize, usize), copresence: (usize, usize)) -> ZoneMetrics {
        ZoneMetrics {
            overtaking_a: overtaking.0,
            overtaking_b: overtaking.1,
            overtaken_a: 0,
            overtaken_b: 0,
            copresence_a: copresence.0,
            copresence_b: copresence.1,
            unique_encounters: 0,
            participants_involved: 0,
            multi_category_runners: 0,
            runners_a: 0,
            runners_b: 0,
            strategy: StrategyKind::Direct,
        }
    }

    #[test]
    fn roles_and_participants_balance() {
        // a1 is passed by b1 and b2; a2 shares the zone with b3 without a pass.
        let a = tracks(
            "A",
            &[runner("a1", "A", 6.0, 0.0), runner("a2", "A", 5.0, 900.0)],
        );
        let b = tracks(
            "B",
            &[
                runner("b1", "B", 4.0, 150.0),
                runner("b2", "B", 4.5, 100.0),
                runner("b3", "B", 5.0, 910.0),
            ],
        );
        let (m, rows) =
            compute_zone_metrics(&zone(1.0, 2.0), &a, &b, &InteractionConfig::default());
        assert_eq!((m.overtaking_b, m.overtaken_a), (2, 1));
        assert_eq!((m.copresence_a, m.copresence_b), (1, 1));
        assert_eq!(m.unique_encounters, 3);
        assert_eq!(m.participants_involved, 5);
        assert_eq!(m.multi_category_runners, 0);
        assert_eq!(rows.len(), 5);
        assert!(rows
            .iter()
            .any(|r| r.runner_id == "b3" && r.role == Role::Copresent && r.side == Side::B));
    }

    #[test]
    fn zero_interaction_zone_has_no_participation_rows() {
        let a = tracks("A", &[runner("a1", "A", 5.0, 0.0)]);
        let b = tracks("B", &[runner("b1", "B", 5.0, 3600.0)]);
        let (m, rows) =
            compute_zone_metrics(&zone(1.0, 2.0), &a, &b, &InteractionConfig::default());
        assert!(!m.has_interaction());
        assert_eq!(m.runners_a, 1);
        assert!(rows.is_empty());
    }

    #[test]
    fn forced_engines_report_identical_sets() {
        let a: Vec<Runner> = (0..60)
            .map(|i| {
                runner(
                    &format!("a{i}"),
                    "A",
                    5.0 + (i % 7) as f64 * 0.3,
                    i as f64 * 11.0,
                )
            })
            .collect();
        let b: Vec<Runner> = (0..80)
            .map(|i| {
                runner(
                    &format!("b{i}"),
                    "B",
                    4.0 + (i % 5) as f64 * 0.4,
                    i as f64 * 9.0,
                )
            })
            .collect();
        let (a, b) = (tracks("A", &a), tracks("B", &b));
        let mut config = InteractionConfig::default();
        config.engine = Engine::Direct;
        let direct = compute_zone_metrics(&zone(2.0, 2.2), &a, &b, &config);
        config.engine = Engine::Binned;
        let binned = compute_zone_metrics(&zone(2.0, 2.2), &a, &b, &config);
        assert_eq!(direct.0.strategy, StrategyKind::Direct);
        assert_eq!(binned.0.strategy, StrategyKind::Binned);
        assert_eq!(direct.1, binned.1);
        assert_eq!(
            ZoneMetrics {
                strategy: StrategyKind::Direct,
                ..binned.0
            },
            direct.0
        );
        assert!(direct.0.has_interaction());
    }

    #[test]
    fn worst_zone_breaks_ties_on_copresence_then_index() {
        let zones = [
            metrics((2, 1), (0, 0)),
            metrics((1, 2), (2, 1)),
            metrics((3, 0), (1, 2)),
            metrics((0, 1), (9, 9)),
        ];
        let worst = worst_zone(zones.iter().enumerate());
        assert_eq!(worst, Some(1));

        let tied = [metrics((1, 1), (1, 0)), metrics((2, 0), (0, 1))];
        assert_eq!(worst_zone(tied.iter().enumerate()), Some(0));
        assert_eq!(worst_zone(std::iter::empty()), None);
    }
}
