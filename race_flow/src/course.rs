//! Static race definitions: events, runners, course segments and the event
//! pairs that need flow analysis.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::FlowError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub name: String,
    /// Minutes after the run epoch (usually race-day midnight).
    pub start_offset_minutes: f64,
    pub distance_km: f64,
    #[serde(default)]
    pub runner_count: Option<usize>,
}

impl Event {
    pub fn start_s(&self) -> f64 {
        self.start_offset_minutes * 60.0
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PaceSplit {
    /// The split applies from the previous split's end up to this distance.
    pub until_km: f64,
    pub pace_min_per_km: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Pace {
    Constant(f64),
    /// Piecewise pace; the last split's pace carries on to the finish.
    Splits(Vec<PaceSplit>),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Runner {
    pub runner_id: String,
    pub event: String,
    pub pace: Pace,
    /// Seconds between the event gun and this runner crossing the start.
    pub start_offset_s: f64,
}

/// Distance interval on one event's own course, half-open `[from_km, to_km)`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct KmRange {
    pub from_km: f64,
    pub to_km: f64,
}

impl KmRange {
    pub fn new(from_km: f64, to_km: f64) -> Self {
        Self { from_km, to_km }
    }

    pub fn length_km(&self) -> f64 {
        self.to_km - self.from_km
    }

    pub fn contains(&self, km: f64) -> bool {
        km >= self.from_km && km < self.to_km
    }

    pub fn at_fraction(&self, fraction: f64) -> f64 {
        self.from_km + fraction * self.length_km()
    }

    pub fn fraction_of(&self, km: f64) -> f64 {
        let len = self.length_km();
        if len > 0.0 {
            (km - self.from_km) / len
        } else {
            0.0
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FlowType {
    #[default]
    None,
    Overtake,
    Merge,
    Parallel,
    Counterflow,
}

impl FlowType {
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "n/a" => Some(FlowType::None),
            "overtake" | "overtaking" => Some(FlowType::Overtake),
            "merge" => Some(FlowType::Merge),
            "parallel" => Some(FlowType::Parallel),
            "counterflow" => Some(FlowType::Counterflow),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub seg_id: String,
    pub label: String,
    pub start_km: f64,
    pub end_km: f64,
    pub width_m: f64,
    pub applicable_events: BTreeSet<String>,
    /// Per-event distances when an event reaches this stretch at a different
    /// point of its own course. Events not listed use `start_km..end_km`.
    #[serde(default)]
    pub event_ranges: BTreeMap<String, KmRange>,
    #[serde(default)]
    pub flow_type: FlowType,
}

impl Segment {
    pub fn length_km(&self) -> f64 {
        self.end_km - self.start_km
    }

    pub fn length_m(&self) -> f64 {
        self.length_km() * 1000.0
    }

    pub fn applies_to(&self, event: &str) -> bool {
        self.applicable_events.contains(event)
    }

    pub fn range_for(&self, event: &str) -> Option<KmRange> {
        if !self.applies_to(event) {
            return None;
        }
        Some(
            self.event_ranges
                .get(event)
                .copied()
                .unwrap_or_else(|| KmRange::new(self.start_km, self.end_km)),
        )
    }

    /// Why this segment cannot carry density, if it cannot.
    pub fn degenerate_reason(&self) -> Option<String> {
        if !self.start_km.is_finite() || !self.end_km.is_finite() {
            return Some("non-finite distance bounds".into());
        }
        if self.length_km() <= 0.0 {
            return Some(format!(
                "zero length ({:.3}..{:.3} km)",
                self.start_km, self.end_km
            ));
        }
        if !self.width_m.is_finite() || self.width_m <= 0.0 {
            return Some(format!("zero width ({} m)", self.width_m));
        }
        None
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlowPair {
    pub seg_id: String,
    pub event_a: String,
    pub event_b: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventGroup {
    pub name: String,
    pub events: Vec<String>,
}

/// Event-level configuration file: event definitions, declared flow pairs and
/// optional event groups for scoring.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct RaceConfig {
    pub events: Vec<Event>,
    #[serde(default)]
    pub flow_pairs: Vec<FlowPair>,
    #[serde(default)]
    pub groups: Vec<EventGroup>,
}

/// Everything a run reads. Shared read-only across all worker threads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct RaceInputs {
    pub segments: Vec<Segment>,
    pub events: Vec<Event>,
    pub runners: Vec<Runner>,
    pub flow_pairs: Vec<FlowPair>,
    pub groups: Vec<EventGroup>,
}

impl RaceInputs {
    pub fn new(race: RaceConfig, segments: Vec<Segment>, runners: Vec<Runner>) -> Self {
        Self {
            segments,
            events: race.events,
            runners,
            flow_pairs: race.flow_pairs,
            groups: race.groups,
        }
    }

    pub fn event(&self, name: &str) -> Option<&Event> {
        self.events.iter().find(|e| e.name == name)
    }

    pub fn segment(&self, seg_id: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.seg_id == seg_id)
    }

    /// Configured groups, or a single group holding every event.
    pub fn event_groups(&self) -> Vec<EventGroup> {
        if self.groups.is_empty() {
            vec![EventGroup {
                name: "all".into(),
                events: self.events.iter().map(|e| e.name.clone()).collect(),
            }]
        } else {
            self.groups.clone()
        }
    }

    /// Configuration checks that must pass before any computation starts.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.events.is_empty() {
            return Err(FlowError::MissingInput("event definitions".into()));
        }
        if self.segments.is_empty() {
            return Err(FlowError::MissingInput("segment table".into()));
        }

        let mut event_names = BTreeSet::new();
        for event in &self.events {
            if !event_names.insert(event.name.as_str()) {
                return Err(FlowError::InvalidInput(format!(
                    "event {} is defined twice",
                    event.name
                )));
            }
            if !event.start_offset_minutes.is_finite()
                || !event.distance_km.is_finite()
                || event.distance_km <= 0.0
            {
                return Err(FlowError::InvalidInput(format!(
                    "event {} needs a finite start offset and a positive distance",
                    event.name
                )));
            }
        }

        let mut runners_per_event: BTreeMap<&str, usize> = BTreeMap::new();
        for runner in &self.runners {
            if !event_names.contains(runner.event.as_str()) {
                return Err(FlowError::UnknownEvent(runner.event.clone()));
            }
            *runners_per_event.entry(runner.event.as_str()).or_default() += 1;
        }
        for event in &self.events {
            if !runners_per_event.contains_key(event.name.as_str()) {
                return Err(FlowError::MissingInput(format!(
                    "runner table for event {}",
                    event.name
                )));
            }
        }

        let mut seg_ids = BTreeSet::new();
        for segment in &self.segments {
            if !seg_ids.insert(segment.seg_id.as_str()) {
                return Err(FlowError::InvalidInput(format!(
                    "segment {} is defined twice",
                    segment.seg_id
                )));
            }
            for name in segment
                .applicable_events
                .iter()
                .chain(segment.event_ranges.keys())
            {
                let event = self
                    .event(name)
                    .ok_or_else(|| FlowError::UnknownEvent(name.clone()))?;
                if let Some(range) = segment.range_for(name) {
                    if range.from_km < 0.0 || range.to_km > event.distance_km + 1e-9 {
                        return Err(FlowError::InvalidInput(format!(
                            "segment {} runs {:.3}..{:.3} km on {} which is only {:.3} km long",
                            segment.seg_id, range.from_km, range.to_km, name, event.distance_km
                        )));
                    }
                }
            }
        }

        let mut declared: BTreeSet<(&str, &str, &str)> = BTreeSet::new();
        for pair in &self.flow_pairs {
            let segment = self
                .segment(&pair.seg_id)
                .ok_or_else(|| FlowError::UnknownSegment(pair.seg_id.clone()))?;
            for name in [&pair.event_a, &pair.event_b] {
                if self.event(name).is_none() {
                    return Err(FlowError::UnknownEvent(name.clone()));
                }
                if !segment.applies_to(name) {
                    return Err(FlowError::InvalidInput(format!(
                        "flow pair on {} names {} which does not use that segment",
                        pair.seg_id, name
                    )));
                }
            }
            if pair.event_a == pair.event_b {
                return Err(FlowError::InvalidInput(format!(
                    "flow pair on {} pairs {} with itself",
                    pair.seg_id, pair.event_a
                )));
            }
            let (low, high) = if pair.event_a < pair.event_b {
                (pair.event_a.as_str(), pair.event_b.as_str())
            } else {
                (pair.event_b.as_str(), pair.event_a.as_str())
            };
            declared.insert((pair.seg_id.as_str(), low, high));
        }

        // every unordered pair of events sharing a flow-typed segment needs a declaration
        for segment in &self.segments {
            if segment.flow_type == FlowType::None {
                continue;
            }
            let events: Vec<&str> = segment
                .applicable_events
                .iter()
                .map(String::as_str)
                .collect();
            for (i, low) in events.iter().enumerate() {
                for high in &events[i + 1..] {
                    if !declared.contains(&(segment.seg_id.as_str(), *low, *high)) {
                        return Err(FlowError::MissingFlowPair {
                            seg_id: segment.seg_id.clone(),
                            events: format!("{low}/{high}"),
                        });
                    }
                }
            }
        }

        for group in &self.groups {
            for name in &group.events {
                if self.event(name).is_none() {
                    return Err(FlowError::UnknownEvent(name.clone()));
                }
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn inputs() -> RaceInputs {
        RaceInputs {
            segments: vec![segment("A1", 0.0, 1.0, 5.0, &["Full", "10K"])],
            events: vec![event("Full", 420.0, 42.2), event("10K", 440.0, 10.0)],
            runners: vec![runner("1", "Full", 5.0, 0.0), runner("2", "10K", 4.0, 0.0)],
            flow_pairs: Vec::new(),
            groups: Vec::new(),
        }
    }

    #[test]
    fn segment_ranges_default_to_nominal_bounds() {
        let mut seg = segment("B1", 2.0, 3.5, 4.0, &["Full", "Half"]);
        seg.event_ranges
            .insert("Half".into(), KmRange::new(12.0, 13.5));
        assert_eq!(seg.range_for("Full"), Some(KmRange::new(2.0, 3.5)));
        assert_eq!(seg.range_for("Half"), Some(KmRange::new(12.0, 13.5)));
        assert_eq!(seg.range_for("10K"), None);
    }

    #[test]
    fn km_range_fraction_round_trips_through_own_axis() {
        let range = KmRange::new(12.0, 13.5);
        assert!((range.at_fraction(0.5) - 12.75).abs() < 1e-12);
        assert!((range.fraction_of(12.75) - 0.5).abs() < 1e-12);
        assert!(range.contains(12.0));
        assert!(!range.contains(13.5));
    }

    #[test]
    fn degenerate_segments_report_reason() {
        assert!(segment("Z", 1.0, 1.0, 5.0, &["Full"])
            .degenerate_reason()
            .unwrap()
            .contains("zero length"));
        assert!(segment("Z", 1.0, 2.0, 0.0, &["Full"])
            .degenerate_reason()
            .unwrap()
            .contains("zero width"));
        assert!(segment("Z", 1.0, 2.0, 3.0, &["Full"])
            .degenerate_reason()
            .is_none());
    }

    #[test]
    fn validate_accepts_minimal_inputs() {
        inputs().validate().unwrap();
    }

    #[test]
    fn missing_flow_pair_names_the_segment() {
        let mut inputs = inputs();
        inputs.segments[0].flow_type = FlowType::Overtake;
        let err = inputs.validate().unwrap_err();
        match err {
            FlowError::MissingFlowPair { seg_id, events } => {
                assert_eq!(seg_id, "A1");
                assert_eq!(events, "10K/Full");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn every_event_pair_on_a_flow_segment_needs_a_declaration() {
        let mut inputs = inputs();
        inputs.events.push(event("Half", 425.0, 21.1));
        inputs.runners.push(runner("3", "Half", 4.5, 0.0));
        inputs.segments[0].applicable_events.insert("Half".into());
        inputs.segments[0].flow_type = FlowType::Overtake;
        inputs.flow_pairs.push(FlowPair {
            seg_id: "A1".into(),
            event_a: "Full".into(),
            event_b: "Half".into(),
        });
        match inputs.validate().unwrap_err() {
            FlowError::MissingFlowPair { seg_id, events } => {
                assert_eq!(seg_id, "A1");
                assert_eq!(events, "10K/Full");
            }
            other => panic!("unexpected error {other:?}"),
        }

        inputs.flow_pairs.push(FlowPair {
            seg_id: "A1".into(),
            event_a: "Full".into(),
            event_b: "10K".into(),
        });
        match inputs.validate().unwrap_err() {
            FlowError::MissingFlowPair { events, .. } => assert_eq!(events, "10K/Half"),
            other => panic!("unexpected error {other:?}"),
        }

        inputs.flow_pairs.push(FlowPair {
            seg_id: "A1".into(),
            event_a: "Half".into(),
            event_b: "10K".into(),
        });
        inputs.validate().unwrap();
    }

    #[test]
    fn flow_pair_must_reference_known_segment_and_events() {
        let mut inputs = inputs();
        inputs.flow_pairs.push(FlowPair {
            seg_id: "Q9".into(),
            event_a: "Full".into(),
            event_b: "10K".into(),
        });
        assert!(matches!(
            inputs.validate(),
            Err(FlowError::UnknownSegment(id)) if id == "Q9"
        ));

        inputs.flow_pairs[0].seg_id = "A1".into();
        inputs.flow_pairs[0].event_b = "Half".into();
        assert!(matches!(
            inputs.validate(),
            Err(FlowError::UnknownEvent(name)) if name == "Half"
        ));
    }

    #[test]
    fn event_without_runners_is_a_missing_input() {
        let mut inputs = inputs();
        inputs.runners.retain(|r| r.event != "10K");
        let err = inputs.validate().unwrap_err();
        assert!(err.to_string().contains("runner table for event 10K"));
    }

    #[test]
    fn segment_past_event_finish_is_rejected() {
        let mut inputs = inputs();
        inputs.segments[0]
            .event_ranges
            .insert("10K".into(), KmRange::new(9.5, 10.5));
        assert!(matches!(inputs.validate(), Err(FlowError::InvalidInput(_))));
    }

    #[test]
    fn default_group_holds_every_event() {
        let groups = inputs().event_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[0].events,
            vec!["Full".to_string(), "10K".to_string()]
        );
    }
}
