//! Pace-based position interpolation.
//!
//! Every runner's progress is a monotone piecewise-linear map from course
//! distance to wall-clock time. Constant-pace runners additionally live in
//! column arrays so a whole event can be positioned with a few array ops.

use ndarray::Array1;
use tracing::warn;

use crate::course::{Event, KmRange, Pace, Runner};
use crate::DataQualityWarning;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Position {
    NotStarted,
    OnCourse(f64),
    Finished,
}

impl Position {
    pub fn km(self) -> Option<f64> {
        match self {
            Position::OnCourse(km) => Some(km),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunnerTrack {
    pub runner_id: String,
    /// Seconds after the run epoch at which the runner crosses the start.
    pub start_s: f64,
    pub distance_km: f64,
    /// `(km, seconds after start)` knots; strictly increasing in both.
    knots: Vec<(f64, f64)>,
}

impl RunnerTrack {
    pub fn new(runner: &Runner, event: &Event) -> Result<Self, String> {
        if !runner.start_offset_s.is_finite() {
            return Err(format!(
                "start offset {} is not finite",
                runner.start_offset_s
            ));
        }
        let distance_km = event.distance_km;
        let mut knots = vec![(0.0, 0.0)];
        match &runner.pace {
            Pace::Constant(pace) => {
                check_pace(*pace)?;
                knots.push((distance_km, distance_km * pace * 60.0));
            }
            Pace::Splits(splits) => {
                if splits.is_empty() {
                    return Err("pace curve has no splits".into());
                }
                let mut last_pace = 0.0;
                for split in splits {
                    check_pace(split.pace_min_per_km)?;
                    let (prev_km, prev_s) = knots[knots.len() - 1];
                    if !(split.until_km > prev_km) {
                        return Err(format!(
                            "split boundary {} km does not advance past {} km",
                            split.until_km, prev_km
                        ));
                    }
                    let until = split.until_km.min(distance_km);
                    knots.push((
                        until,
                        prev_s + (until - prev_km) * split.pace_min_per_km * 60.0,
                    ));
                    last_pace = split.pace_min_per_km;
                    if until >= distance_km {
                        break;
                    }
                }
                let (prev_km, prev_s) = knots[knots.len() - 1];
                if prev_km < distance_km {
                    knots.push((
                        distance_km,
                        prev_s + (distance_km - prev_km) * last_pace * 60.0,
                    ));
                }
            }
        }
        Ok(Self {
            runner_id: runner.runner_id.clone(),
            start_s: event.start_s() + runner.start_offset_s,
            distance_km,
            knots,
        })
    }

    /// Pace in seconds per km when the runner holds one pace throughout.
    pub fn constant_pace_s(&self) -> Option<f64> {
        if self.knots.len() == 2 {
            let (km, s) = self.knots[1];
            Some(s / km)
        } else {
            None
        }
    }

    pub fn finish_s(&self) -> f64 {
        self.start_s + self.knots[self.knots.len() - 1].1
    }

    /// Wall-clock time at which the runner reaches `km`, if on the course.
    pub fn time_at_km(&self, km: f64) -> Option<f64> {
        if !(0.0..=self.distance_km).contains(&km) {
            return None;
        }
        if let Some(pace) = self.constant_pace_s() {
            return Some(self.start_s + pace * km);
        }
        let idx = self.knots.partition_point(|&(k, _)| k < km);
        if idx == 0 {
            return Some(self.start_s);
        }
        let (k0, s0) = self.knots[idx - 1];
        let (k1, s1) = self.knots[idx];
        Some(self.start_s + s0 + (km - k0) / (k1 - k0) * (s1 - s0))
    }

    pub fn position_at(&self, t: f64) -> Position {
        let elapsed = t - self.start_s;
        if elapsed < 0.0 {
            return Position::NotStarted;
        }
        // same arithmetic as the column path in `EventTracks::positions_at`
        if let Some(pace) = self.constant_pace_s() {
            let km = elapsed / pace;
            return if km > self.distance_km {
                Position::Finished
            } else {
                Position::OnCourse(km)
            };
        }
        let total = self.knots[self.knots.len() - 1].1;
        if elapsed > total {
            return Position::Finished;
        }
        let idx = self.knots.partition_point(|&(_, s)| s < elapsed);
        if idx == 0 {
            return Position::OnCourse(0.0);
        }
        let (k0, s0) = self.knots[idx - 1];
        let (k1, s1) = self.knots[idx];
        Position::OnCourse(k0 + (elapsed - s0) / (s1 - s0) * (k1 - k0))
    }

    /// Ground speed in m/s while covering `km`.
    pub fn speed_at_km(&self, km: f64) -> f64 {
        let idx = self
            .knots
            .partition_point(|&(k, _)| k < km)
            .clamp(1, self.knots.len() - 1);
        let (k0, s0) = self.knots[idx - 1];
        let (k1, s1) = self.knots[idx];
        (k1 - k0) * 1000.0 / (s1 - s0)
    }

    /// Arrival curve across `range`, as `(fraction of range, wall-clock s)`
    /// knots covering fractions 0 through 1.
    pub fn arrivals_across(&self, range: KmRange) -> Option<Vec<(f64, f64)>> {
        let entry = self.time_at_km(range.from_km)?;
        let exit = self.time_at_km(range.to_km)?;
        let mut out = vec![(0.0, entry)];
        for &(km, s) in &self.knots {
            if km > range.from_km && km < range.to_km {
                out.push((range.fraction_of(km), self.start_s + s));
            }
        }
        out.push((1.0, exit));
        Some(out)
    }
}

fn check_pace(pace_min_per_km: f64) -> Result<(), String> {
    if pace_min_per_km.is_finite() && pace_min_per_km > 0.0 {
        Ok(())
    } else {
        Err(format!("pace {pace_min_per_km} min/km is not usable"))
    }
}

/// All usable runners of one event, row-aligned with column arrays.
#[derive(Clone, Debug)]
pub struct EventTracks {
    pub event: String,
    pub distance_km: f64,
    pub tracks: Vec<RunnerTrack>,
    start_s: Array1<f64>,
    /// NaN for runners following a split curve.
    pace_s_per_km: Array1<f64>,
    curve_rows: Vec<usize>,
}

impl EventTracks {
    /// Build tracks for `event`, skipping runners whose pace cannot be used.
    pub fn build<'a, I>(event: &Event, runners: I) -> (Self, Vec<DataQualityWarning>)
    where
        I: IntoIterator<Item = &'a Runner>,
    {
        let mut tracks = Vec::new();
        let mut warnings = Vec::new();
        for runner in runners {
            match RunnerTrack::new(runner, event) {
                Ok(track) => tracks.push(track),
                Err(detail) => {
                    warn!(
                        "Skipping runner {} ({}): {}",
                        runner.runner_id, event.name, detail
                    );
                    warnings.push(DataQualityWarning::InvalidPace {
                        event: event.name.clone(),
                        runner_id: runner.runner_id.clone(),
                        detail,
                    });
                }
            }
        }
        if let Some(declared) = event.runner_count {
            if declared != tracks.len() {
                warn!(
                    "Event {} declares {} runners, {} usable",
                    event.name,
                    declared,
                    tracks.len()
                );
                warnings.push(DataQualityWarning::RunnerCountMismatch {
                    event: event.name.clone(),
                    declared,
                    loaded: tracks.len(),
                });
            }
        }
        (
            Self::from_tracks(&event.name, event.distance_km, tracks),
            warnings,
        )
    }

    pub fn from_tracks(event: &str, distance_km: f64, tracks: Vec<RunnerTrack>) -> Self {
        let start_s = Array1::from_iter(tracks.iter().map(|t| t.start_s));
        let pace_s_per_km = Array1::from_iter(
            tracks
                .iter()
                .map(|t| t.constant_pace_s().unwrap_or(f64::NAN)),
        );
        let curve_rows = tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.constant_pace_s().is_none())
            .map(|(i, _)| i)
            .collect();
        Self {
            event: event.to_string(),
            distance_km,
            tracks,
            start_s,
            pace_s_per_km,
            curve_rows,
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Course position of every runner at `t`; NaN when not on the course.
    pub fn positions_at(&self, t: f64) -> Array1<f64> {
        let distance = self.distance_km;
        let mut pos = (t - &self.start_s) / &self.pace_s_per_km;
        pos.mapv_inplace(|p| {
            if p.is_finite() && (0.0..=distance).contains(&p) {
                p
            } else {
                f64::NAN
            }
        });
        for &row in &self.curve_rows {
            pos[row] = self.tracks[row].position_at(t).km().unwrap_or(f64::NAN);
        }
        pos
    }

    /// Positions plus ground speeds (m/s) at `t`; speed is NaN off course.
    pub fn positions_and_speeds_at(&self, t: f64) -> (Array1<f64>, Array1<f64>) {
        let pos = self.positions_at(t);
        let mut speed = self.pace_s_per_km.mapv(|p| 1000.0 / p);
        for &row in &self.curve_rows {
            let km = pos[row];
            speed[row] = if km.is_nan() {
                f64::NAN
            } else {
                self.tracks[row].speed_at_km(km)
            };
        }
        speed.zip_mut_with(&pos, |s, p| {
            if p.is_nan() {
                *s = f64::NAN;
            }
        });
        (pos, speed)
    }

    /// Arrival time of every runner at `km`; NaN when `km` is off the course.
    pub fn arrival_times(&self, km: f64) -> Array1<f64> {
        if !(0.0..=self.distance_km).contains(&km) {
            return Array1::from_elem(self.len(), f64::NAN);
        }
        let mut times = &self.start_s + &(&self.pace_s_per_km * km);
        for &row in &self.curve_rows {
            times[row] = self.tracks[row].time_at_km(km).unwrap_or(f64::NAN);
        }
        times
    }

    /// First arrival at the start of `range` and last arrival at its end.
    pub fn active_span(&self, range: KmRange) -> Option<(f64, f64)> {
        if self.is_empty() {
            return None;
        }
        let first = self
            .arrival_times(range.from_km)
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let last = self
            .arrival_times(range.to_km)
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        if first.is_finite() && last.is_finite() {
            Some((first, last))
        } else {
            None
        }
    }

    /// Earliest start and latest finish across the event.
    pub fn time_span(&self) -> Option<(f64, f64)> {
        if self.is_empty() {
            return None;
        }
        let start = self.start_s.iter().copied().fold(f64::INFINITY, f64::min);
        let finish = self
            .tracks
            .iter()
            .map(RunnerTrack::finish_s)
            .fold(f64::NEG_INFINITY, f64::max);
        Some((start, finish))
    }
}
