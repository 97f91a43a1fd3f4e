//! Input tables: segment CSV, runner CSVs and the race configuration JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use csv::StringRecord;
use serde::Deserialize;

use crate::course::{FlowType, KmRange, Pace, PaceSplit, RaceConfig, Runner, Segment};
use crate::FlowError;

/// Read a required input file; a missing file names `what` and the path.
pub fn read_input(path: &Path, what: &str) -> Result<Vec<u8>, FlowError> {
    fs::read(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => FlowError::MissingInput(format!("{what} {}", path.display())),
        _ => FlowError::Io(err),
    })
}

pub fn parse_race_config(data: &[u8]) -> Result<RaceConfig, FlowError> {
    Ok(serde_json::from_slice(data)?)
}

struct Columns {
    headers: Vec<String>,
}

impl Columns {
    fn new(record: &StringRecord) -> Self {
        Self {
            headers: record
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect(),
        }
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    fn require(&self, name: &str) -> Result<usize, FlowError> {
        self.find(name).ok_or_else(|| {
            FlowError::InvalidInput(format!("segments table has no '{name}' column"))
        })
    }
}

fn field<'r>(record: &'r StringRecord, idx: usize) -> &'r str {
    record.get(idx).map(str::trim).unwrap_or("")
}

fn number(record: &StringRecord, idx: usize, seg_id: &str, column: &str) -> Result<f64, FlowError> {
    field(record, idx).parse::<f64>().map_err(|_| {
        FlowError::InvalidInput(format!(
            "segment {seg_id}: '{}' is not a number in column {column}",
            field(record, idx)
        ))
    })
}

/// Parse `seg_id,seg_label,start_km,end_km,width_m,events,flow_type` plus
/// optional `<event>_from_km` / `<event>_to_km` columns.
pub fn parse_segments(data: &[u8]) -> Result<Vec<Segment>, FlowError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(data);
    let columns = Columns::new(reader.headers()?);
    let seg_id = columns.require("seg_id")?;
    let label = columns.find("seg_label").or_else(|| columns.find("label"));
    let start_km = columns.require("start_km")?;
    let end_km = columns.require("end_km")?;
    let width_m = columns.require("width_m")?;
    let events = columns.require("events")?;
    let flow_type = columns.find("flow_type");

    let mut segments = Vec::new();
    for record in reader.records() {
        let record = record?;
        let id = field(&record, seg_id).to_string();
        if id.is_empty() {
            continue;
        }
        let applicable_events: BTreeSet<String> = field(&record, events)
            .split(';')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();

        let mut event_ranges = BTreeMap::new();
        for event in &applicable_events {
            let key = event.to_ascii_lowercase();
            let from_col = format!("{key}_from_km");
            let to_col = format!("{key}_to_km");
            let (Some(from_idx), Some(to_idx)) = (columns.find(&from_col), columns.find(&to_col))
            else {
                continue;
            };
            if field(&record, from_idx).is_empty() && field(&record, to_idx).is_empty() {
                continue;
            }
            event_ranges.insert(
                event.clone(),
                KmRange::new(
                    number(&record, from_idx, &id, &from_col)?,
                    number(&record, to_idx, &id, &to_col)?,
                ),
            );
        }

        let flow = match flow_type {
            Some(idx) => FlowType::parse(field(&record, idx)).ok_or_else(|| {
                FlowError::InvalidInput(format!(
                    "segment {id}: unknown flow_type '{}'",
                    field(&record, idx)
                ))
            })?,
            None => FlowType::None,
        };

        segments.push(Segment {
            label: label
                .map(|idx| field(&record, idx).to_string())
                .unwrap_or_default(),
            start_km: number(&record, start_km, &id, "start_km")?,
            end_km: number(&record, end_km, &id, "end_km")?,
            width_m: number(&record, width_m, &id, "width_m")?,
            applicable_events,
            event_ranges,
            flow_type: flow,
            seg_id: id,
        });
    }
    Ok(segments)
}

#[derive(Debug, Deserialize)]
struct RunnerRow {
    event: String,
    runner_id: String,
    #[serde(default)]
    pace: String,
    #[serde(default)]
    start_offset: Option<f64>,
    #[serde(default)]
    splits: Option<String>,
}

/// `km:pace;km:pace`. Unreadable entries become NaN paces so the runner is
/// rejected with a data-quality warning instead of failing the table.
fn parse_splits(text: &str) -> Vec<PaceSplit> {
    text.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(2, ':');
            let until_km = parts
                .next()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(f64::NAN);
            let pace_min_per_km = parts
                .next()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(f64::NAN);
            PaceSplit {
                until_km,
                pace_min_per_km,
            }
        })
        .collect()
}

/// Parse `event,runner_id,pace,start_offset[,splits]`.
pub fn parse_runners(data: &[u8]) -> Result<Vec<Runner>, FlowError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(data);
    let mut runners = Vec::new();
    for row in reader.deserialize::<RunnerRow>() {
        let row = row?;
        let splits = row.splits.as_deref().map(str::trim).unwrap_or("");
        let pace = if splits.is_empty() {
            Pace::Constant(row.pace.trim().parse().unwrap_or(f64::NAN))
        } else {
            Pace::Splits(parse_splits(splits))
        };
        runners.push(Runner {
            runner_id: row.runner_id,
            event: row.event,
            pace,
            start_offset_s: row.start_offset.unwrap_or(0.0),
        });
    }
    Ok(runners)
}
