//! Core race-course density and cross-event flow analytics implemented in Rust.
//!
//! The pipeline turns per-runner pace tables into time/distance occupancy bins
//! with Level-of-Service labels, finds where runners of two events meet inside
//! shared segments, and measures overtaking and co-presence zone by zone.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config;
pub mod convergence;
pub mod course;
pub mod density;
pub mod engine;
pub mod interp;
pub mod io;
pub mod metrics;
pub mod reconcile;
pub mod score;
pub mod strategy;
pub mod zones;

pub use config::{
    BinningConfig, CoarseningPolicy, Engine, EngineConfig, InteractionConfig, LosClass, LosTable,
    ReconcileConfig, ScoreWeights, ZoneConfig,
};
pub use convergence::ConvergencePoint;
pub use course::{
    Event, EventGroup, FlowPair, FlowType, KmRange, Pace, PaceSplit, RaceConfig, RaceInputs,
    Runner, Segment,
};
pub use density::{DensityBin, Resolution, SegmentDensitySummary, SkippedSegment};
pub use engine::{analyze, run_id, AnalysisRun, CancelToken, FlowSummary, RunManifest, SchemaIds};
pub use interp::{EventTracks, Position, RunnerTrack};
pub use metrics::{Role, RunnerParticipation, Side, ZoneMetrics, ZoneReport};
pub use reconcile::ReconciliationReport;
pub use score::GroupScore;
pub use strategy::StrategyKind;
pub use zones::{BoundaryKind, FlowZone};

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("missing required input: {0}")]
    MissingInput(String),
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("unknown segment '{0}'")]
    UnknownSegment(String),
    #[error("segment {seg_id} shares events {events} but declares no flow pair")]
    MissingFlowPair { seg_id: String, events: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("time budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("analysis run cancelled")]
    Cancelled,
    #[error("failed to parse CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Problems with individual input rows. The offending entity is skipped and
/// the run carries on; every warning is kept in the run metadata.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataQualityWarning {
    InvalidPace {
        event: String,
        runner_id: String,
        detail: String,
    },
    DegenerateSegment {
        seg_id: String,
        reason: String,
    },
    RunnerCountMismatch {
        event: String,
        declared: usize,
        loaded: usize,
    },
}

impl std::fmt::Display for DataQualityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataQualityWarning::InvalidPace {
                event,
                runner_id,
                detail,
            } => write!(f, "runner {runner_id} ({event}) skipped: {detail}"),
            DataQualityWarning::DegenerateSegment { seg_id, reason } => {
                write!(f, "segment {seg_id} skipped: {reason}")
            }
            DataQualityWarning::RunnerCountMismatch {
                event,
                declared,
                loaded,
            } => write!(
                f,
                "event {event} declares {declared} runners but {loaded} were usable"
            ),
        }
    }
}

/// Round a kilometre value to whole metres.
pub(crate) fn round_km(km: f64) -> f64 {
    (km * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_km_snaps_to_metres() {
        assert_eq!(round_km(1.33049), 1.330);
        assert_eq!(round_km(1.3306), 1.331);
        assert_eq!(round_km(-0.0004), 0.0);
    }

    #[test]
    fn warnings_render_their_subject() {
        let warning = DataQualityWarning::DegenerateSegment {
            seg_id: "B2".into(),
            reason: "zero width".into(),
        };
        assert_eq!(warning.to_string(), "segment B2 skipped: zero width");
    }
}
