//! Engine tunables. Loaded once, validated, then passed by reference into
//! every stage of a run.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::FlowError;

/// Level of Service, ordered from free flow (`A`) to severe congestion (`F`).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LosClass {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl LosClass {
    pub const ALL: [LosClass; 6] = [
        LosClass::A,
        LosClass::B,
        LosClass::C,
        LosClass::D,
        LosClass::E,
        LosClass::F,
    ];

    /// Ordinal position, 0 for `A` up to 5 for `F`.
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LosClass::A => "A",
            LosClass::B => "B",
            LosClass::C => "C",
            LosClass::D => "D",
            LosClass::E => "E",
            LosClass::F => "F",
        }
    }
}

impl std::fmt::Display for LosClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct LosThreshold {
    pub class: LosClass,
    /// Lowest areal density (persons per m²) that still maps to `class`.
    pub min_density: f64,
}

/// Density → LOS lookup table, taken from the event rulebook.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LosTable {
    pub thresholds: Vec<LosThreshold>,
}

impl Default for LosTable {
    fn default() -> Self {
        let bounds = [0.0, 0.36, 0.54, 0.72, 1.08, 1.63];
        Self {
            thresholds: LosClass::ALL
                .iter()
                .zip(bounds)
                .map(|(&class, min_density)| LosThreshold { class, min_density })
                .collect(),
        }
    }
}

impl LosTable {
    pub fn classify(&self, density: f64) -> LosClass {
        self.thresholds
            .iter()
            .take_while(|t| density >= t.min_density)
            .last()
            .map(|t| t.class)
            .unwrap_or(LosClass::A)
    }

    fn validate(&self) -> Result<(), FlowError> {
        if self.thresholds.is_empty() {
            return Err(FlowError::InvalidConfig("LOS table is empty".into()));
        }
        for pair in self.thresholds.windows(2) {
            if pair[1].min_density < pair[0].min_density || pair[1].class <= pair[0].class {
                return Err(FlowError::InvalidConfig(format!(
                    "LOS thresholds must ascend: {} at {} follows {} at {}",
                    pair[1].class, pair[1].min_density, pair[0].class, pair[0].min_density
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BinningConfig {
    pub bin_km: f64,
    pub window_s: f64,
}

impl Default for BinningConfig {
    fn default() -> Self {
        Self {
            bin_km: 0.1,
            window_s: 60.0,
        }
    }
}

/// How the binner trades resolution for time when a run would overrun.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoarseningPolicy {
    /// Wall-clock limit for one binning attempt.
    pub time_budget_s: f64,
    /// Upper bound on `windows × runner-segment memberships` before an
    /// attempt is even started.
    pub max_work_units: u64,
    pub max_steps: usize,
    pub window_factor: f64,
    pub bin_factor: f64,
    pub max_window_s: f64,
    pub max_bin_km: f64,
}

impl Default for CoarseningPolicy {
    fn default() -> Self {
        Self {
            time_budget_s: 180.0,
            max_work_units: 400_000_000,
            max_steps: 4,
            window_factor: 2.0,
            bin_factor: 2.0,
            max_window_s: 600.0,
            max_bin_km: 0.5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ZoneConfig {
    pub target_zone_m: f64,
    pub min_zone_m: f64,
    pub max_zone_m: f64,
    /// Runner-pair crossings closer than this collapse into one convergence point.
    pub cp_merge_m: f64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            target_zone_m: 125.0,
            min_zone_m: 50.0,
            max_zone_m: 250.0,
            cp_merge_m: 10.0,
        }
    }
}

/// Zone-metrics execution engine.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Auto,
    Direct,
    Binned,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::Auto
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InteractionConfig {
    /// Minimum shared time inside a zone for two runners to count as co-present.
    pub dwell_s: f64,
    pub engine: Engine,
    /// Largest `runners_a × runners_b` product evaluated with the direct engine.
    pub direct_max_pairs: u64,
    pub sub_bin_s: f64,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            dwell_s: 5.0,
            engine: Engine::Auto,
            direct_max_pairs: 250_000,
            sub_bin_s: 60.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub tolerance: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { tolerance: 0.02 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoreWeights {
    pub los: f64,
    pub density: f64,
    pub flow: f64,
    /// Density (p/m²) that saturates the density term.
    pub ref_density: f64,
    /// Flow rate (p/m/min) that saturates the flow term.
    pub ref_flow_rate: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            los: 1.0,
            density: 1.0,
            flow: 1.0,
            ref_density: 1.63,
            ref_flow_rate: 82.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub binning: BinningConfig,
    pub coarsening: CoarseningPolicy,
    pub los: LosTable,
    pub zones: ZoneConfig,
    pub interactions: InteractionConfig,
    pub reconciliation: ReconcileConfig,
    pub score: ScoreWeights,
}

impl EngineConfig {
    pub fn from_json(input: &[u8]) -> Result<Self, FlowError> {
        let config: EngineConfig = serde_json::from_slice(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, FlowError> {
        let data = fs::read(path)
            .map_err(|_| FlowError::MissingInput(format!("engine config {}", path.display())))?;
        Self::from_json(&data)
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        positive("binning.bin_km", self.binning.bin_km)?;
        positive("binning.window_s", self.binning.window_s)?;
        positive("coarsening.time_budget_s", self.coarsening.time_budget_s)?;
        if self.coarsening.window_factor < 1.0 || self.coarsening.bin_factor < 1.0 {
            return Err(FlowError::InvalidConfig(
                "coarsening factors must be >= 1".into(),
            ));
        }
        if self.coarsening.max_window_s < self.binning.window_s
            || self.coarsening.max_bin_km < self.binning.bin_km
        {
            return Err(FlowError::InvalidConfig(
                "coarsening caps must not be finer than the base resolution".into(),
            ));
        }
        self.los.validate()?;
        positive("zones.target_zone_m", self.zones.target_zone_m)?;
        non_negative("zones.min_zone_m", self.zones.min_zone_m)?;
        non_negative("zones.cp_merge_m", self.zones.cp_merge_m)?;
        if self.zones.min_zone_m > self.zones.target_zone_m
            || self.zones.target_zone_m > self.zones.max_zone_m
        {
            return Err(FlowError::InvalidConfig(format!(
                "zone lengths must satisfy min <= target <= max (got {} / {} / {})",
                self.zones.min_zone_m, self.zones.target_zone_m, self.zones.max_zone_m
            )));
        }
        non_negative("interactions.dwell_s", self.interactions.dwell_s)?;
        positive("interactions.sub_bin_s", self.interactions.sub_bin_s)?;
        non_negative("reconciliation.tolerance", self.reconciliation.tolerance)?;
        let weights = [self.score.los, self.score.density, self.score.flow];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.iter().sum::<f64>() <= 0.0
        {
            return Err(FlowError::InvalidConfig(
                "score weights must be non-negative with a positive sum".into(),
            ));
        }
        positive("score.ref_density", self.score.ref_density)?;
        positive("score.ref_flow_rate", self.score.ref_flow_rate)?;
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<(), FlowError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(FlowError::InvalidConfig(format!(
            "{name} must be > 0 (got {value})"
        )))
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), FlowError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(FlowError::InvalidConfig(format!(
            "{name} must be >= 0 (got {value})"
        )))
    }
}
