//! Interchangeable engines for classifying cross-event runner pairs in a zone.
//!
//! Both strategies return the same hits, sorted by `(a, b)`; they differ only
//! in how much of the pair matrix is materialized at once.

use ndarray::{Array1, Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::config::{Engine, InteractionConfig};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Direct,
    Binned,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Direct => "direct",
            StrategyKind::Binned => "binned",
        }
    }

    pub fn build(self, config: &InteractionConfig) -> Box<dyn ZoneStrategy> {
        match self {
            StrategyKind::Direct => Box::new(DirectStrategy),
            StrategyKind::Binned => Box::new(BinnedStrategy {
                sub_bin_s: config.sub_bin_s,
            }),
        }
    }
}

/// Pick the engine for a zone from its runner counts alone.
pub fn select_strategy(n_a: usize, n_b: usize, config: &InteractionConfig) -> StrategyKind {
    match config.engine {
        Engine::Direct => StrategyKind::Direct,
        Engine::Binned => StrategyKind::Binned,
        Engine::Auto => {
            if (n_a as u64).saturating_mul(n_b as u64) <= config.direct_max_pairs {
                StrategyKind::Direct
            } else {
                StrategyKind::Binned
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PairOutcome {
    /// The A runner passed the B runner inside the zone.
    AOvertakesB,
    BOvertakesA,
    Copresent,
}

/// Classify one pair from `d = t_a - t_b` at zone entry and exit and the
/// length of time both were inside the zone.
pub fn classify(d_entry: f64, d_exit: f64, overlap_s: f64, dwell_s: f64) -> Option<PairOutcome> {
    if d_entry < 0.0 && d_exit >= 0.0 {
        Some(PairOutcome::BOvertakesA)
    } else if d_entry > 0.0 && d_exit <= 0.0 {
        Some(PairOutcome::AOvertakesB)
    } else if overlap_s >= dwell_s {
        Some(PairOutcome::Copresent)
    } else {
        None
    }
}

/// Entry and exit wall-clock times of one side's runners for a zone.
#[derive(Clone, Debug, Default)]
pub struct ZoneTimes {
    /// Row of each runner in its `EventTracks`.
    pub rows: Vec<usize>,
    pub entry: Array1<f64>,
    pub exit: Array1<f64>,
}

impl ZoneTimes {
    /// Keep only runners with finite times at both zone bounds.
    pub fn from_arrivals(entry: Array1<f64>, exit: Array1<f64>) -> Self {
        let rows: Vec<usize> = (0..entry.len())
            .filter(|&i| entry[i].is_finite() && exit[i].is_finite())
            .collect();
        Self {
            entry: Array1::from_iter(rows.iter().map(|&i| entry[i])),
            exit: Array1::from_iter(rows.iter().map(|&i| exit[i])),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One qualifying pair; `a` and `b` index into the `ZoneTimes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PairHit {
    pub a: usize,
    pub b: usize,
    pub outcome: PairOutcome,
}

pub trait ZoneStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn evaluate(&self, a: &ZoneTimes, b: &ZoneTimes, dwell_s: f64) -> Vec<PairHit>;
}

/// Every pair in one broadcast pass over `n_a × n_b` matrices.
pub struct DirectStrategy;

impl ZoneStrategy for DirectStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    fn evaluate(&self, a: &ZoneTimes, b: &ZoneTimes, dwell_s: f64) -> Vec<PairHit> {
        if a.is_empty() || b.is_empty() {
            return Vec::new();
        }
        let entry_a = a.entry.view().insert_axis(Axis(1));
        let exit_a = a.exit.view().insert_axis(Axis(1));
        let d_entry = &entry_a - &b.entry;
        let d_exit = &exit_a - &b.exit;

        let mut overlap = Array2::<f64>::zeros((a.len(), b.len()));
        Zip::from(&mut overlap)
            .and_broadcast(&entry_a)
            .and_broadcast(&exit_a)
            .and_broadcast(&b.entry)
            .and_broadcast(&b.exit)
            .for_each(|o, &ea, &xa, &eb, &xb| *o = xa.min(xb) - ea.max(eb));

        let mut hits = Vec::new();
        Zip::indexed(&d_entry)
            .and(&d_exit)
            .and(&overlap)
            .for_each(|(i, j), &de, &dx, &ov| {
                if let Some(outcome) = classify(de, dx, ov, dwell_s) {
                    hits.push(PairHit {
                        a: i,
                        b: j,
                        outcome,
                    });
                }
            });
        hits.sort();
        hits
    }
}

/// Time sub-bins of `sub_bin_s`; a pair is only examined in the sub-bin that
/// holds the later of the two zone entries.
pub struct BinnedStrategy {
    pub sub_bin_s: f64,
}

impl BinnedStrategy {
    fn membership(&self, times: &ZoneTimes, origin: f64, n_bins: usize) -> Vec<Vec<usize>> {
        let mut bins = vec![Vec::new(); n_bins];
        for i in 0..times.len() {
            let first = self.bin_of(times.entry[i], origin);
            let last = self.bin_of(times.exit[i], origin).min(n_bins - 1);
            for bin in &mut bins[first..=last] {
                bin.push(i);
            }
        }
        bins
    }

    fn bin_of(&self, t: f64, origin: f64) -> usize {
        ((t - origin).max(0.0) / self.sub_bin_s).floor() as usize
    }
}

impl ZoneStrategy for BinnedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Binned
    }

    fn evaluate(&self, a: &ZoneTimes, b: &ZoneTimes, dwell_s: f64) -> Vec<PairHit> {
        if a.is_empty() || b.is_empty() {
            return Vec::new();
        }
        let origin = a
            .entry
            .iter()
            .chain(b.entry.iter())
            .copied()
            .fold(f64::INFINITY, f64::min);
        let end = a
            .exit
            .iter()
            .chain(b.exit.iter())
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let n_bins = self.bin_of(end, origin) + 1;
        let bins_a = self.membership(a, origin, n_bins);
        let bins_b = self.membership(b, origin, n_bins);

        let mut hits = Vec::new();
        for (k, (members_a, members_b)) in bins_a.iter().zip(&bins_b).enumerate() {
            for &i in members_a {
                let (ea, xa) = (a.entry[i], a.exit[i]);
                for &j in members_b {
                    let (eb, xb) = (b.entry[j], b.exit[j]);
                    if self.bin_of(ea.max(eb), origin) != k {
                        continue;
                    }
                    if let Some(outcome) =
                        classify(ea - eb, xa - xb, xa.min(xb) - ea.max(eb), dwell_s)
                    {
                        hits.push(PairHit {
                            a: i,
                            b: j,
                            outcome,
                        });
                    }
                }
            }
        }
        hits.sort();
        hits
    }
}
