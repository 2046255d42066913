//!
//! Pore model: per-k-mer emission parameters plus per-read scaling.
//!
//! The emission table is immutable after load. Scaling is held next to
//! the table and applied inline by `emission_log_prob`, which keeps
//! re-scaling free for the trainer (it swaps parameter vectors every
//! round).
//!
use crate::error::{Error, Result};
use crate::events::Event;
use crate::kmer::KmerSpace;
use crate::prob::{log_inv_gaussian_pdf, log_normal_pdf, Prob, MIN_STDV};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;

/// Models keyed by name; BTreeMap so candidate iteration is the sorted
/// name order and basecall tie-breaking stays deterministic.
pub type ModelDict = BTreeMap<String, PoreModel>;

pub const STRAND_TEMPLATE: u8 = 0;
pub const STRAND_COMPLEMENT: u8 = 1;
pub const STRAND_EITHER: u8 = 2;

///
/// Emission parameters of one k-mer state.
///
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EmissionRow {
    pub level_mean: f64,
    pub level_stdv: f64,
    pub sd_mean: f64,
    pub sd_stdv: f64,
}

///
/// The six per-read scaling parameters. `drift` is applied to events,
/// never to the table; everything else scales the table inline.
///
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub shift: f64,
    pub scale: f64,
    pub drift: f64,
    pub var: f64,
    pub scale_sd: f64,
    pub var_sd: f64,
}

impl Default for ModelParams {
    fn default() -> ModelParams {
        ModelParams {
            shift: 0.0,
            scale: 1.0,
            drift: 0.0,
            var: 1.0,
            scale_sd: 1.0,
            var_sd: 1.0,
        }
    }
}

impl ModelParams {
    pub fn is_finite(&self) -> bool {
        self.shift.is_finite()
            && self.scale.is_finite()
            && self.drift.is_finite()
            && self.var.is_finite()
            && self.scale_sd.is_finite()
            && self.var_sd.is_finite()
    }
}

impl std::fmt::Display for ModelParams {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "[shift={:.4} scale={:.4} drift={:.6} var={:.4} scale_sd={:.4} var_sd={:.4}]",
            self.shift, self.scale, self.drift, self.var, self.scale_sd, self.var_sd
        )
    }
}

///
/// Gaussian (+ optional inverse-Gaussian) emission table over k-mers.
///
#[derive(Debug, Clone)]
pub struct PoreModel {
    space: KmerSpace,
    rows: Vec<EmissionRow>,
    strand: u8,
    params: ModelParams,
    with_sd: bool,
}

impl PoreModel {
    ///
    /// Build from (kmer, row) pairs. Every k-mer of the deduced k must
    /// appear exactly once.
    ///
    pub fn from_rows(rows: &[(String, EmissionRow)]) -> Result<PoreModel> {
        let first = rows
            .first()
            .ok_or_else(|| Error::config("empty pore model"))?;
        let space = KmerSpace::new(first.0.len())?;
        let n = space.n_states();
        let mut table = vec![EmissionRow::default(); n];
        let mut seen = vec![false; n];
        for (kmer, row) in rows {
            let s = space
                .index_of(kmer.as_bytes())
                .ok_or_else(|| Error::config(format!("bad kmer in pore model: {}", kmer)))?;
            if seen[s] {
                return Err(Error::config(format!("duplicate kmer in pore model: {}", kmer)));
            }
            seen[s] = true;
            table[s] = *row;
        }
        if let Some(s) = seen.iter().position(|&x| !x) {
            return Err(Error::config(format!(
                "pore model is missing kmer {}",
                space.to_string(s)
            )));
        }
        let with_sd = table.iter().all(|r| r.sd_mean > 0.0 && r.sd_stdv > 0.0);
        Ok(PoreModel {
            space,
            rows: table,
            strand: STRAND_EITHER,
            params: ModelParams::default(),
            with_sd,
        })
    }

    ///
    /// Parse the text form: an optional header line, then whitespace
    /// separated rows `kmer level_mean level_stdv sd_mean sd_stdv`.
    ///
    pub fn load<R: BufRead>(reader: R, path: &Path) -> Result<PoreModel> {
        let mut rows = Vec::new();
        let mut seen_header = false;
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            match Self::parse_row(&fields) {
                Some(row) => rows.push(row),
                None => {
                    // one header line allowed, before any data row
                    if rows.is_empty() && !seen_header {
                        seen_header = true;
                        continue;
                    }
                    return Err(Error::parse(path, lineno + 1, "bad pore model row"));
                }
            }
        }
        PoreModel::from_rows(&rows)
    }

    fn parse_row(fields: &[&str]) -> Option<(String, EmissionRow)> {
        if fields.len() < 5 {
            return None;
        }
        let row = EmissionRow {
            level_mean: fields[1].parse().ok()?,
            level_stdv: fields[2].parse().ok()?,
            sd_mean: fields[3].parse().ok()?,
            sd_stdv: fields[4].parse().ok()?,
        };
        Some((fields[0].to_string(), row))
    }

    pub fn space(&self) -> KmerSpace {
        self.space
    }
    pub fn k(&self) -> usize {
        self.space.k()
    }
    pub fn n_states(&self) -> usize {
        self.space.n_states()
    }
    pub fn row(&self, s: usize) -> &EmissionRow {
        &self.rows[s]
    }
    pub fn strand(&self) -> u8 {
        self.strand
    }
    pub fn set_strand(&mut self, strand: u8) {
        self.strand = strand;
    }
    pub fn applies_to(&self, st: usize) -> bool {
        self.strand as usize == st || self.strand == STRAND_EITHER
    }
    ///
    /// Whether the stdv emission branch is active for this model.
    ///
    pub fn with_sd(&self) -> bool {
        self.with_sd
    }
    pub fn set_with_sd(&mut self, with_sd: bool) {
        self.with_sd = with_sd && self.rows.iter().all(|r| r.sd_mean > 0.0 && r.sd_stdv > 0.0);
    }
    ///
    /// Install the scaling used by subsequent emission queries.
    ///
    pub fn scale(&mut self, params: ModelParams) {
        self.params = params;
    }
    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    ///
    /// Unscaled mean of the state levels; sanity-check statistic.
    ///
    pub fn mean(&self) -> f64 {
        self.rows.iter().map(|r| r.level_mean).sum::<f64>() / self.rows.len() as f64
    }
    ///
    /// Unscaled standard deviation of the state levels.
    ///
    pub fn stdv(&self) -> f64 {
        let mean = self.mean();
        let ss = self
            .rows
            .iter()
            .map(|r| {
                let d = r.level_mean - mean;
                d * d
            })
            .sum::<f64>();
        (ss / (self.rows.len() - 1) as f64).sqrt()
    }
    ///
    /// Mean of the scaled levels, for the means-apart check.
    ///
    pub fn scaled_mean(&self) -> f64 {
        self.mean() * self.params.scale + self.params.shift
    }

    ///
    /// Emission log-density of `ev` under state `s` with the installed
    /// scaling. Events are expected to be drift-corrected already.
    ///
    pub fn emission_log_prob(&self, s: usize, ev: &Event) -> Prob {
        self.emission_log_prob_with(&self.params, s, ev)
    }

    ///
    /// Same, with an explicit parameter vector; the trainer swaps
    /// vectors every round without touching the table.
    ///
    pub fn emission_log_prob_with(&self, params: &ModelParams, s: usize, ev: &Event) -> Prob {
        let row = &self.rows[s];
        let sigma = row.level_stdv * params.var;
        if !(sigma > MIN_STDV) {
            return Prob::zero();
        }
        let mut ll = log_normal_pdf(ev.mean, row.level_mean * params.scale + params.shift, sigma);
        if self.with_sd {
            let mu_sd = row.sd_mean * params.scale_sd;
            let sigma_sd = row.sd_stdv * params.var_sd;
            if !(mu_sd > 0.0) || !(sigma_sd > 0.0) {
                return Prob::zero();
            }
            let lambda = mu_sd * mu_sd * mu_sd / (sigma_sd * sigma_sd);
            ll += log_inv_gaussian_pdf(ev.stdv, mu_sd, lambda);
        }
        Prob::from_log_prob(ll)
    }
}
