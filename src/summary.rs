//!
//! Per-read summary: metadata, parameter tables and the event-buffer
//! lifecycle.
//!
//! Events are loaded lazily (the summary is built from one pass over
//! the table, then the buffers are dropped), reloaded by the worker
//! that owns the read, and dropped again when the read is done.
//!
use crate::error::Result;
use crate::event_table;
use crate::events::EventSequence;
use crate::model::{ModelDict, ModelParams};
use fnv::FnvHashMap;
use itertools::Itertools;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct ReadSummary {
    pub path: PathBuf,
    pub read_id: String,
    pub base_file_name: String,
    pub have_ed_events: bool,
    pub strand_bounds: [[usize; 2]; 2],
    /// model chosen for each strand, once one has been selected
    pub preferred_model: [Option<String>; 2],
    /// scaling per model name; index 2 keys joint `m0+m1` pairs
    pub params: [FnvHashMap<String, ModelParams>; 3],
    pub events: [EventSequence; 2],
    /// first worker-local failure, carried to the stats output
    pub error: Option<String>,
}

impl ReadSummary {
    ///
    /// Summarise one event table: metadata only, event buffers dropped.
    /// Parameter tables are seeded with identity scaling for every
    /// applicable model.
    ///
    pub fn open(path: &Path, models: &ModelDict, scale_strands_together: bool) -> Result<ReadSummary> {
        let record = event_table::load(path)?;
        let mut summary = ReadSummary {
            path: path.to_path_buf(),
            read_id: record.read_id,
            base_file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            have_ed_events: record.have_ed_events,
            strand_bounds: record.strand_bounds,
            ..ReadSummary::default()
        };
        for st in 0..2 {
            for name in models.iter().filter(|(_, m)| m.applies_to(st)).map(|(n, _)| n) {
                summary.params[st].insert(name.clone(), ModelParams::default());
            }
        }
        if scale_strands_together {
            let m0: Vec<&String> = models
                .iter()
                .filter(|(_, m)| m.applies_to(0))
                .map(|(n, _)| n)
                .collect();
            let m1: Vec<&String> = models
                .iter()
                .filter(|(_, m)| m.applies_to(1))
                .map(|(n, _)| n)
                .collect();
            for (a, b) in m0.iter().cartesian_product(m1.iter()) {
                summary.params[2].insert(joint_name(a, b), ModelParams::default());
            }
        }
        Ok(summary)
    }

    ///
    /// Number of events on a strand, from the bounds (valid with the
    /// buffers dropped).
    ///
    pub fn n_events(&self, st: usize) -> usize {
        self.strand_bounds[st][1] - self.strand_bounds[st][0]
    }

    ///
    /// Re-read the event buffers from the table.
    ///
    pub fn load_events(&mut self) -> Result<()> {
        let mut record = event_table::load(&self.path)?;
        for st in 0..2 {
            self.events[st] = EventSequence::new(std::mem::take(&mut record.events[st]));
        }
        Ok(())
    }

    ///
    /// Release the event buffers; the summary stays reusable.
    ///
    pub fn drop_events(&mut self) {
        for st in 0..2 {
            self.events[st].clear();
        }
    }

    ///
    /// One stats line: metadata, then per strand the event count, the
    /// chosen model and its final scaling.
    ///
    pub fn write_tsv<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        write!(w, "{}\t{}", self.read_id, self.base_file_name)?;
        for st in 0..2 {
            let name = self.preferred_model[st].as_deref().unwrap_or("*");
            let params = self.preferred_model[st]
                .as_ref()
                .and_then(|n| self.params[st].get(n))
                .copied()
                .unwrap_or_default();
            write!(
                w,
                "\t{}\t{}\t{:.4}\t{:.4}\t{:.6}\t{:.4}\t{:.4}\t{:.4}",
                self.n_events(st),
                name,
                params.shift,
                params.scale,
                params.drift,
                params.var,
                params.scale_sd,
                params.var_sd
            )?;
        }
        write!(w, "\t{}", self.error.as_deref().unwrap_or("."))?;
        writeln!(w)
    }
}

impl std::fmt::Display for ReadSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "read_id=[{}] file=[{}] ev_counts=[{},{}]",
            self.read_id,
            self.base_file_name,
            self.n_events(0),
            self.n_events(1)
        )
    }
}

///
/// Key of a (template, complement) model pair in the joint table.
///
pub fn joint_name(m0: &str, m1: &str) -> String {
    format!("{}+{}", m0, m1)
}
