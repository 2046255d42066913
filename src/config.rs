//!
//! Command line configuration, threaded explicitly through the
//! pipeline.
//!
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;

/// Call bases in Oxford Nanopore reads.
#[derive(Parser, Debug, Clone, Serialize)]
#[command(name = "porecall", version)]
pub struct Config {
    /// Number of parallel threads.
    #[arg(short = 't', long, default_value_t = 1)]
    pub threads: usize,
    /// Custom pore model, as strand:file with strand 0, 1 or 2 (repeatable).
    #[arg(short = 'm', long = "model")]
    pub models: Vec<String>,
    /// File of pore models, one strand:file line each.
    #[arg(long)]
    pub model_fofn: Option<PathBuf>,
    /// Custom initial state transitions.
    #[arg(short = 's', long = "trans")]
    pub trans: Option<PathBuf>,
    /// Output file (default: stdout).
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
    /// Per-read stats file.
    #[arg(long)]
    pub stats: Option<PathBuf>,
    /// Minimum read length, in events.
    #[arg(long = "min-len", default_value_t = 1000)]
    pub min_read_len: usize,
    /// Maximum fasta line width.
    #[arg(long, default_value_t = 80)]
    pub fasta_line_width: usize,
    /// Transition probability of staying in the same state.
    #[arg(long, default_value_t = 0.1)]
    pub pr_stay: f64,
    /// Transition probability of skipping at least one state.
    #[arg(long, default_value_t = 0.1)]
    pub pr_skip: f64,
    /// Minimum transition probability; smaller entries are pruned.
    #[arg(long, default_value_t = 0.001)]
    pub pr_cutoff: f64,
    /// Number of events used for model scaling.
    #[arg(long, default_value_t = 200)]
    pub scale_num_events: usize,
    /// Maximum scaling rounds.
    #[arg(long, default_value_t = 10)]
    pub scale_max_rounds: u32,
    /// Minimum scaling fit progress, in nats.
    #[arg(long, default_value_t = 1.0)]
    pub scale_min_fit_progress: f64,
    /// Stop after computing model scalings.
    #[arg(long)]
    pub scale_only: bool,
    /// Compute model scalings more accurately.
    #[arg(long)]
    pub accurate: bool,
    /// Use the same scaling parameters for both strands.
    #[arg(long)]
    pub scale_strands_together: bool,
    /// Use a single round of training to select the best model per strand.
    #[arg(long)]
    pub scale_select_model_single_round: bool,
    /// Drop the event stdv emission term.
    #[arg(long)]
    pub ignore_events_stdv: bool,
    /// Log filter, env_logger syntax (repeatable).
    #[arg(long = "log")]
    pub log_levels: Vec<String>,
    /// Inputs: directories, event files, or files of file names
    /// ("-" reads the list from stdin).
    #[arg(required = true)]
    pub inputs: Vec<String>,
}

impl Config {
    ///
    /// The rescale phase runs when any flag that needs trained
    /// scalings is set.
    ///
    pub fn rescale_enabled(&self) -> bool {
        self.accurate || self.scale_strands_together || self.scale_select_model_single_round
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            threads: 1,
            models: Vec::new(),
            model_fofn: None,
            trans: None,
            output: None,
            stats: None,
            min_read_len: 1000,
            fasta_line_width: 80,
            pr_stay: 0.1,
            pr_skip: 0.1,
            pr_cutoff: 0.001,
            scale_num_events: 200,
            scale_max_rounds: 10,
            scale_min_fit_progress: 1.0,
            scale_only: false,
            accurate: false,
            scale_strands_together: false,
            scale_select_model_single_round: false,
            ignore_events_stdv: false,
            log_levels: Vec::new(),
            inputs: Vec::new(),
        }
    }
}
