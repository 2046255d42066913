use clap::Parser;
use log::{debug, error, info};
use porecall::builtin::load_builtin_models;
use porecall::config::Config;
use porecall::error::{Error, Result};
use porecall::event_table;
use porecall::io::{create_output, open_text};
use porecall::model::{ModelDict, PoreModel};
use porecall::pipeline::{self, CallContext};
use porecall::summary::ReadSummary;
use porecall::transitions::StateTransitions;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

fn init_logging(specs: &[String]) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log::LevelFilter::Info);
    for spec in specs {
        builder.parse_filters(spec);
    }
    builder.init();
}

/// `strand:file` with strand 0, 1 or 2.
fn parse_model_arg(s: &str) -> Result<(usize, String)> {
    let bytes = s.as_bytes();
    if bytes.len() < 3 || !matches!(bytes[0], b'0' | b'1' | b'2') || bytes[1] != b':' {
        return Err(Error::config(format!(
            "could not parse model name \"{}\"; format is [0|1|2]:<file>",
            s
        )));
    }
    Ok(((bytes[0] - b'0') as usize, s[2..].to_string()))
}

fn init_models(config: &Config) -> Result<ModelDict> {
    let mut model_list: [Vec<String>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for s in &config.models {
        let (st, path) = parse_model_arg(s)?;
        model_list[st].push(path);
    }
    if let Some(fofn) = &config.model_fofn {
        for line in open_text(fofn)?.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (st, path) = parse_model_arg(line)?;
            model_list[st].push(path);
        }
    }
    if model_list[2].is_empty() && (model_list[0].is_empty() != model_list[1].is_empty()) {
        let missing = if model_list[0].is_empty() { 0 } else { 1 };
        return Err(Error::config(format!(
            "no models for strand {}; give models for both strands, or for neither",
            missing
        )));
    }

    let mut models = if model_list.iter().all(|l| l.is_empty()) {
        load_builtin_models()?
    } else {
        let mut models = ModelDict::new();
        for (st, paths) in model_list.iter().enumerate() {
            for path in paths {
                let mut pm = PoreModel::load(open_text(Path::new(path))?, Path::new(path))?;
                pm.set_strand(st as u8);
                info!("loaded model [{}] for strand [{}]", path, st);
                models.insert(path.clone(), pm);
            }
        }
        models
    };

    let mut k = None;
    for (name, pm) in models.iter() {
        match k {
            None => k = Some(pm.k()),
            Some(k) if k != pm.k() => {
                return Err(Error::config(format!(
                    "model [{}] has k={}, other models have k={}",
                    name,
                    pm.k(),
                    k
                )))
            }
            _ => {}
        }
    }
    if config.ignore_events_stdv {
        for pm in models.values_mut() {
            pm.set_with_sd(false);
        }
    }
    Ok(models)
}

fn init_transitions(config: &Config, models: &ModelDict) -> Result<StateTransitions> {
    let space = models
        .values()
        .next()
        .ok_or_else(|| Error::config("no pore models loaded"))?
        .space();
    match &config.trans {
        Some(path) => {
            let transitions = StateTransitions::load(open_text(path)?, path)?;
            if transitions.space() != space {
                return Err(Error::config(format!(
                    "transition table k={} does not match model k={}",
                    transitions.space().k(),
                    space.k()
                )));
            }
            info!("loaded state transitions from [{}]", path.display());
            Ok(transitions)
        }
        None => {
            info!(
                "initialized state transitions with parameters pr_skip=[{}] pr_stay=[{}] pr_cutoff=[{}]",
                config.pr_skip, config.pr_stay, config.pr_cutoff
            );
            Ok(StateTransitions::compute(
                space,
                config.pr_stay,
                config.pr_skip,
                config.pr_cutoff,
            ))
        }
    }
}

// Each argument is a directory (scanned one level deep), an event
// file, or a file of file names ("-" reads the list from stdin).
fn init_files(config: &Config) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let add = |p: PathBuf, files: &mut Vec<PathBuf>| {
        info!("adding input file [{}]", p.display());
        files.push(p);
    };
    for input in &config.inputs {
        let path = Path::new(input);
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
                .collect::<std::io::Result<Vec<_>>>()?
                .into_iter()
                .map(|e| e.path())
                .collect();
            entries.sort();
            for p in entries {
                if p.is_dir() {
                    info!("ignoring subdirectory [{}]", p.display());
                } else if event_table::is_valid_file(&p) {
                    add(p, &mut files);
                } else {
                    info!("ignoring file [{}]", p.display());
                }
            }
        } else if input != "-" && event_table::is_valid_file(path) {
            add(path.to_path_buf(), &mut files);
        } else {
            info!("interpreting [{}] as fofn", input);
            let reader: Box<dyn BufRead> = if input == "-" {
                Box::new(BufReader::new(std::io::stdin()))
            } else {
                open_text(path)?
            };
            for line in reader.lines() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let p = Path::new(line);
                if event_table::is_valid_file(p) {
                    add(p.to_path_buf(), &mut files);
                } else {
                    info!("ignoring file [{}]", p.display());
                }
            }
        }
    }
    if files.is_empty() {
        return Err(Error::config("no event files to process"));
    }
    Ok(files)
}

fn init_reads(config: &Config, models: &ModelDict, files: &[PathBuf]) -> Vec<ReadSummary> {
    let mut reads = Vec::new();
    for f in files {
        match ReadSummary::open(f, models, config.scale_strands_together) {
            Ok(summary) => {
                info!("summary: {}", summary);
                if summary.have_ed_events
                    && (summary.n_events(0) >= config.min_read_len
                        || summary.n_events(1) >= config.min_read_len)
                {
                    reads.push(summary);
                } else {
                    info!("skipping read [{}]: too few events", summary.read_id);
                }
            }
            Err(e) => info!("skipping [{}]: {}", f.display(), e),
        }
    }
    reads
}

fn run(config: &Config) -> Result<()> {
    let models = init_models(config)?;
    let transitions = init_transitions(config, &models)?;
    let files = init_files(config)?;
    let mut reads = init_reads(config, &models, &files);
    let ctx = CallContext {
        models: &models,
        transitions: &transitions,
        config,
    };
    if config.rescale_enabled() {
        reads = pipeline::rescale_reads(&ctx, reads)?;
    }
    if !config.scale_only {
        let mut writer = create_output(config.output.as_deref())?;
        reads = pipeline::basecall_reads(&ctx, reads, &mut writer)?;
        writer.flush()?;
    }
    if let Some(stats_path) = &config.stats {
        let mut ofs = std::fs::File::create(stats_path)?;
        for summary in &reads {
            summary.write_tsv(&mut ofs)?;
        }
    }
    Ok(())
}

fn main() {
    let config = Config::parse();
    init_logging(&config.log_levels);
    info!("program: porecall {}", env!("CARGO_PKG_VERSION"));
    if let Ok(json) = serde_json::to_string(&config) {
        debug!("config: {}", json);
    }
    if let Err(e) = run(&config) {
        error!("{}", e);
        std::process::exit(1);
    }
}
