//!
//! Per-read orchestration: model selection, iterative rescaling, and
//! Viterbi basecalling, dispatched over the worker pool.
//!
//! Models and transitions are immutable and shared by handle; each
//! worker owns exactly one read at a time and the pool serialises the
//! FASTA stream back into submission order.
//!
use crate::config::Config;
use crate::error::Result;
use crate::events::EventSequence;
use crate::io::write_fasta;
use crate::model::{ModelDict, ModelParams, PoreModel};
use crate::pool::WorkerPool;
use crate::prob::Prob;
use crate::summary::{joint_name, ReadSummary};
use crate::trainer::{train_one_round, TrainOutcome};
use crate::transitions::StateTransitions;
use crate::viterbi::Viterbi;
use itertools::iproduct;
use log::{debug, info, warn};
use std::io::Write;

///
/// Shared read-only state of one basecalling run.
///
pub struct CallContext<'a> {
    pub models: &'a ModelDict,
    pub transitions: &'a StateTransitions,
    pub config: &'a Config,
}

///
/// Models to try for a strand: the preferred one when known, otherwise
/// every model whose strand tag matches.
///
fn candidate_models(ctx: &CallContext, read: &ReadSummary, st: usize) -> Vec<String> {
    if let Some(name) = &read.preferred_model[st] {
        if ctx.models.contains_key(name) {
            return vec![name.clone()];
        }
    }
    ctx.models
        .iter()
        .filter(|(_, m)| m.applies_to(st))
        .map(|(n, _)| n.clone())
        .collect()
}

///
/// The two training windows of a strand: leading and trailing halves
/// of the scaling budget, so the drift fit sees the full start-time
/// range.
///
fn train_windows(events: &EventSequence, scale_num_events: usize) -> Vec<EventSequence> {
    let n = scale_num_events.min(events.len());
    vec![events.head(n / 2), events.tail(n / 2)]
}

///
/// Refinement rounds 1.. of one candidate, with the stop rules:
/// singular round discarded and stop; regressing round discarded and
/// stop; round cap; insufficient fit progress. Returns the final
/// parameters, their fit, and the number of rounds run.
///
pub fn run_refinement<F>(
    mut one_round: F,
    init_params: ModelParams,
    init_fit: Prob,
    config: &Config,
    read_id: &str,
    strand_label: &str,
    model_label: &str,
) -> (ModelParams, Prob, u32)
where
    F: FnMut(&ModelParams) -> TrainOutcome,
{
    let mut crt_params = init_params;
    let mut crt_fit = init_fit;
    let mut round = 1u32;
    loop {
        let old_params = crt_params;
        let old_fit = crt_fit;
        let out = one_round(&crt_params);
        crt_params = out.params;
        crt_fit = out.fit;
        debug!(
            "scaling_round read [{}] strand [{}] model [{}] old_params {} old_fit [{}] crt_params {} crt_fit [{}] round [{}]",
            read_id, strand_label, model_label, old_params, old_fit, crt_params, crt_fit, round
        );
        if out.singular {
            crt_params = old_params;
            crt_fit = old_fit;
            break;
        }
        if crt_fit.to_log_value() < old_fit.to_log_value() {
            info!(
                "scaling_regression read [{}] strand [{}] model [{}] old_fit [{}] crt_fit [{}] round [{}]",
                read_id, strand_label, model_label, old_fit, crt_fit, round
            );
            crt_params = old_params;
            crt_fit = old_fit;
            break;
        }
        round += 1;
        if round >= config.scale_max_rounds
            || crt_fit.to_log_value() < old_fit.to_log_value() + config.scale_min_fit_progress
        {
            break;
        }
    }
    (crt_params, crt_fit, round)
}

/// First maximum by fit, in candidate order.
fn best_fit<T: Clone>(fits: &[(T, Prob)]) -> Option<(T, Prob)> {
    let mut best: Option<&(T, Prob)> = None;
    for entry in fits {
        match best {
            Some(b) if entry.1.to_log_value() <= b.1.to_log_value() => {}
            _ => best = Some(entry),
        }
    }
    best.cloned()
}

fn rescale_strand(
    ctx: &CallContext,
    read: &mut ReadSummary,
    st: usize,
    candidates: &[String],
    windows: &[EventSequence],
) {
    // round 0: one training round per candidate, from its prior params
    let mut fits: Vec<(String, Prob)> = Vec::new();
    for name in candidates {
        let Some(model) = ctx.models.get(name) else { continue };
        let pairs: Vec<(&EventSequence, &PoreModel)> = windows.iter().map(|w| (w, model)).collect();
        let old = read.params[st].get(name).copied().unwrap_or_default();
        let out = train_one_round(&pairs, ctx.transitions, &old);
        debug!(
            "scaling_round read [{}] strand [{}] model [{}] old_params {} crt_params {} crt_fit [{}] round [0]",
            read.read_id, st, name, old, out.params, out.fit
        );
        read.params[st].insert(name.clone(), out.params);
        fits.push((name.clone(), out.fit));
    }
    if ctx.config.scale_select_model_single_round {
        if let Some((best, _)) = best_fit(&fits) {
            debug!(
                "selected_model read [{}] strand [{}] model [{}]",
                read.read_id, st, best
            );
            read.preferred_model[st] = Some(best.clone());
            fits.retain(|(n, _)| *n == best);
        }
    }
    // refinement rounds for every remaining candidate
    for (name, fit0) in fits {
        let Some(model) = ctx.models.get(&name) else { continue };
        let pairs: Vec<(&EventSequence, &PoreModel)> = windows.iter().map(|w| (w, model)).collect();
        let init = read.params[st].get(&name).copied().unwrap_or_default();
        let (params, fit, rounds) = run_refinement(
            |p| train_one_round(&pairs, ctx.transitions, p),
            init,
            fit0,
            ctx.config,
            &read.read_id,
            &st.to_string(),
            &name,
        );
        info!(
            "scaling_result read [{}] strand [{}] model [{}] parameters {} fit [{}] rounds [{}]",
            read.read_id, st, name, params, fit, rounds
        );
        read.params[st].insert(name, params);
    }
}

fn rescale_joint(
    ctx: &CallContext,
    read: &mut ReadSummary,
    model_list: &[Vec<String>; 2],
    windows: &[Vec<EventSequence>; 2],
) {
    // round 0 over every (template, complement) model pair
    let mut fits: Vec<((String, String), Prob)> = Vec::new();
    for (n0, n1) in iproduct!(model_list[0].iter(), model_list[1].iter()) {
        let (Some(m0), Some(m1)) = (ctx.models.get(n0), ctx.models.get(n1)) else {
            continue;
        };
        let key = joint_name(n0, n1);
        let pairs: Vec<(&EventSequence, &PoreModel)> = windows[0]
            .iter()
            .map(|w| (w, m0))
            .chain(windows[1].iter().map(|w| (w, m1)))
            .collect();
        let old = read.params[2].get(&key).copied().unwrap_or_default();
        let out = train_one_round(&pairs, ctx.transitions, &old);
        debug!(
            "scaling_round read [{}] strand [2] model [{}] old_params {} crt_params {} crt_fit [{}] round [0]",
            read.read_id, key, old, out.params, out.fit
        );
        read.params[2].insert(key, out.params);
        fits.push(((n0.clone(), n1.clone()), out.fit));
    }
    // strands share one vector, so a single pair is always selected here
    let Some(((b0, b1), fit0)) = best_fit(&fits) else {
        return;
    };
    let key = joint_name(&b0, &b1);
    debug!(
        "selected_model read [{}] strand [2] model [{}]",
        read.read_id, key
    );
    read.preferred_model[0] = Some(b0.clone());
    read.preferred_model[1] = Some(b1.clone());
    let (Some(m0), Some(m1)) = (ctx.models.get(&b0), ctx.models.get(&b1)) else {
        return;
    };
    let pairs: Vec<(&EventSequence, &PoreModel)> = windows[0]
        .iter()
        .map(|w| (w, m0))
        .chain(windows[1].iter().map(|w| (w, m1)))
        .collect();
    let init = read.params[2].get(&key).copied().unwrap_or_default();
    let (params, fit, rounds) = run_refinement(
        |p| train_one_round(&pairs, ctx.transitions, p),
        init,
        fit0,
        ctx.config,
        &read.read_id,
        "2",
        &key,
    );
    info!(
        "scaling_result read [{}] strand [2] model [{}] parameters {} fit [{}] rounds [{}]",
        read.read_id, key, params, fit, rounds
    );
    // the joint vector lands in all three slots
    read.params[2].insert(key, params);
    read.params[0].insert(b0, params);
    read.params[1].insert(b1, params);
}

///
/// Rescale one read in place (both strands, or jointly).
///
pub fn rescale_read(ctx: &CallContext, read: &mut ReadSummary) {
    if let Err(e) = read.load_events() {
        warn!("read [{}]: {}", read.read_id, e);
        read.error = Some(e.to_string());
        return;
    }
    let min_len = ctx.config.min_read_len;
    let mut model_list: [Vec<String>; 2] = [Vec::new(), Vec::new()];
    let mut windows: [Vec<EventSequence>; 2] = [Vec::new(), Vec::new()];
    for st in 0..2 {
        if read.events[st].len() < min_len {
            continue;
        }
        model_list[st] = candidate_models(ctx, read, st);
        windows[st] = train_windows(&read.events[st], ctx.config.scale_num_events);
    }
    if ctx.config.scale_strands_together
        && read.events[0].len() >= min_len
        && read.events[1].len() >= min_len
    {
        rescale_joint(ctx, read, &model_list, &windows);
    } else {
        for st in 0..2 {
            if read.events[st].len() < min_len {
                continue;
            }
            rescale_strand(ctx, read, st, &model_list[st], &windows[st]);
        }
    }
    read.drop_events();
}

/// Per-item buffer of the basecall pool: the finished read plus its
/// FASTA chunk.
#[derive(Default)]
pub struct BasecallBuf {
    pub read: Option<ReadSummary>,
    pub fasta: Vec<u8>,
}

///
/// Basecall one read: per strand, decode with every candidate model
/// and keep the best-scoring result.
///
pub fn basecall_read(ctx: &CallContext, read: &mut ReadSummary, fasta: &mut Vec<u8>) -> Result<()> {
    if let Err(e) = read.load_events() {
        warn!("read [{}]: {}", read.read_id, e);
        read.error = Some(e.to_string());
        return Ok(());
    }
    let mut vit = Viterbi::new();
    for st in 0..2 {
        if read.events[st].len() < ctx.config.min_read_len {
            continue;
        }
        let candidates = candidate_models(ctx, read, st);
        let (ev_mean, ev_stdv) = read.events[st].mean_stdv();
        debug!(
            "mean_stdv read [{}] strand [{}] ev_mean=[{:.2}] ev_stdv=[{:.2}]",
            read.read_id, st, ev_mean, ev_stdv
        );
        let mut results: Vec<(f64, String, String)> = Vec::new();
        for name in candidates {
            let Some(model) = ctx.models.get(&name) else { continue };
            let params = read.params[st].get(&name).copied().unwrap_or_default();
            let mut pm = model.clone();
            pm.scale(params);
            info!(
                "basecalling read [{}] strand [{}] model [{}] parameters {}",
                read.read_id, st, name, params
            );
            debug!(
                "mean_stdv read [{}] strand [{}] model_mean [{:.2}] model_stdv [{:.2}]",
                read.read_id,
                st,
                pm.scaled_mean(),
                pm.stdv()
            );
            if (ev_mean - pm.scaled_mean()).abs() > 5.0 {
                warn!(
                    "means_apart read [{}] strand [{}] model [{}] parameters {} model_mean=[{:.2}] events_mean=[{:.2}]",
                    read.read_id, st, name, params, pm.scaled_mean(), ev_mean
                );
            }
            let corrected = read.events[st].apply_drift_correction(params.drift);
            vit.fill(&pm, ctx.transitions, &corrected);
            results.push((
                vit.path_probability().to_log_value(),
                name,
                vit.base_seq().to_string(),
            ));
        }
        if results.is_empty() {
            continue;
        }
        // ties break on (probability, model name, sequence), maximal wins
        results.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });
        let (_, best_name, best_seq) = results.last().cloned().unwrap_or_default();
        info!(
            "best_model read [{}] strand [{}] model [{}] parameters {}",
            read.read_id,
            st,
            best_name,
            read.params[st].get(&best_name).copied().unwrap_or_default()
        );
        read.preferred_model[st] = Some(best_name.clone());
        let header = format!("{}:{}:{}", read.read_id, read.base_file_name, st);
        write_fasta(fasta, &header, &best_seq, ctx.config.fasta_line_width)?;
    }
    read.drop_events();
    Ok(())
}

fn progress_report(items: usize, seconds: u64) {
    eprint!("Processed {:6} reads in {:6} seconds\r", items, seconds);
}

///
/// Rescale every read over the worker pool; reads come back in
/// submission order.
///
pub fn rescale_reads(ctx: &CallContext, reads: Vec<ReadSummary>) -> Result<Vec<ReadSummary>> {
    let mut queue = reads.into_iter();
    let mut out: Vec<ReadSummary> = Vec::new();
    let pool = WorkerPool::new(ctx.config.threads);
    pool.run(
        || queue.next(),
        |mut read: ReadSummary, buf: &mut Option<ReadSummary>| -> Result<()> {
            rescale_read(ctx, &mut read);
            *buf = Some(read);
            Ok(())
        },
        |buf| out.extend(buf),
        progress_report,
    )?;
    Ok(out)
}

///
/// Basecall every read over the worker pool; FASTA records stream to
/// `writer` in submission order.
///
pub fn basecall_reads<W: Write + Send>(
    ctx: &CallContext,
    reads: Vec<ReadSummary>,
    writer: &mut W,
) -> Result<Vec<ReadSummary>> {
    let mut queue = reads.into_iter();
    let mut out: Vec<ReadSummary> = Vec::new();
    let mut io_error: Option<std::io::Error> = None;
    let pool = WorkerPool::new(ctx.config.threads);
    pool.run(
        || queue.next(),
        |mut read: ReadSummary, buf: &mut BasecallBuf| -> Result<()> {
            basecall_read(ctx, &mut read, &mut buf.fasta)?;
            buf.read = Some(read);
            Ok(())
        },
        |buf| {
            if io_error.is_none() {
                if let Err(e) = writer.write_all(&buf.fasta) {
                    io_error = Some(e);
                }
            }
            out.extend(buf.read);
        },
        progress_report,
    )?;
    if let Some(e) = io_error {
        return Err(e.into());
    }
    Ok(out)
}
