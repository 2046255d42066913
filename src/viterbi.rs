//!
//! Max-product decoder over the (event x state) lattice.
//!
//! Scores use two rolling rows; the traceback matrix is kept whole.
//! The workspace is reusable so a worker can decode many reads without
//! reallocating.
//!
use crate::events::EventSequence;
use crate::kmer::KmerSpace;
use crate::model::PoreModel;
use crate::prob::Prob;
use crate::transitions::StateTransitions;

#[derive(Default)]
pub struct Viterbi {
    path: Vec<usize>,
    path_prob: Option<Prob>,
    base_seq: String,
}

impl Viterbi {
    pub fn new() -> Viterbi {
        Viterbi::default()
    }

    ///
    /// Decode `events` (already drift-corrected) under the scaled model.
    ///
    pub fn fill(
        &mut self,
        model: &PoreModel,
        transitions: &StateTransitions,
        events: &EventSequence,
    ) {
        debug_assert_eq!(model.space(), transitions.space());
        let space = model.space();
        let n = space.n_states();
        let t_len = events.len();
        self.path.clear();
        self.base_seq.clear();
        if t_len == 0 {
            self.path_prob = Some(Prob::zero());
            return;
        }

        // V[0][s] = pi * emit(s, e0), uniform prior
        let pi = Prob::from_prob(1.0 / n as f64);
        let mut prev: Vec<Prob> = (0..n)
            .map(|s| pi * model.emission_log_prob(s, &events[0]))
            .collect();
        let mut cur: Vec<Prob> = vec![Prob::zero(); n];
        // back[t * n + s] = argmax predecessor of s at event t
        let mut back: Vec<u32> = vec![0; t_len * n];

        for t in 1..t_len {
            let ev = &events[t];
            for s in 0..n {
                let mut best = Prob::zero();
                let mut best_p = s;
                for (p, tp) in transitions.in_neighbors(s) {
                    let v = prev[p] * tp;
                    if v.to_log_value() > best.to_log_value() {
                        best = v;
                        best_p = p;
                    }
                }
                cur[s] = model.emission_log_prob(s, ev) * best;
                back[t * n + s] = best_p as u32;
            }
            std::mem::swap(&mut prev, &mut cur);
        }

        // final state and traceback
        let mut s_best = 0;
        for s in 1..n {
            if prev[s].to_log_value() > prev[s_best].to_log_value() {
                s_best = s;
            }
        }
        self.path_prob = Some(prev[s_best]);
        self.path.resize(t_len, 0);
        let mut s = s_best;
        for t in (0..t_len).rev() {
            self.path[t] = s;
            if t > 0 {
                s = back[t * n + s] as usize;
            }
        }
        self.base_seq = decode_bases(space, &self.path);
    }

    ///
    /// Log-likelihood of the best path; -inf when every path died.
    ///
    pub fn path_probability(&self) -> Prob {
        self.path_prob.unwrap_or_else(Prob::zero)
    }
    pub fn state_path(&self) -> &[usize] {
        &self.path
    }
    pub fn base_seq(&self) -> &str {
        &self.base_seq
    }
}

///
/// Emit the base string implied by a state path: the first k-mer in
/// full, then per step the skip-inferred suffix of the new k-mer.
/// Stays contribute nothing; a step with no overlap contributes the
/// whole k-mer.
///
fn decode_bases(space: KmerSpace, path: &[usize]) -> String {
    let mut seq: Vec<u8> = Vec::with_capacity(space.k() + path.len());
    if let Some(&first) = path.first() {
        seq.extend_from_slice(&space.bases(first));
    }
    for w in path.windows(2) {
        match space.min_shift(w[0], w[1]) {
            Some(0) => {}
            Some(o) => seq.extend_from_slice(&space.suffix_bases(w[1], o)),
            None => seq.extend_from_slice(&space.bases(w[1])),
        }
    }
    // path states are valid ACGT indices by construction
    String::from_utf8_lossy(&seq).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::model::{EmissionRow, PoreModel};
    use approx::assert_abs_diff_eq;

    /// k=3 model with one well separated level per state.
    fn test_model() -> PoreModel {
        let space = KmerSpace::new(3).unwrap();
        let rows: Vec<(String, EmissionRow)> = (0..space.n_states())
            .map(|s| {
                (
                    space.to_string(s),
                    EmissionRow {
                        level_mean: 50.0 + s as f64,
                        level_stdv: 0.1,
                        sd_mean: 0.0,
                        sd_stdv: 0.0,
                    },
                )
            })
            .collect();
        PoreModel::from_rows(&rows).unwrap()
    }

    fn events_for_states(model: &PoreModel, states: &[usize]) -> EventSequence {
        states
            .iter()
            .enumerate()
            .map(|(t, &s)| Event {
                mean: model.row(s).level_mean,
                stdv: 1.0,
                start: t as f64 * 0.01,
                length: 0.01,
            })
            .collect()
    }

    fn state_path_of(space: KmerSpace, bases: &[u8]) -> Vec<usize> {
        bases
            .windows(space.k())
            .map(|w| space.index_of(w).unwrap())
            .collect()
    }

    #[test]
    fn identity_decode() {
        let model = test_model();
        let space = model.space();
        let tr = StateTransitions::compute(space, 0.1, 0.1, 0.0);
        let bases = b"ACGTTGCATCAGTACGGATCCATGCTAGCTACGATCGTAGCATCGAT";
        let path = state_path_of(space, bases);
        let events = events_for_states(&model, &path);
        let mut vit = Viterbi::new();
        vit.fill(&model, &tr, &events);
        assert_eq!(vit.base_seq().as_bytes(), bases);
        assert_eq!(vit.state_path(), &path[..]);

        // path probability is the sum of the per-step terms
        let mut expected = Prob::from_prob(1.0 / space.n_states() as f64)
            * model.emission_log_prob(path[0], &events[0]);
        for t in 1..path.len() {
            let tp = tr
                .out_neighbors(path[t - 1])
                .find(|&(d, _)| d == path[t])
                .map(|(_, p)| p)
                .unwrap();
            expected = expected * tp * model.emission_log_prob(path[t], &events[t]);
        }
        assert_abs_diff_eq!(
            vit.path_probability().to_log_value(),
            expected.to_log_value(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn pure_stay_path_emits_one_kmer() {
        let model = test_model();
        let space = model.space();
        let tr = StateTransitions::compute(space, 0.5, 0.1, 0.0);
        let s = space.index_of(b"GCA").unwrap();
        let events = events_for_states(&model, &vec![s; 10]);
        let mut vit = Viterbi::new();
        vit.fill(&model, &tr, &events);
        assert_eq!(vit.base_seq(), "GCA");
    }

    #[test]
    fn one_shift_path_length() {
        // all 1-shifts over T events emit k + T - 1 bases
        let model = test_model();
        let space = model.space();
        let tr = StateTransitions::compute(space, 0.1, 0.1, 0.0);
        let bases = b"ACGTTGCATCAGT";
        let path = state_path_of(space, bases);
        let events = events_for_states(&model, &path);
        let mut vit = Viterbi::new();
        vit.fill(&model, &tr, &events);
        assert_eq!(vit.base_seq().len(), space.k() + events.len() - 1);
    }

    #[test]
    fn empty_events() {
        let model = test_model();
        let tr = StateTransitions::compute(model.space(), 0.1, 0.1, 0.001);
        let mut vit = Viterbi::new();
        vit.fill(&model, &tr, &EventSequence::default());
        assert!(vit.path_probability().is_zero());
        assert!(vit.base_seq().is_empty());
    }
}
