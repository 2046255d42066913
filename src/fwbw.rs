//!
//! Forward/Backward engine.
//!
//! Sum-product counterpart of the Viterbi decoder: same lattice, same
//! transition structure, log-sum-exp instead of max. Produces the full
//! log-likelihood and per-cell posteriors used by the trainer.
//!
use crate::events::EventSequence;
use crate::model::PoreModel;
use crate::prob::Prob;
use crate::transitions::StateTransitions;

#[derive(Default)]
pub struct ForwardBackward {
    n: usize,
    t_len: usize,
    fwd: Vec<Prob>,
    bwd: Vec<Prob>,
    ll: Option<Prob>,
}

impl ForwardBackward {
    pub fn new() -> ForwardBackward {
        ForwardBackward::default()
    }

    ///
    /// Run both passes over `events` (already drift-corrected).
    ///
    pub fn fill(
        &mut self,
        model: &PoreModel,
        transitions: &StateTransitions,
        events: &EventSequence,
    ) {
        debug_assert_eq!(model.space(), transitions.space());
        let n = model.n_states();
        let t_len = events.len();
        self.n = n;
        self.t_len = t_len;
        if t_len == 0 {
            self.fwd.clear();
            self.bwd.clear();
            self.ll = Some(Prob::zero());
            return;
        }
        self.fwd.clear();
        self.fwd.resize(t_len * n, Prob::zero());
        self.bwd.clear();
        self.bwd.resize(t_len * n, Prob::zero());

        // forward
        let pi = Prob::from_prob(1.0 / n as f64);
        for s in 0..n {
            self.fwd[s] = pi * model.emission_log_prob(s, &events[0]);
        }
        for t in 1..t_len {
            let ev = &events[t];
            let (done, row) = self.fwd.split_at_mut(t * n);
            let prev = &done[(t - 1) * n..];
            for s in 0..n {
                let sum: Prob = transitions
                    .in_neighbors(s)
                    .map(|(p, tp)| prev[p] * tp)
                    .sum();
                row[s] = model.emission_log_prob(s, ev) * sum;
            }
        }
        let ll: Prob = self.fwd[(t_len - 1) * n..].iter().sum();
        self.ll = Some(ll);

        // backward
        for s in 0..n {
            self.bwd[(t_len - 1) * n + s] = Prob::one();
        }
        let mut emit = vec![Prob::zero(); n];
        for t in (0..t_len - 1).rev() {
            let ev_next = &events[t + 1];
            for (s, e) in emit.iter_mut().enumerate() {
                *e = model.emission_log_prob(s, ev_next);
            }
            let (rows, done) = self.bwd.split_at_mut((t + 1) * n);
            let next = &done[..n];
            let row = &mut rows[t * n..];
            for s in 0..n {
                row[s] = transitions
                    .out_neighbors(s)
                    .map(|(d, tp)| tp * emit[d] * next[d])
                    .sum();
            }
        }
    }

    ///
    /// log of the total probability over all paths.
    ///
    pub fn log_likelihood(&self) -> Prob {
        self.ll.unwrap_or_else(Prob::zero)
    }
    pub fn n_events(&self) -> usize {
        self.t_len
    }
    pub fn n_states(&self) -> usize {
        self.n
    }

    ///
    /// Posterior gamma[t][s] = P(state_t = s | events), log domain.
    ///
    pub fn posterior(&self, t: usize, s: usize) -> Prob {
        let ll = self.log_likelihood();
        if ll.is_zero() {
            return Prob::zero();
        }
        self.fwd[t * self.n + s] * self.bwd[t * self.n + s] / ll
    }
}
