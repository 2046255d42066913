//!
//! Sparse k-mer transition table.
//!
//! One graph node per k-mer state, one `Prob`-weighted edge per allowed
//! transition. Rows are built from (p_stay, p_skip, p_cutoff):
//! staying re-observes the state, shifting extends geometrically with
//! the skip probability, and everything below the cutoff is pruned
//! after row normalisation.
//!
use crate::error::{Error, Result};
use crate::kmer::KmerSpace;
use crate::prob::Prob;
use fnv::FnvHashMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::io::{BufRead, Write};
use std::path::Path;

pub struct StateTransitions {
    space: KmerSpace,
    graph: DiGraph<(), Prob>,
}

impl StateTransitions {
    ///
    /// Build the canonical table. Shift extension stops at k-1 (a full
    /// k shift shares no overlap); the truncated mass is restored by
    /// normalisation, so with `p_cutoff = 0` every row sums to 1.
    ///
    pub fn compute(space: KmerSpace, p_stay: f64, p_skip: f64, p_cutoff: f64) -> StateTransitions {
        let n = space.n_states();
        let mut graph = DiGraph::with_capacity(n, 21 * n);
        for _ in 0..n {
            graph.add_node(());
        }
        let mut row: FnvHashMap<usize, f64> = FnvHashMap::default();
        for src in 0..n {
            row.clear();
            if p_stay > 0.0 {
                *row.entry(src).or_insert(0.0) += p_stay;
            }
            let mut w = (1.0 - p_stay) * (1.0 - p_skip);
            for shift in 1..space.k() {
                if w <= 0.0 {
                    break;
                }
                let per_dst = w / 4f64.powi(shift as i32);
                for dst in space.next_states(src, shift - 1) {
                    *row.entry(dst).or_insert(0.0) += per_dst;
                }
                w *= p_skip;
            }
            let total: f64 = row.values().sum();
            if !(total > 0.0) {
                graph.add_edge(NodeIndex::new(src), NodeIndex::new(src), Prob::one());
                continue;
            }
            let mut entries: Vec<(usize, f64)> = row
                .iter()
                .map(|(&dst, &p)| (dst, p / total))
                .filter(|&(_, p)| p > 0.0 && p >= p_cutoff)
                .collect();
            entries.sort_by_key(|&(dst, _)| dst);
            for (dst, p) in entries {
                graph.add_edge(
                    NodeIndex::new(src),
                    NodeIndex::new(dst),
                    Prob::from_prob(p),
                );
            }
        }
        StateTransitions { space, graph }
    }

    pub fn space(&self) -> KmerSpace {
        self.space
    }
    pub fn n_states(&self) -> usize {
        self.graph.node_count()
    }
    pub fn n_transitions(&self) -> usize {
        self.graph.edge_count()
    }

    ///
    /// Outgoing (destination, probability) entries of `src`. Order is
    /// unspecified but stable for a given table.
    ///
    pub fn out_neighbors(&self, src: usize) -> impl Iterator<Item = (usize, Prob)> + '_ {
        self.graph
            .edges_directed(NodeIndex::new(src), Direction::Outgoing)
            .map(|e| (e.target().index(), *e.weight()))
    }

    ///
    /// Incoming (source, probability) entries of `dst`.
    ///
    pub fn in_neighbors(&self, dst: usize) -> impl Iterator<Item = (usize, Prob)> + '_ {
        self.graph
            .edges_directed(NodeIndex::new(dst), Direction::Incoming)
            .map(|e| (e.source().index(), *e.weight()))
    }

    ///
    /// Text form: one `src_kmer dst_kmer log_prob` line per entry.
    ///
    pub fn save<W: Write>(&self, mut w: W) -> Result<()> {
        for src in 0..self.n_states() {
            for (dst, p) in self.out_neighbors(src) {
                writeln!(
                    w,
                    "{} {} {}",
                    self.space.to_string(src),
                    self.space.to_string(dst),
                    p.to_log_value()
                )?;
            }
        }
        Ok(())
    }

    pub fn load<R: BufRead>(reader: R, path: &Path) -> Result<StateTransitions> {
        let mut space: Option<KmerSpace> = None;
        let mut edges: Vec<(usize, usize, f64)> = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() != 3 {
                return Err(Error::parse(path, lineno + 1, "expected: src dst log_prob"));
            }
            let sp = match space {
                Some(sp) => sp,
                None => {
                    let sp = KmerSpace::new(fields[0].len())?;
                    space = Some(sp);
                    sp
                }
            };
            let bad_kmer = || Error::parse(path, lineno + 1, "bad kmer in transition row");
            let src = sp.index_of(fields[0].as_bytes()).ok_or_else(bad_kmer)?;
            let dst = sp.index_of(fields[1].as_bytes()).ok_or_else(bad_kmer)?;
            let lp: f64 = fields[2]
                .parse()
                .map_err(|_| Error::parse(path, lineno + 1, "bad log probability"))?;
            edges.push((src, dst, lp));
        }
        let space = space.ok_or_else(|| Error::config("empty transition file"))?;
        let n = space.n_states();
        let mut graph = DiGraph::with_capacity(n, edges.len());
        for _ in 0..n {
            graph.add_node(());
        }
        for (src, dst, lp) in edges {
            graph.add_edge(
                NodeIndex::new(src),
                NodeIndex::new(dst),
                Prob::from_log_prob(lp),
            );
        }
        Ok(StateTransitions { space, graph })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Cursor;

    fn row_sum(tr: &StateTransitions, src: usize) -> f64 {
        tr.out_neighbors(src).map(|(_, p)| p.to_value()).sum()
    }

    #[test]
    fn rows_sum_to_one_before_pruning() {
        let sp = KmerSpace::new(6).unwrap();
        let tr = StateTransitions::compute(sp, 0.1, 0.1, 0.0);
        for src in [0usize, 1, 137, 4095] {
            assert_abs_diff_eq!(row_sum(&tr, src), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn pruned_rows_sum_at_most_one() {
        let sp = KmerSpace::new(6).unwrap();
        let tr = StateTransitions::compute(sp, 0.1, 0.1, 0.001);
        for src in 0..tr.n_states() {
            assert!(row_sum(&tr, src) <= 1.0 + 1e-6);
        }
    }

    #[test]
    fn out_degree_matches_shift_structure() {
        let sp = KmerSpace::new(6).unwrap();
        let tr = StateTransitions::compute(sp, 0.1, 0.1, 0.0);
        // a kmer whose shift successors never collide with itself:
        // 1 stay + 4 + 16 + 64 + 256 + 1024 one..five-shift targets
        let src = sp.index_of(b"ACGTCA").unwrap();
        assert_eq!(tr.out_neighbors(src).count(), 1365);
        // with the default cutoff only stay + 1-shift + 2-shift rows survive
        let tr = StateTransitions::compute(sp, 0.1, 0.1, 0.001);
        assert_eq!(tr.out_neighbors(src).count(), 21);
        assert!(tr.n_transitions() <= 21 * tr.n_states());
    }

    #[test]
    fn in_out_consistency() {
        let sp = KmerSpace::new(3).unwrap();
        let tr = StateTransitions::compute(sp, 0.2, 0.1, 0.0);
        for src in 0..tr.n_states() {
            for (dst, p) in tr.out_neighbors(src) {
                assert!(tr
                    .in_neighbors(dst)
                    .any(|(s, q)| s == src && q.to_log_value() == p.to_log_value()));
            }
        }
    }

    #[test]
    fn text_round_trip() {
        let sp = KmerSpace::new(3).unwrap();
        let tr = StateTransitions::compute(sp, 0.1, 0.1, 0.001);
        let mut text = Vec::new();
        tr.save(&mut text).unwrap();
        let tr2 = StateTransitions::load(Cursor::new(text), Path::new("trans")).unwrap();
        assert_eq!(tr2.n_states(), tr.n_states());
        assert_eq!(tr2.n_transitions(), tr.n_transitions());
        for src in 0..tr.n_states() {
            let mut a: Vec<_> = tr.out_neighbors(src).collect();
            let mut b: Vec<_> = tr2.out_neighbors(src).collect();
            a.sort_by_key(|&(d, _)| d);
            b.sort_by_key(|&(d, _)| d);
            for ((d1, p1), (d2, p2)) in a.iter().zip(b.iter()) {
                assert_eq!(d1, d2);
                assert_abs_diff_eq!(p1.to_log_value(), p2.to_log_value(), epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn stay_only_when_k_is_one() {
        let sp = KmerSpace::new(1).unwrap();
        let tr = StateTransitions::compute(sp, 0.3, 0.1, 0.0);
        for src in 0..4 {
            let out: Vec<_> = tr.out_neighbors(src).collect();
            assert_eq!(out.len(), 1);
            assert_abs_diff_eq!(out[0].1.to_value(), 1.0, epsilon = 1e-12);
        }
    }
}
