//! Segmentation lattice over a normalized sentence.
//!
//! Nodes are integer handles into an arena owned by the lattice; `prev` links
//! and the per-position node lists store handles, never references. The arena
//! is reset between sentences without releasing its allocation.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use log::warn;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::error::{Result, UnipieceError};

/// Handle of a node inside the lattice arena.
pub type NodeRef = u32;

/// Nodes pre-allocated by a fresh lattice.
const PREALLOCATED_NODES: usize = 1024;

/// Gap beyond which `exp(min - max)` is treated as zero.
const MINUS_LOG_EPSILON: f32 = 50.0;

/// Returns `log(exp(x) + exp(y))`; with `init` set, returns `y`.
///
/// `log(Σ exp(a_i))` is computed by folding with `init` on the first element.
fn log_sum_exp(x: f32, y: f32, init: bool) -> f32 {
    if init {
        return y;
    }
    let (vmin, vmax) = if x < y { (x, y) } else { (y, x) };
    if vmax > vmin + MINUS_LOG_EPSILON {
        vmax
    } else {
        vmax + ((vmin - vmax).exp() + 1.0).ln()
    }
}

/// A candidate piece spanning `[pos, pos + length)` in characters.
#[derive(Debug, Clone, Copy)]
pub struct Node {
    /// Starting character position.
    pub pos: u32,
    /// Span length in characters; zero for the BOS/EOS sentinels.
    pub length: u32,
    /// Arena index of this node.
    pub node_id: u32,
    /// Vocabulary id; `-1` marks a synthetic node (BOS/EOS, training UNK).
    pub id: i32,
    /// Unigram log-probability of the piece.
    pub score: f32,
    /// Best path score from BOS up to and including this node.
    pub backtrace_score: f32,
    /// Predecessor on the best path.
    pub prev: Option<NodeRef>,
}

/// Lattice of all candidate pieces over one sentence.
#[derive(Debug)]
pub struct Lattice {
    sentence: String,
    char_offsets: Vec<usize>,
    nodes: Vec<Node>,
    begin_nodes: Vec<Vec<NodeRef>>,
    end_nodes: Vec<Vec<NodeRef>>,
}

impl Default for Lattice {
    fn default() -> Self {
        Self::new()
    }
}

impl Lattice {
    /// Creates an empty lattice with a pre-allocated node arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sentence: String::new(),
            char_offsets: Vec::new(),
            nodes: Vec::with_capacity(PREALLOCATED_NODES),
            begin_nodes: Vec::new(),
            end_nodes: Vec::new(),
        }
    }

    /// Resets all state, keeping allocations for reuse.
    pub fn clear(&mut self) {
        self.sentence.clear();
        self.char_offsets.clear();
        self.nodes.clear();
        for list in &mut self.begin_nodes {
            list.clear();
        }
        for list in &mut self.end_nodes {
            list.clear();
        }
    }

    /// Installs a sentence and places the BOS/EOS sentinels.
    pub fn set_sentence(&mut self, sentence: &str) {
        self.clear();
        self.sentence.push_str(sentence);
        for (offset, _) in self.sentence.char_indices() {
            self.char_offsets.push(offset);
        }
        self.char_offsets.push(self.sentence.len());

        let len = self.len();
        if self.begin_nodes.len() < len + 1 {
            self.begin_nodes.resize_with(len + 1, Vec::new);
            self.end_nodes.resize_with(len + 1, Vec::new);
        }

        let bos = self.new_node(0, 0);
        self.end_nodes[0].push(bos);
        let eos = self.new_node(len as u32, 0);
        self.begin_nodes[len].push(eos);
    }

    fn new_node(&mut self, pos: u32, length: u32) -> NodeRef {
        let node_id = self.nodes.len() as u32;
        self.nodes.push(Node {
            pos,
            length,
            node_id,
            id: -1,
            score: 0.0,
            backtrace_score: 0.0,
            prev: None,
        });
        node_id
    }

    /// Sentence length in characters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.char_offsets.len().saturating_sub(1)
    }

    /// Returns `true` when the sentence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The sentence this lattice was built over.
    #[must_use]
    pub fn sentence(&self) -> &str {
        &self.sentence
    }

    /// Sentence suffix starting at character position `pos`.
    #[must_use]
    pub fn surface(&self, pos: usize) -> &str {
        &self.sentence[self.char_offsets[pos]..]
    }

    /// Byte length of the `length`-character span starting at `pos`.
    #[must_use]
    pub fn span_bytes(&self, pos: usize, length: usize) -> usize {
        self.char_offsets[pos + length] - self.char_offsets[pos]
    }

    /// The BOS sentinel.
    #[must_use]
    pub fn bos_node(&self) -> NodeRef {
        self.end_nodes[0][0]
    }

    /// The EOS sentinel.
    #[must_use]
    pub fn eos_node(&self) -> NodeRef {
        self.begin_nodes[self.len()][0]
    }

    /// Immutable access to a node.
    #[must_use]
    pub fn node(&self, node: NodeRef) -> &Node {
        &self.nodes[node as usize]
    }

    /// Mutable access to a node; callers fill `id` and `score` after insert.
    pub fn node_mut(&mut self, node: NodeRef) -> &mut Node {
        &mut self.nodes[node as usize]
    }

    /// Number of nodes currently allocated, sentinels included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Surface text covered by a node.
    #[must_use]
    pub fn piece(&self, node: NodeRef) -> &str {
        let n = &self.nodes[node as usize];
        let begin = self.char_offsets[n.pos as usize];
        let end = self.char_offsets[(n.pos + n.length) as usize];
        &self.sentence[begin..end]
    }

    /// Candidate nodes starting at character position `pos`.
    #[must_use]
    pub fn begin_nodes(&self, pos: usize) -> &[NodeRef] {
        &self.begin_nodes[pos]
    }

    /// Candidate nodes ending at character position `pos`.
    #[must_use]
    pub fn end_nodes(&self, pos: usize) -> &[NodeRef] {
        &self.end_nodes[pos]
    }

    /// Attaches a candidate piece spanning `[pos, pos + length)` characters.
    pub fn insert(&mut self, pos: usize, length: usize) -> NodeRef {
        let node = self.new_node(pos as u32, length as u32);
        self.begin_nodes[pos].push(node);
        self.end_nodes[pos + length].push(node);
        node
    }

    /// Finds the maximum-score path; returns node handles left to right.
    ///
    /// Ties keep the first node in insertion order. A position with no
    /// incoming nodes is a build-time bug and is surfaced as an error.
    pub fn viterbi(&mut self) -> Result<Vec<NodeRef>> {
        let len = self.len();

        for pos in 0..=len {
            for i in 0..self.begin_nodes[pos].len() {
                let rnode = self.begin_nodes[pos][i];
                let rscore = self.nodes[rnode as usize].score;
                let mut best: Option<(NodeRef, f32)> = None;
                for &lnode in &self.end_nodes[pos] {
                    let score = self.nodes[lnode as usize].backtrace_score + rscore;
                    if best.map_or(true, |(_, best_score)| score > best_score) {
                        best = Some((lnode, score));
                    }
                }
                let Some((lnode, score)) = best else {
                    return Err(UnipieceError::Internal(format!(
                        "no path reaches position {pos} in the lattice"
                    )));
                };
                let node = &mut self.nodes[rnode as usize];
                node.prev = Some(lnode);
                node.backtrace_score = score;
            }
        }

        let mut results = Vec::new();
        let mut cursor = self.nodes[self.eos_node() as usize].prev;
        while let Some(node) = cursor {
            let prev = self.nodes[node as usize].prev;
            if prev.is_none() {
                break;
            }
            results.push(node);
            cursor = prev;
        }
        results.reverse();
        Ok(results)
    }

    /// Enumerates the `nbest_size` best paths with A* search.
    ///
    /// The Viterbi backtrace score is the exact heuristic, so paths pop in
    /// strictly non-increasing score order.
    pub fn nbest(&mut self, nbest_size: usize) -> Result<Vec<Vec<NodeRef>>> {
        if nbest_size == 0 {
            warn!("nbest called with size 0; returning no results");
            return Ok(Vec::new());
        }
        if nbest_size == 1 {
            return Ok(vec![self.viterbi()?]);
        }

        // Fill backtrace scores first; they are h(x) below.
        self.viterbi()?;

        struct Hypothesis {
            node: NodeRef,
            next: Option<u32>,
            gx: f32,
        }

        #[derive(Clone, Copy)]
        struct Agenda {
            fx: f32,
            hyp: u32,
        }
        impl PartialEq for Agenda {
            fn eq(&self, other: &Self) -> bool {
                self.cmp(other) == Ordering::Equal
            }
        }
        impl Eq for Agenda {}
        impl PartialOrd for Agenda {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Agenda {
            fn cmp(&self, other: &Self) -> Ordering {
                self.fx
                    .total_cmp(&other.fx)
                    .then_with(|| other.hyp.cmp(&self.hyp))
            }
        }

        const MAX_AGENDA_SIZE: usize = 100_000;
        const MIN_AGENDA_SIZE: usize = 512;

        let mut hypotheses: Vec<Hypothesis> = Vec::with_capacity(MIN_AGENDA_SIZE);
        let mut agenda: BinaryHeap<Agenda> = BinaryHeap::new();
        let mut results: Vec<Vec<NodeRef>> = Vec::with_capacity(nbest_size);

        let eos = self.eos_node();
        let eos_score = self.nodes[eos as usize].score;
        hypotheses.push(Hypothesis {
            node: eos,
            next: None,
            gx: eos_score,
        });
        agenda.push(Agenda {
            fx: eos_score,
            hyp: 0,
        });

        while let Some(top) = agenda.pop() {
            let top_idx = top.hyp;
            let node = hypotheses[top_idx as usize].node;
            let top_gx = hypotheses[top_idx as usize].gx;

            if node == self.bos_node() {
                let mut path = Vec::new();
                let mut cursor = hypotheses[top_idx as usize].next;
                while let Some(hyp) = cursor {
                    let entry = &hypotheses[hyp as usize];
                    if entry.next.is_none() {
                        break;
                    }
                    path.push(entry.node);
                    cursor = entry.next;
                }
                results.push(path);
                if results.len() == nbest_size {
                    break;
                }
                continue;
            }

            let pos = self.nodes[node as usize].pos as usize;
            for &lnode in &self.end_nodes[pos] {
                let left = &self.nodes[lnode as usize];
                let hyp = hypotheses.len() as u32;
                hypotheses.push(Hypothesis {
                    node: lnode,
                    next: Some(top_idx),
                    gx: left.score + top_gx,
                });
                agenda.push(Agenda {
                    fx: left.backtrace_score + top_gx,
                    hyp,
                });
            }

            // Long or repetitive inputs can blow the agenda up; keep only
            // the most promising hypotheses and continue.
            if agenda.len() >= MAX_AGENDA_SIZE {
                warn!("nbest agenda grew past {MAX_AGENDA_SIZE}; shrinking");
                let keep = MIN_AGENDA_SIZE.min(nbest_size * 10);
                let mut shrunk = BinaryHeap::with_capacity(keep);
                for _ in 0..keep {
                    match agenda.pop() {
                        Some(item) => shrunk.push(item),
                        None => break,
                    }
                }
                agenda = shrunk;
            }
        }

        Ok(results)
    }

    /// Adds `freq`-weighted posterior node probabilities into `expected`,
    /// indexed by vocabulary id, and returns `freq · log Z`.
    pub fn populate_marginal(&self, freq: f32, expected: &mut [f32]) -> f32 {
        let len = self.len();
        let mut alpha = vec![0.0f32; self.nodes.len()];
        let mut beta = vec![0.0f32; self.nodes.len()];

        for pos in 0..=len {
            for &rnode in &self.begin_nodes[pos] {
                for (k, &lnode) in self.end_nodes[pos].iter().enumerate() {
                    alpha[rnode as usize] = log_sum_exp(
                        alpha[rnode as usize],
                        self.nodes[lnode as usize].score + alpha[lnode as usize],
                        k == 0,
                    );
                }
            }
        }

        for pos in (0..=len).rev() {
            for &lnode in &self.end_nodes[pos] {
                for (k, &rnode) in self.begin_nodes[pos].iter().enumerate() {
                    beta[lnode as usize] = log_sum_exp(
                        beta[lnode as usize],
                        self.nodes[rnode as usize].score + beta[rnode as usize],
                        k == 0,
                    );
                }
            }
        }

        let z = alpha[self.eos_node() as usize];
        for pos in 0..len {
            for &node in &self.begin_nodes[pos] {
                let n = &self.nodes[node as usize];
                if n.id >= 0 {
                    expected[n.id as usize] += freq
                        * (alpha[node as usize] + n.score + beta[node as usize] - z).exp();
                }
            }
        }

        freq * z
    }

    /// Draws one segmentation from the `theta`-scaled path distribution.
    pub fn sample<R: Rng + ?Sized>(&self, theta: f32, rng: &mut R) -> Vec<NodeRef> {
        let len = self.len();
        if len == 0 {
            return Vec::new();
        }

        let mut alpha = vec![0.0f32; self.nodes.len()];
        for pos in 0..=len {
            for &rnode in &self.begin_nodes[pos] {
                for (k, &lnode) in self.end_nodes[pos].iter().enumerate() {
                    alpha[rnode as usize] = log_sum_exp(
                        alpha[rnode as usize],
                        theta * self.nodes[lnode as usize].score + alpha[lnode as usize],
                        k == 0,
                    );
                }
            }
        }

        let bos = self.bos_node();
        let mut results = Vec::new();
        let mut z = alpha[self.eos_node() as usize];
        let mut node = self.eos_node();
        loop {
            let pos = self.nodes[node as usize].pos as usize;
            let probs: Vec<f64> = self.end_nodes[pos]
                .iter()
                .map(|&lnode| {
                    f64::from(
                        (alpha[lnode as usize] + theta * self.nodes[lnode as usize].score - z)
                            .exp(),
                    )
                })
                .collect();
            let chosen = match WeightedIndex::new(&probs) {
                Ok(dist) => dist.sample(rng),
                // All mass underflowed; fall back to the first predecessor.
                Err(_) => 0,
            };
            node = self.end_nodes[pos][chosen];
            if node == bos {
                break;
            }
            z = alpha[node as usize];
            results.push(node);
        }
        results.reverse();
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn insert_scored(lattice: &mut Lattice, pos: usize, length: usize, id: i32, score: f32) -> NodeRef {
        let node = lattice.insert(pos, length);
        let entry = lattice.node_mut(node);
        entry.id = id;
        entry.score = score;
        node
    }

    #[test]
    fn set_sentence_places_sentinels() {
        let mut lattice = Lattice::new();
        lattice.set_sentence("あいu");
        assert_eq!(lattice.len(), 3);
        assert_eq!(lattice.surface(1), "いu");
        assert_eq!(lattice.span_bytes(0, 2), 6);
        assert_eq!(lattice.node(lattice.bos_node()).id, -1);
        assert_eq!(lattice.node(lattice.eos_node()).pos, 3);
    }

    #[test]
    fn insert_exposes_piece_views() {
        let mut lattice = Lattice::new();
        lattice.set_sentence("ABあい");
        let node = insert_scored(&mut lattice, 1, 2, 0, 0.0);
        assert_eq!(lattice.piece(node), "Bあ");
    }

    #[test]
    fn viterbi_picks_the_highest_scoring_path() {
        let mut lattice = Lattice::new();
        lattice.set_sentence("ab");
        insert_scored(&mut lattice, 0, 1, 0, -1.0);
        insert_scored(&mut lattice, 1, 1, 1, -2.0);
        let whole = insert_scored(&mut lattice, 0, 2, 2, -2.5);
        let path = lattice.viterbi().expect("connected lattice");
        assert_eq!(path, vec![whole]);

        // Raising the split's score flips the decision.
        let mut lattice = Lattice::new();
        lattice.set_sentence("ab");
        let a = insert_scored(&mut lattice, 0, 1, 0, -1.0);
        let b = insert_scored(&mut lattice, 1, 1, 1, -1.0);
        insert_scored(&mut lattice, 0, 2, 2, -2.5);
        let path = lattice.viterbi().expect("connected lattice");
        assert_eq!(path, vec![a, b]);
    }

    #[test]
    fn viterbi_ties_keep_insertion_order() {
        let mut lattice = Lattice::new();
        lattice.set_sentence("ab");
        let first = insert_scored(&mut lattice, 0, 2, 0, -1.0);
        insert_scored(&mut lattice, 0, 2, 1, -1.0);
        let path = lattice.viterbi().expect("connected lattice");
        assert_eq!(path, vec![first]);
    }

    #[test]
    fn viterbi_reports_unreachable_positions() {
        let mut lattice = Lattice::new();
        lattice.set_sentence("ab");
        insert_scored(&mut lattice, 1, 1, 0, -1.0);
        assert!(matches!(
            lattice.viterbi(),
            Err(UnipieceError::Internal(_))
        ));
    }

    #[test]
    fn empty_sentence_yields_empty_path() {
        let mut lattice = Lattice::new();
        lattice.set_sentence("");
        assert_eq!(lattice.viterbi().expect("trivial lattice"), Vec::<NodeRef>::new());
    }

    #[test]
    fn nbest_is_monotone_and_starts_with_viterbi() {
        let mut lattice = Lattice::new();
        lattice.set_sentence("abc");
        insert_scored(&mut lattice, 0, 1, 0, -1.0);
        insert_scored(&mut lattice, 1, 1, 1, -1.5);
        insert_scored(&mut lattice, 2, 1, 2, -1.0);
        insert_scored(&mut lattice, 0, 2, 3, -2.0);
        insert_scored(&mut lattice, 1, 2, 4, -2.0);
        insert_scored(&mut lattice, 0, 3, 5, -4.5);

        let paths = lattice.nbest(10).expect("connected lattice");
        assert!(!paths.is_empty());

        let viterbi = lattice.viterbi().expect("connected lattice");
        let path_score = |path: &[NodeRef]| -> f32 {
            path.iter().map(|&n| lattice.node(n).score).sum()
        };
        assert_eq!(paths[0], viterbi);
        for pair in paths.windows(2) {
            assert!(path_score(&pair[0]) >= path_score(&pair[1]) - 1e-6);
        }
        // Every path covers the whole sentence.
        for path in &paths {
            let total: u32 = path.iter().map(|&n| lattice.node(n).length).sum();
            assert_eq!(total, 3);
        }
    }

    #[test]
    fn marginal_matches_hand_computed_posteriors() {
        let mut lattice = Lattice::new();
        lattice.set_sentence("ab");
        insert_scored(&mut lattice, 0, 1, 0, -1.0);
        insert_scored(&mut lattice, 1, 1, 1, -2.0);
        insert_scored(&mut lattice, 0, 2, 2, -4.0);

        let mut expected = vec![0.0f32; 3];
        let z = lattice.populate_marginal(2.0, &mut expected);

        // Z = log(exp(-3) + exp(-4)); P(split) ≈ 0.731059, P(whole) ≈ 0.268941.
        let log_z = (-3.0f32).exp() + (-4.0f32).exp();
        let log_z = log_z.ln();
        assert!((z - 2.0 * log_z).abs() < 1e-4);
        assert!((expected[0] - 2.0 * 0.731_059).abs() < 1e-3);
        assert!((expected[1] - 2.0 * 0.731_059).abs() < 1e-3);
        assert!((expected[2] - 2.0 * 0.268_941).abs() < 1e-3);
    }

    #[test]
    fn sample_returns_a_valid_segmentation() {
        let mut lattice = Lattice::new();
        lattice.set_sentence("abc");
        insert_scored(&mut lattice, 0, 1, 0, -1.0);
        insert_scored(&mut lattice, 1, 1, 1, -1.0);
        insert_scored(&mut lattice, 2, 1, 2, -1.0);
        insert_scored(&mut lattice, 0, 3, 3, -2.0);

        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..16 {
            let path = lattice.sample(1.0, &mut rng);
            let total: u32 = path.iter().map(|&n| lattice.node(n).length).sum();
            assert_eq!(total, 3);
            let mut pos = 0u32;
            for &node in &path {
                assert_eq!(lattice.node(node).pos, pos);
                pos += lattice.node(node).length;
            }
        }
    }

    #[test]
    fn arena_is_reused_across_sentences() {
        let mut lattice = Lattice::new();
        lattice.set_sentence("abc");
        insert_scored(&mut lattice, 0, 1, 0, -1.0);
        let count = lattice.node_count();
        lattice.set_sentence("xy");
        assert!(lattice.node_count() < count + 2);
        assert_eq!(lattice.len(), 2);
    }
}
