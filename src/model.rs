//! Unigram model: piece index and lattice-based segmentation.

use ahash::AHashMap;
use log::warn;
use rand::Rng;

use crate::error::{Result, UnipieceError};
use crate::lattice::Lattice;
use crate::normalizer::META_SPACE_STR;
use crate::piece::{Piece, PieceKind};
use crate::trie::Trie;

/// Penalty subtracted from the minimum piece score to build the UNK score.
pub const UNK_PENALTY: f32 = 10.0;

/// One emitted piece of a segmentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentedPiece {
    /// Surface text covered by the piece.
    pub surface: String,
    /// Vocabulary id.
    pub id: u32,
}

/// A segmentation together with its summed log-score.
pub type ScoredSegmentation = (Vec<SegmentedPiece>, f32);

/// Post-processing options applied by the encode/decode facade, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraOption {
    /// Reverse the piece sequence.
    Reverse,
    /// Prepend the BOS piece.
    Bos,
    /// Append the EOS piece.
    Eos,
}

/// Parses a colon-separated extra-options string such as `bos:eos`.
pub fn parse_extra_options(spec: &str) -> Result<Vec<ExtraOption>> {
    spec.split(':')
        .filter(|token| !token.is_empty())
        .map(|token| match token {
            "reverse" => Ok(ExtraOption::Reverse),
            "bos" => Ok(ExtraOption::Bos),
            "eos" => Ok(ExtraOption::Eos),
            other => Err(UnipieceError::InvalidArgument(format!(
                "unknown extra option `{other}`"
            ))),
        })
        .collect()
}

/// Parses decode-side extra options; only `reverse` is meaningful there.
pub fn parse_decode_extra_options(spec: &str) -> Result<Vec<ExtraOption>> {
    let options = parse_extra_options(spec)?;
    if options.iter().any(|o| !matches!(o, ExtraOption::Reverse)) {
        return Err(UnipieceError::InvalidArgument(
            "decode accepts only the `reverse` extra option".into(),
        ));
    }
    Ok(options)
}

/// A trained unigram vocabulary with its segmentation index.
#[derive(Debug, Clone)]
pub struct UnigramModel {
    pieces: Vec<Piece>,
    reserved: AHashMap<String, u32>,
    trie: Trie,
    trie_results_size: usize,
    unk_id: Option<u32>,
    min_score: f32,
    max_score: f32,
}

impl UnigramModel {
    /// Builds the segmentation index over a finished vocabulary.
    ///
    /// Surfaces must be unique and non-empty, and exactly one piece must be
    /// of kind UNKNOWN.
    pub fn new(pieces: Vec<Piece>) -> Result<Self> {
        let model = Self::build(pieces)?;
        if model.unk_id.is_none() {
            return Err(UnipieceError::Internal("unk is not defined".into()));
        }
        Ok(model)
    }

    /// Builds a trainer-internal model over scored working pieces.
    ///
    /// All pieces are NORMAL and there is no UNK; synthetic coverage nodes
    /// inserted by [`UnigramModel::populate_nodes`] carry id `-1` and are
    /// ignored by marginals and Viterbi counts.
    pub(crate) fn from_training_pieces(working: &[(String, f32)]) -> Result<Self> {
        let pieces = working
            .iter()
            .map(|(surface, score)| Piece::normal(surface.clone(), *score))
            .collect();
        Self::build(pieces)
    }

    fn build(pieces: Vec<Piece>) -> Result<Self> {
        if pieces.is_empty() {
            return Err(UnipieceError::Internal("no pieces are loaded".into()));
        }

        let mut reserved = AHashMap::new();
        let mut entries: Vec<(&str, u32)> = Vec::new();
        let mut unk_id = None;
        let mut min_score = f32::MAX;
        let mut max_score = f32::MIN;

        for (i, piece) in pieces.iter().enumerate() {
            let id = i as u32;
            if piece.surface.is_empty() {
                return Err(UnipieceError::Internal("piece must not be empty".into()));
            }
            match piece.kind {
                PieceKind::Normal | PieceKind::UserDefined | PieceKind::Unused => {
                    entries.push((piece.surface.as_str(), id));
                }
                PieceKind::Control | PieceKind::Unknown => {
                    if reserved.insert(piece.surface.clone(), id).is_some() {
                        return Err(UnipieceError::Internal(format!(
                            "{} is already defined",
                            piece.surface
                        )));
                    }
                }
            }
            if piece.kind == PieceKind::Unknown {
                if unk_id.is_some() {
                    return Err(UnipieceError::Internal("unk is already defined".into()));
                }
                unk_id = Some(id);
            }
            if piece.kind == PieceKind::Normal {
                min_score = min_score.min(piece.score);
                max_score = max_score.max(piece.score);
            }
        }
        if min_score == f32::MAX {
            min_score = 0.0;
            max_score = 0.0;
        }

        if entries.is_empty() {
            return Err(UnipieceError::Internal(
                "vocabulary has no searchable pieces".into(),
            ));
        }
        let trie = Trie::build(&entries)?;

        let mut results = Vec::new();
        let mut trie_results_size = 0;
        for (surface, _) in &entries {
            trie.common_prefix_search(surface.as_bytes(), &mut results);
            trie_results_size = trie_results_size.max(results.len());
        }
        if trie_results_size == 0 {
            return Err(UnipieceError::Internal(
                "no entry is found in the trie".into(),
            ));
        }

        Ok(Self {
            pieces,
            reserved,
            trie,
            trie_results_size,
            unk_id,
            min_score,
            max_score,
        })
    }

    /// The vocabulary in id order.
    #[must_use]
    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Vocabulary size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    /// Returns `true` for an empty vocabulary (never constructed).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Minimum score over NORMAL pieces.
    #[must_use]
    pub fn min_score(&self) -> f32 {
        self.min_score
    }

    /// Maximum score over NORMAL pieces.
    #[must_use]
    pub fn max_score(&self) -> f32 {
        self.max_score
    }

    /// Id of the UNKNOWN piece, absent only on trainer-internal models.
    #[must_use]
    pub fn unk_id(&self) -> Option<u32> {
        self.unk_id
    }

    /// Largest number of prefix matches any vocabulary surface produces.
    #[must_use]
    pub fn trie_results_size(&self) -> usize {
        self.trie_results_size
    }

    /// Maps a surface to its id; unknown or UNUSED surfaces map to UNK.
    ///
    /// Reserved (CONTROL/UNKNOWN) surfaces shadow textual collisions.
    #[must_use]
    pub fn piece_to_id(&self, piece: &str) -> u32 {
        if let Some(&id) = self.reserved.get(piece) {
            return id;
        }
        let fallback = self.unk_id.unwrap_or_default();
        match self.trie.exact_match(piece.as_bytes()) {
            Some(id) if self.pieces[id as usize].kind != PieceKind::Unused => id,
            _ => fallback,
        }
    }

    /// Returns the surface of `id`.
    pub fn id_to_piece(&self, id: u32) -> Result<&str> {
        self.pieces
            .get(id as usize)
            .map(|p| p.surface.as_str())
            .ok_or(UnipieceError::OutOfRange {
                id: id as usize,
                vocab_size: self.pieces.len(),
            })
    }

    /// Returns the score of `id`.
    pub fn get_score(&self, id: u32) -> Result<f32> {
        self.pieces
            .get(id as usize)
            .map(|p| p.score)
            .ok_or(UnipieceError::OutOfRange {
                id: id as usize,
                vocab_size: self.pieces.len(),
            })
    }

    /// Returns `true` when `id` is the UNKNOWN piece.
    #[must_use]
    pub fn is_unknown(&self, id: u32) -> bool {
        self.kind_of(id) == Some(PieceKind::Unknown)
    }

    /// Returns `true` when `id` is a CONTROL piece.
    #[must_use]
    pub fn is_control(&self, id: u32) -> bool {
        self.kind_of(id) == Some(PieceKind::Control)
    }

    /// Returns `true` when `id` is an UNUSED piece.
    #[must_use]
    pub fn is_unused(&self, id: u32) -> bool {
        self.kind_of(id) == Some(PieceKind::Unused)
    }

    /// Returns `true` when `id` is a USER_DEFINED piece.
    #[must_use]
    pub fn is_user_defined(&self, id: u32) -> bool {
        self.kind_of(id) == Some(PieceKind::UserDefined)
    }

    fn kind_of(&self, id: u32) -> Option<PieceKind> {
        self.pieces.get(id as usize).map(|p| p.kind)
    }

    /// Enumerates vocabulary surfaces that prefix `text` as `(byte_len, id)`.
    pub fn common_prefix_search(&self, text: &str, results: &mut Vec<(usize, u32)>) {
        self.trie.common_prefix_search(text.as_bytes(), results);
    }

    /// Inserts every candidate piece of the sentence into the lattice.
    ///
    /// Positions with no single-character piece receive a synthetic UNK node
    /// so the lattice always stays connected.
    pub fn populate_nodes(&self, lattice: &mut Lattice) {
        let unk_score = self.min_score - UNK_PENALTY;
        let unk_lattice_id = self.unk_id.map_or(-1, |id| id as i32);
        let len = lattice.len();
        let mut trie_results: Vec<(usize, u32)> =
            Vec::with_capacity(self.trie_results_size + 1);

        for begin_pos in 0..len {
            self.trie
                .common_prefix_search(lattice.surface(begin_pos).as_bytes(), &mut trie_results);

            let mut has_single_node = false;
            for k in 0..trie_results.len() {
                let (byte_len, id) = trie_results[k];
                if self.is_unused(id) {
                    continue;
                }
                let length = lattice.surface(begin_pos)[..byte_len].chars().count();
                let score = if self.is_user_defined(id) {
                    // User-defined symbols receive a bonus so they always win.
                    length as f32 * self.max_score + 1.0
                } else {
                    self.pieces[id as usize].score
                };
                let node = lattice.insert(begin_pos, length);
                let entry = lattice.node_mut(node);
                entry.id = id as i32;
                entry.score = score;
                if !has_single_node && length == 1 {
                    has_single_node = true;
                }
            }

            if !has_single_node {
                let node = lattice.insert(begin_pos, 1);
                let entry = lattice.node_mut(node);
                entry.id = unk_lattice_id;
                entry.score = unk_score;
            }
        }
    }

    /// Segments a normalized string with Viterbi decoding.
    #[must_use]
    pub fn encode(&self, normalized: &str) -> Vec<SegmentedPiece> {
        if normalized.is_empty() {
            return Vec::new();
        }
        let mut lattice = Lattice::new();
        lattice.set_sentence(normalized);
        self.populate_nodes(&mut lattice);
        let path = match lattice.viterbi() {
            Ok(path) => path,
            Err(err) => {
                warn!("viterbi failed on populated lattice: {err}");
                return Vec::new();
            }
        };
        path.into_iter()
            .map(|node| self.emit(&lattice, node))
            .collect()
    }

    /// Returns up to `nbest_size` segmentations with their summed scores.
    ///
    /// `nbest_size` is clamped to `[1, 1024]`.
    #[must_use]
    pub fn nbest_encode(&self, normalized: &str, nbest_size: usize) -> Vec<ScoredSegmentation> {
        if normalized.is_empty() {
            return vec![(Vec::new(), 0.0)];
        }
        let nbest_size = nbest_size.clamp(1, 1024);
        let mut lattice = Lattice::new();
        lattice.set_sentence(normalized);
        self.populate_nodes(&mut lattice);
        let paths = match lattice.nbest(nbest_size) {
            Ok(paths) => paths,
            Err(err) => {
                warn!("nbest failed on populated lattice: {err}");
                return Vec::new();
            }
        };
        paths
            .into_iter()
            .map(|path| {
                let score = path.iter().map(|&n| lattice.node(n).score).sum();
                let pieces = path.into_iter().map(|node| self.emit(&lattice, node)).collect();
                (pieces, score)
            })
            .collect()
    }

    /// Draws one segmentation from the `theta`-scaled unigram distribution.
    #[must_use]
    pub fn sample_encode<R: Rng + ?Sized>(
        &self,
        normalized: &str,
        theta: f32,
        rng: &mut R,
    ) -> Vec<SegmentedPiece> {
        if normalized.is_empty() {
            return Vec::new();
        }
        let mut lattice = Lattice::new();
        lattice.set_sentence(normalized);
        self.populate_nodes(&mut lattice);
        lattice
            .sample(theta, rng)
            .into_iter()
            .map(|node| self.emit(&lattice, node))
            .collect()
    }

    fn emit(&self, lattice: &Lattice, node: crate::lattice::NodeRef) -> SegmentedPiece {
        let entry = lattice.node(node);
        let id = if entry.id < 0 {
            self.unk_id.unwrap_or_default()
        } else {
            entry.id as u32
        };
        SegmentedPiece {
            surface: lattice.piece(node).to_string(),
            id,
        }
    }

    /// Applies encode-side extra options to a finished segmentation.
    pub fn apply_extra_options(
        &self,
        pieces: &mut Vec<SegmentedPiece>,
        options: &[ExtraOption],
        bos_id: u32,
        eos_id: u32,
    ) -> Result<()> {
        for option in options {
            match option {
                ExtraOption::Reverse => pieces.reverse(),
                ExtraOption::Bos => pieces.insert(
                    0,
                    SegmentedPiece {
                        surface: self.id_to_piece(bos_id)?.to_string(),
                        id: bos_id,
                    },
                ),
                ExtraOption::Eos => pieces.push(SegmentedPiece {
                    surface: self.id_to_piece(eos_id)?.to_string(),
                    id: eos_id,
                }),
            }
        }
        Ok(())
    }

    /// Reconstructs text from ids: CONTROL ids vanish, UNK renders
    /// `unk_surface`, out-of-range ids are elided with a warning, the meta
    /// space becomes a real space and the dummy prefix is removed.
    #[must_use]
    pub fn decode(&self, ids: &[u32], unk_surface: &str) -> String {
        let mut joined = String::new();
        for &id in ids {
            match self.pieces.get(id as usize) {
                None => warn!("decode skipping out-of-range id {id}"),
                Some(piece) => match piece.kind {
                    PieceKind::Control => {}
                    PieceKind::Unknown => joined.push_str(unk_surface),
                    _ => joined.push_str(&piece.surface),
                },
            }
        }
        let detokenized = joined.replace(META_SPACE_STR, " ");
        detokenized
            .strip_prefix(' ')
            .map_or(detokenized.clone(), ToOwned::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::Piece;

    fn word_model() -> UnigramModel {
        UnigramModel::new(vec![
            Piece::unknown("<unk>"),
            Piece::control("<s>"),
            Piece::control("</s>"),
            Piece::normal("▁hello", -1.0),
            Piece::normal("▁world", -2.0),
        ])
        .expect("valid model")
    }

    fn char_model_with_user_defined() -> UnigramModel {
        UnigramModel::new(vec![
            Piece::unknown("<unk>"),
            Piece::control("<s>"),
            Piece::control("</s>"),
            Piece::normal("▁", -1.0),
            Piece::normal("a", -1.5),
            Piece::normal("b", -1.5),
            Piece::normal("c", -1.5),
            Piece::normal("d", -1.5),
            Piece::user_defined("ABC"),
        ])
        .expect("valid model")
    }

    #[test]
    fn word_level_encode_emits_known_pieces_in_order() {
        let model = word_model();
        let pieces = model.encode("▁hello▁world");
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0], SegmentedPiece { surface: "▁hello".into(), id: 3 });
        assert_eq!(pieces[1], SegmentedPiece { surface: "▁world".into(), id: 4 });
    }

    #[test]
    fn unknown_words_fall_back_to_unk_with_surfaces_preserved() {
        let model = word_model();
        let pieces = model.encode("▁hello▁abc");
        assert_eq!(pieces[0].id, 3);
        let tail: String = pieces[1..].iter().map(|p| p.surface.as_str()).collect();
        assert_eq!(tail, "▁abc");
        assert!(pieces[1..].iter().all(|p| p.id == 0));
    }

    #[test]
    fn user_defined_pieces_always_win() {
        let model = char_model_with_user_defined();
        let pieces = model.encode("▁abABCcd");
        let surfaces: Vec<&str> = pieces.iter().map(|p| p.surface.as_str()).collect();
        assert_eq!(surfaces, vec!["▁", "a", "b", "ABC", "c", "d"]);
    }

    #[test]
    fn lattice_stays_connected_for_sparse_vocabularies() {
        let model = word_model();
        let mut lattice = crate::lattice::Lattice::new();
        lattice.set_sentence("zzz▁helloz");
        model.populate_nodes(&mut lattice);
        for pos in 0..lattice.len() {
            assert!(!lattice.begin_nodes(pos).is_empty(), "position {pos} uncovered");
        }
        assert!(lattice.viterbi().is_ok());
    }

    #[test]
    fn piece_id_round_trip_on_non_reserved_pieces() {
        let model = char_model_with_user_defined();
        for id in 3..model.len() as u32 {
            let surface = model.id_to_piece(id).expect("in range");
            assert_eq!(model.piece_to_id(surface), id);
        }
        assert_eq!(model.piece_to_id("zz"), 0);
        assert!(model.is_unknown(model.piece_to_id("zz")));
    }

    #[test]
    fn reserved_surfaces_shadow_the_trie() {
        let model = word_model();
        assert_eq!(model.piece_to_id("<s>"), 1);
        assert!(model.is_control(1));
        assert!(!model.is_control(3));
        assert!(!model.is_user_defined(3));
    }

    #[test]
    fn unused_pieces_are_skipped_in_search_and_lookup() {
        let model = UnigramModel::new(vec![
            Piece::unknown("<unk>"),
            Piece::normal("a", -1.0),
            Piece {
                surface: "ab".into(),
                score: -0.1,
                kind: crate::piece::PieceKind::Unused,
            },
            Piece::normal("b", -1.0),
        ])
        .expect("valid model");
        assert_eq!(model.piece_to_id("ab"), 0);
        let pieces = model.encode("ab");
        let surfaces: Vec<&str> = pieces.iter().map(|p| p.surface.as_str()).collect();
        assert_eq!(surfaces, vec!["a", "b"]);
    }

    #[test]
    fn duplicate_surfaces_are_rejected() {
        let err = UnigramModel::new(vec![
            Piece::unknown("<unk>"),
            Piece::normal("a", -1.0),
            Piece::normal("a", -2.0),
        ])
        .expect_err("duplicates must fail");
        assert!(matches!(err, UnipieceError::Internal(_)));
    }

    #[test]
    fn missing_unk_is_rejected() {
        let err = UnigramModel::new(vec![Piece::normal("a", -1.0)])
            .expect_err("missing unk must fail");
        assert!(matches!(err, UnipieceError::Internal(_)));
    }

    #[test]
    fn nbest_scores_are_non_increasing_and_first_is_viterbi() {
        let model = char_model_with_user_defined();
        let nbest = model.nbest_encode("▁abcd", 5);
        assert!(!nbest.is_empty());
        let viterbi = model.encode("▁abcd");
        assert_eq!(nbest[0].0, viterbi);
        for pair in nbest.windows(2) {
            assert!(pair[0].1 >= pair[1].1 - 1e-6);
        }
    }

    #[test]
    fn nbest_clamps_and_handles_empty_input() {
        let model = word_model();
        assert_eq!(model.nbest_encode("", 3), vec![(Vec::new(), 0.0)]);
        let nbest = model.nbest_encode("▁hello", 0);
        assert_eq!(nbest.len(), 1);
    }

    #[test]
    fn sample_encode_covers_the_input() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;
        let model = char_model_with_user_defined();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..8 {
            let pieces = model.sample_encode("▁abcd", 1.0, &mut rng);
            let joined: String = pieces.iter().map(|p| p.surface.as_str()).collect();
            assert_eq!(joined, "▁abcd");
        }
    }

    #[test]
    fn extra_options_apply_in_sequence() {
        let model = word_model();
        let bos = model.piece_to_id("<s>");
        let eos = model.piece_to_id("</s>");

        let mut pieces = model.encode("▁hello▁world");
        let options = parse_extra_options("bos:eos").expect("valid options");
        model
            .apply_extra_options(&mut pieces, &options, bos, eos)
            .expect("in-range ids");
        assert_eq!(pieces.first().map(|p| p.id), Some(bos));
        assert_eq!(pieces.last().map(|p| p.id), Some(eos));

        let mut pieces = model.encode("▁hello▁world");
        let options = parse_extra_options("reverse").expect("valid options");
        model
            .apply_extra_options(&mut pieces, &options, bos, eos)
            .expect("in-range ids");
        assert_eq!(pieces[0].surface, "▁world");

        assert!(parse_extra_options("bos:mystery").is_err());
        assert!(parse_decode_extra_options("bos").is_err());
        assert!(parse_decode_extra_options("reverse").is_ok());
    }

    #[test]
    fn decode_round_trips_and_elides_bad_ids() {
        let model = word_model();
        let pieces = model.encode("▁hello▁world");
        let ids: Vec<u32> = pieces.iter().map(|p| p.id).collect();
        assert_eq!(model.decode(&ids, " ⁇ "), "hello world");

        // Control ids vanish, out-of-range ids are skipped, UNK renders.
        assert_eq!(model.decode(&[1, 3, 99, 0], " ⁇ "), "hello ⁇ ");
    }
}
