//! Unigram trainer: seed bootstrap, EM shrinking loop, and finalization.

use std::path::Path;
use std::time::Instant;

use log::{info, warn};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{NormalizerConfig, TrainerConfig};
use crate::corpus::{self, Sentence};
use crate::error::{Result, UnipieceError};
use crate::lattice::Lattice;
use crate::metrics::{sample_rss_kb, EmIterationMetrics, TrainingMetrics};
use crate::model::UnigramModel;
use crate::normalizer::{Normalizer, PrefixMatcher, META_SPACE};
use crate::piece::{meta_pieces, Piece};
use crate::serialization::ModelData;
use crate::suffix::SuffixArray;

/// Sentinel separating sentences in the seed-stage symbol array.
const SENTENCE_BOUNDARY: u32 = 0;

/// Posterior mass below which the M-step drops a piece.
const EXPECTED_FREQUENCY_THRESHOLD: f32 = 0.5;

/// Per-injection penalty separating the scores of missing required chars.
const MIN_SCORE_PENALTY_DELTA: f32 = 1e-4;

/// A working vocabulary entry during training.
type ScoredPiece = (String, f32);

/// Digamma approximation: shift the argument above 7 with the recurrence
/// `Ψ(x) = Ψ(x + 1) − 1/x`, then apply the asymptotic expansion.
fn digamma(mut x: f64) -> f64 {
    let mut result = 0.0;
    while x < 7.0 {
        result -= 1.0 / x;
        x += 1.0;
    }
    x -= 0.5;
    let xx = 1.0 / x;
    let xx2 = xx * xx;
    let xx4 = xx2 * xx2;
    result += x.ln() + (1.0 / 24.0) * xx2 - (7.0 / 960.0) * xx4
        + (31.0 / 8064.0) * xx4 * xx2
        - (127.0 / 30720.0) * xx4 * xx4;
    result
}

/// Converts raw scores into log-probabilities in place.
fn to_log_prob(pieces: &mut [(String, f64)]) {
    let sum: f64 = pieces.iter().map(|(_, score)| score).sum();
    let logsum = sum.ln();
    for (_, score) in pieces.iter_mut() {
        *score = score.ln() - logsum;
    }
}

/// High-level facade configuring and executing unigram training runs.
#[derive(Debug, Clone)]
pub struct Trainer {
    cfg: TrainerConfig,
    normalizer_cfg: NormalizerConfig,
}

/// Artifacts returned after a training session completes.
#[must_use]
#[derive(Debug, Clone)]
pub struct TrainerArtifacts {
    /// Trained model ready for segmentation.
    pub model: UnigramModel,
    /// Serializable container mirroring the model.
    pub data: ModelData,
    /// Detailed metrics captured during training.
    pub metrics: TrainingMetrics,
}

impl Trainer {
    /// Creates a trainer with the default normalizer configuration.
    #[must_use]
    pub fn new(cfg: TrainerConfig) -> Self {
        Self {
            cfg,
            normalizer_cfg: NormalizerConfig::default(),
        }
    }

    /// Overrides the normalizer configuration.
    #[must_use]
    pub fn with_normalizer(mut self, normalizer_cfg: NormalizerConfig) -> Self {
        self.normalizer_cfg = normalizer_cfg;
        self
    }

    /// Returns an immutable reference to the underlying configuration.
    #[must_use]
    pub fn config(&self) -> &TrainerConfig {
        &self.cfg
    }

    /// Trains a model from text files, one sentence per line.
    pub fn train_from_paths<P: AsRef<Path>>(&self, inputs: &[P]) -> Result<TrainerArtifacts> {
        let normalizer = self.build_normalizer()?;
        let sentences = corpus::load_sentences(inputs, &normalizer)?;
        self.train(sentences)
    }

    /// Trains a model from in-memory raw sentences.
    pub fn train_from_sentences<S: AsRef<str>>(&self, raw: &[S]) -> Result<TrainerArtifacts> {
        let normalizer = self.build_normalizer()?;
        let sentences = corpus::from_raw_sentences(raw, &normalizer);
        self.train(sentences)
    }

    fn build_normalizer(&self) -> Result<Normalizer> {
        let mut normalizer = Normalizer::new(self.normalizer_cfg.clone())?;
        if !self.cfg.user_defined_symbols.is_empty() {
            normalizer
                .set_prefix_matcher(Some(PrefixMatcher::new(&self.cfg.user_defined_symbols)?));
        }
        Ok(normalizer)
    }

    fn train(&self, sentences: Vec<Sentence>) -> Result<TrainerArtifacts> {
        self.cfg.validate()?;
        if !self.normalizer_cfg.escape_whitespaces {
            return Err(UnipieceError::InvalidArgument(
                "unigram training requires escape_whitespaces".into(),
            ));
        }
        if sentences.is_empty() {
            return Err(UnipieceError::InvalidArgument(
                "training requires at least one non-empty sentence".into(),
            ));
        }

        let training_start = Instant::now();
        let required = corpus::required_chars(&sentences);
        if required.is_empty() {
            return Err(UnipieceError::InvalidArgument(
                "corpus contains no characters".into(),
            ));
        }

        let seed = self.make_seed_pieces(&sentences, &required)?;
        info!("initialized {} seed pieces", seed.len());

        let mut metrics = TrainingMetrics::new(64);
        metrics.seed_size = seed.len();

        let sentences = if self.cfg.split_by_whitespace {
            corpus::split_by_whitespace(&sentences, self.normalizer_cfg.treat_whitespace_as_suffix)
        } else {
            sentences
        };
        info!("using {} sentences for EM training", sentences.len());
        let total_weight = corpus::total_weight(&sentences) as f32;

        let desired_vocab_size = (self.cfg.vocab_size as f64 * 1.1) as usize;
        let mut pieces = seed;
        let mut model = UnigramModel::from_training_pieces(&pieces)?;
        let mut round = 0usize;

        loop {
            round += 1;
            for sub_iter in 0..self.cfg.num_sub_iterations {
                let iteration_start = Instant::now();
                let (expected, objective, num_tokens) =
                    self.run_e_step(&model, &sentences, total_weight)?;
                pieces = run_m_step(&pieces, &expected)?;
                model = UnigramModel::from_training_pieces(&pieces)?;

                if self.cfg.show_progress {
                    info!(
                        "EM sub_iter={} size={} obj={} num_tokens={} num_tokens/piece={:.4}",
                        sub_iter,
                        pieces.len(),
                        objective,
                        num_tokens,
                        num_tokens as f64 / pieces.len() as f64
                    );
                }
                metrics.iterations.push(EmIterationMetrics {
                    round,
                    sub_iteration: sub_iter,
                    vocab_size: pieces.len(),
                    objective,
                    num_tokens,
                    elapsed_iteration: iteration_start.elapsed(),
                    elapsed_total: training_start.elapsed(),
                    rss_kb: sample_rss_kb(),
                });
            }

            if pieces.len() <= desired_vocab_size {
                break;
            }
            pieces = self.prune_pieces(&model, &pieces, &sentences, desired_vocab_size)?;
            model = UnigramModel::from_training_pieces(&pieces)?;
            metrics.prune_rounds += 1;
        }

        let reserved: FxHashSet<String> = meta_pieces(&self.cfg)
            .iter()
            .map(|p| p.surface.clone())
            .collect();
        let final_pieces = self.finalize_pieces(&model, &pieces, &required, &reserved);

        let mut vocab = meta_pieces(&self.cfg);
        vocab.extend(
            final_pieces
                .into_iter()
                .map(|(surface, score)| Piece::normal(surface, score)),
        );
        let model = UnigramModel::new(vocab.clone())?;
        metrics.final_vocab_size = vocab.len();
        metrics.total_duration = training_start.elapsed();

        if self.cfg.show_progress {
            info!(
                "trained {} pieces in {:.2?}",
                vocab.len(),
                metrics.total_duration
            );
        }
        self.self_test(&model, &sentences);

        let data = ModelData {
            trainer_spec: self.cfg.clone(),
            normalizer_spec: self.normalizer_cfg.clone(),
            pieces: vocab,
        };
        Ok(TrainerArtifacts {
            model,
            data,
            metrics,
        })
    }

    /// Bootstraps the seed vocabulary from frequent substrings of the corpus.
    fn make_seed_pieces(
        &self,
        sentences: &[Sentence],
        required: &[(char, i64)],
    ) -> Result<Vec<ScoredPiece>> {
        // All sentences in one symbol array with sentinel separators.
        let mut array: Vec<u32> = Vec::new();
        for sentence in sentences {
            array.extend(sentence.text.chars().map(|c| c as u32));
            array.push(SENTENCE_BOUNDARY);
        }

        info!("making suffix array over {} symbols", array.len());
        let esa = SuffixArray::build(&array)?;
        let sa = esa.suffixes();

        info!("extracting frequent substrings");
        let mut substrings: Vec<(String, i64)> = Vec::new();
        for node in esa.internal_nodes() {
            let len = node.depth as usize;
            if len <= 1 {
                continue;
            }
            let offset = sa[node.left as usize] as usize;
            let span = &array[offset..offset + len];
            if span.contains(&SENTENCE_BOUNDARY) {
                continue;
            }
            let piece: String = span.iter().filter_map(|&c| char::from_u32(c)).collect();
            if !self.is_valid_piece(&piece) {
                continue;
            }
            let freq = i64::from(node.right - node.left);
            substrings.push((piece, freq * len as i64));
        }

        // Every observed character seeds the vocabulary, then substrings by
        // coverage score until the configured size is reached.
        let mut seed: Vec<(String, f64)> = required
            .iter()
            .map(|&(c, count)| (c.to_string(), count as f64))
            .collect();
        substrings.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (piece, score) in substrings {
            if seed.len() >= self.cfg.seed_piece_size {
                break;
            }
            seed.push((piece, score as f64));
        }
        to_log_prob(&mut seed);

        Ok(seed
            .into_iter()
            .map(|(surface, score)| (surface, score as f32))
            .collect())
    }

    /// Seed-piece validity: length bounds, whitespace placement, and the
    /// configured digit/script mixing policies.
    fn is_valid_piece(&self, piece: &str) -> bool {
        let chars: Vec<char> = piece.chars().collect();
        if chars.is_empty() || chars.len() > self.cfg.max_piece_length {
            return false;
        }
        if chars.contains(&'\u{0}') {
            return false;
        }
        if self.cfg.split_by_whitespace {
            let allowed_at = if self.normalizer_cfg.treat_whitespace_as_suffix {
                chars.len() - 1
            } else {
                0
            };
            for (i, &c) in chars.iter().enumerate() {
                if c == META_SPACE && i != allowed_at {
                    return false;
                }
            }
        }
        if self.cfg.split_by_number {
            let digits = chars.iter().filter(|c| c.is_numeric()).count();
            if digits > 0 && digits != chars.len() {
                return false;
            }
        }
        if self.cfg.split_by_unicode_script {
            let mut seen: Option<ScriptClass> = None;
            for &c in &chars {
                let class = script_class(c);
                if class == ScriptClass::Common {
                    continue;
                }
                match seen {
                    None => seen = Some(class),
                    Some(previous) if previous != class => return false,
                    Some(_) => {}
                }
            }
        }
        true
    }

    /// E-step: per-shard posterior counts reduced in shard order.
    fn run_e_step(
        &self,
        model: &UnigramModel,
        sentences: &[Sentence],
        total_weight: f32,
    ) -> Result<(Vec<f32>, f32, u64)> {
        let num_threads = self.cfg.num_threads.min(sentences.len()).max(1);
        let piece_count = model.len();

        let shards: Vec<Result<(Vec<f32>, f32, u64)>> = (0..num_threads)
            .into_par_iter()
            .map(|shard| {
                let mut expected = vec![0.0f32; piece_count];
                let mut objective = 0.0f32;
                let mut num_tokens = 0u64;
                let mut lattice = Lattice::new();
                for sentence in sentences.iter().skip(shard).step_by(num_threads) {
                    let freq = sentence.weight as f32;
                    lattice.set_sentence(&sentence.text);
                    model.populate_nodes(&mut lattice);
                    let z = lattice.populate_marginal(freq, &mut expected);
                    if z.is_nan() {
                        return Err(UnipieceError::Internal(
                            "likelihood is NaN; input sentence may be too long".into(),
                        ));
                    }
                    num_tokens += lattice.viterbi()?.len() as u64;
                    objective -= z / total_weight;
                }
                Ok((expected, objective, num_tokens))
            })
            .collect();

        let mut expected = vec![0.0f32; piece_count];
        let mut objective = 0.0f32;
        let mut num_tokens = 0u64;
        for shard in shards {
            let (shard_expected, shard_objective, shard_tokens) = shard?;
            for (total, value) in expected.iter_mut().zip(shard_expected) {
                *total += value;
            }
            objective += shard_objective;
            num_tokens += shard_tokens;
        }
        if objective.is_nan() {
            return Err(UnipieceError::Internal("objective is NaN".into()));
        }
        Ok((expected, objective, num_tokens))
    }

    /// Drops low-loss pieces until at most
    /// `max(desired, shrinking_factor · |V|)` remain.
    fn prune_pieces(
        &self,
        model: &UnigramModel,
        pieces: &[ScoredPiece],
        sentences: &[Sentence],
        desired_vocab_size: usize,
    ) -> Result<Vec<ScoredPiece>> {
        let piece_count = pieces.len();

        // How each piece re-segments once removed: the second-best path of
        // its own surface.
        let mut always_keep = vec![true; piece_count];
        let mut alternatives: Vec<Vec<usize>> = vec![Vec::new(); piece_count];
        let mut lattice = Lattice::new();
        for (i, (surface, _)) in pieces.iter().enumerate() {
            lattice.set_sentence(surface);
            model.populate_nodes(&mut lattice);
            let nbests = lattice.nbest(2)?;
            if nbests.len() == 1 {
                always_keep[i] = true;
            } else if nbests[0].len() >= 2 {
                // The Viterbi path already splits this piece.
                always_keep[i] = false;
            } else if nbests[0].len() == 1 {
                always_keep[i] = true;
                for &node in &nbests[1] {
                    let id = lattice.node(node).id;
                    if id >= 0 {
                        alternatives[i].push(id as usize);
                    }
                }
            }
        }

        // Viterbi-segment the corpus to collect per-piece frequencies and
        // the sentences each piece occurs in.
        let num_threads = self.cfg.num_threads.min(sentences.len()).max(1);
        type ShardResult = (f32, Vec<f32>, Vec<Vec<u32>>);
        let shards: Vec<Result<ShardResult>> = (0..num_threads)
            .into_par_iter()
            .map(|shard| {
                let mut vsum = 0.0f32;
                let mut freq = vec![0.0f32; piece_count];
                let mut inverted: Vec<Vec<u32>> = vec![Vec::new(); piece_count];
                let mut lattice = Lattice::new();
                for (i, sentence) in sentences
                    .iter()
                    .enumerate()
                    .skip(shard)
                    .step_by(num_threads)
                {
                    let weight = sentence.weight as f32;
                    vsum += weight;
                    lattice.set_sentence(&sentence.text);
                    model.populate_nodes(&mut lattice);
                    for node in lattice.viterbi()? {
                        let id = lattice.node(node).id;
                        if id >= 0 {
                            freq[id as usize] += weight;
                            inverted[id as usize].push(i as u32);
                        }
                    }
                }
                Ok((vsum, freq, inverted))
            })
            .collect();

        let mut vsum = 0.0f32;
        let mut freq = vec![0.0f32; piece_count];
        let mut inverted: Vec<Vec<u32>> = vec![Vec::new(); piece_count];
        for shard in shards {
            let (shard_vsum, shard_freq, shard_inverted) = shard?;
            vsum += shard_vsum;
            for (total, value) in freq.iter_mut().zip(shard_freq) {
                *total += value;
            }
            for (total, mut value) in inverted.iter_mut().zip(shard_inverted) {
                total.append(&mut value);
            }
        }

        let sum: f32 = freq.iter().sum();
        let logsum = sum.ln();
        let mut candidates: Vec<(usize, f32)> = Vec::new();
        let mut new_pieces: Vec<ScoredPiece> = Vec::with_capacity(desired_vocab_size);

        // Estimate the likelihood loss of removing each piece, assuming its
        // occurrences are re-segmented into the recorded alternatives.
        for i in 0..piece_count {
            if freq[i] == 0.0 || !always_keep[i] {
                continue;
            }
            if alternatives[i].is_empty() {
                new_pieces.push(pieces[i].clone());
                continue;
            }

            let mut occurrence_weight = 0.0f32;
            for &sentence_index in &inverted[i] {
                occurrence_weight += sentences[sentence_index as usize].weight as f32;
            }
            let f = occurrence_weight / vsum;

            let logprob_sp = freq[i].ln() - logsum;
            let logsum_alt = (sum + freq[i] * (alternatives[i].len() as f32 - 1.0)).ln();
            let mut logprob_alt = 0.0f32;
            for &alt in &alternatives[i] {
                logprob_alt += (freq[alt] + freq[i]).ln() - logsum_alt;
            }
            let loss = f * (logprob_sp - logprob_alt);
            candidates.push((i, loss));
        }

        let pruned_size = desired_vocab_size
            .max((self.cfg.shrinking_factor * piece_count as f64) as usize);
        candidates.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| pieces[a.0].0.cmp(&pieces[b.0].0))
        });
        for (index, _) in candidates {
            if new_pieces.len() == pruned_size {
                break;
            }
            new_pieces.push(pieces[index].clone());
        }

        info!("pruned vocabulary {} -> {}", piece_count, new_pieces.len());
        Ok(new_pieces)
    }

    /// Assembles the exact-size output: required characters first, then the
    /// highest scoring remaining pieces, emitted in score order.
    fn finalize_pieces(
        &self,
        model: &UnigramModel,
        pieces: &[ScoredPiece],
        required: &[(char, i64)],
        reserved: &FxHashSet<String>,
    ) -> Vec<ScoredPiece> {
        let slots = self.cfg.vocab_size - self.cfg.meta_piece_count();
        let scores: FxHashMap<&str, f32> = pieces
            .iter()
            .map(|(surface, score)| (surface.as_str(), *score))
            .collect();

        let mut finals: Vec<ScoredPiece> = Vec::with_capacity(slots);
        let mut chosen: FxHashSet<String> = FxHashSet::default();
        let mut min_score_penalty = 0.0f32;
        let mut buffer = [0u8; 4];
        for &(c, _) in required {
            if finals.len() == slots {
                break;
            }
            let surface = c.encode_utf8(&mut buffer);
            if reserved.contains(surface) {
                continue;
            }
            match scores.get(surface) {
                Some(&score) => finals.push((surface.to_string(), score)),
                None => {
                    // Missing required chars take the minimum score plus a
                    // growing penalty so frequent chars rank first.
                    finals.push((surface.to_string(), model.min_score() + min_score_penalty));
                    min_score_penalty += MIN_SCORE_PENALTY_DELTA;
                }
            }
            chosen.insert(surface.to_string());
        }

        let mut ranked: Vec<&ScoredPiece> = pieces.iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for piece in ranked {
            if finals.len() == slots {
                break;
            }
            if chosen.contains(piece.0.as_str()) || reserved.contains(&piece.0) {
                continue;
            }
            chosen.insert(piece.0.clone());
            finals.push(piece.clone());
        }

        finals.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        finals
    }

    /// Re-encodes a few training sentences and checks they round-trip.
    fn self_test(&self, model: &UnigramModel, sentences: &[Sentence]) {
        for sentence in sentences.iter().take(4) {
            let joined: String = model
                .encode(&sentence.text)
                .iter()
                .map(|p| p.surface.as_str())
                .collect();
            if joined == sentence.text {
                info!("self test ok: {}", sentence.text);
            } else {
                warn!(
                    "self test mismatch: {} segmented as {}",
                    sentence.text, joined
                );
            }
        }
    }
}

/// M-step: drop pieces below the posterior threshold and re-score the
/// survivors with Bayesian (Digamma) smoothing.
fn run_m_step(pieces: &[ScoredPiece], expected: &[f32]) -> Result<Vec<ScoredPiece>> {
    if pieces.len() != expected.len() {
        return Err(UnipieceError::Internal(format!(
            "expected counts size {} does not match vocabulary size {}",
            expected.len(),
            pieces.len()
        )));
    }

    let mut new_pieces: Vec<ScoredPiece> = Vec::with_capacity(pieces.len());
    let mut sum = 0.0f64;
    for (piece, &freq) in pieces.iter().zip(expected) {
        if freq < EXPECTED_FREQUENCY_THRESHOLD {
            continue;
        }
        new_pieces.push((piece.0.clone(), freq));
        sum += f64::from(freq);
    }
    if new_pieces.is_empty() {
        return Err(UnipieceError::Internal(
            "all pieces fell below the expected frequency threshold".into(),
        ));
    }

    let logsum = digamma(sum);
    for (_, score) in new_pieces.iter_mut() {
        *score = (digamma(f64::from(*score)) - logsum) as f32;
    }
    Ok(new_pieces)
}

/// Coarse Unicode script buckets; Han, Hiragana, and Katakana are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptClass {
    Common,
    Latin,
    Cyrillic,
    Greek,
    Arabic,
    Hebrew,
    Devanagari,
    Thai,
    Cjk,
    Hangul,
    Other(u32),
}

fn script_class(c: char) -> ScriptClass {
    let cp = c as u32;
    match cp {
        0x0041..=0x005A | 0x0061..=0x007A | 0x00C0..=0x024F => ScriptClass::Latin,
        0x0370..=0x03FF => ScriptClass::Greek,
        0x0400..=0x052F => ScriptClass::Cyrillic,
        0x0590..=0x05FF => ScriptClass::Hebrew,
        0x0600..=0x06FF | 0x0750..=0x077F => ScriptClass::Arabic,
        0x0900..=0x097F => ScriptClass::Devanagari,
        0x0E00..=0x0E7F => ScriptClass::Thai,
        // Kana and Han segment together in practice.
        0x3040..=0x30FF | 0x3400..=0x9FFF | 0xF900..=0xFAFF | 0x20000..=0x2FA1F => {
            ScriptClass::Cjk
        }
        0xAC00..=0xD7AF | 0x1100..=0x11FF => ScriptClass::Hangul,
        _ => {
            if c.is_alphabetic() {
                ScriptClass::Other(cp >> 8)
            } else {
                ScriptClass::Common
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainerConfig;

    fn pen_corpus() -> Vec<&'static str> {
        vec!["I have a pen", "I have an apple", "apple pen"]
    }

    fn trainer(vocab_size: usize) -> Trainer {
        let cfg = TrainerConfig {
            vocab_size,
            seed_piece_size: 200,
            num_threads: 2,
            show_progress: false,
            ..TrainerConfig::default()
        };
        Trainer::new(cfg)
    }

    #[test]
    fn digamma_matches_reference_values() {
        assert!((digamma(1.0) - (-0.577_215_664_9)).abs() < 1e-6);
        assert!((digamma(0.5) - (-1.963_510_026_0)).abs() < 1e-6);
        assert!((digamma(10.0) - 2.251_752_589_1).abs() < 1e-6);
    }

    #[test]
    fn to_log_prob_normalizes() {
        let mut pieces = vec![("a".to_string(), 1.0), ("b".to_string(), 3.0)];
        to_log_prob(&mut pieces);
        let total: f64 = pieces.iter().map(|(_, s)| s.exp()).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(pieces[1].1 > pieces[0].1);
    }

    #[test]
    fn m_step_drops_low_mass_and_stays_subnormalized() {
        let pieces = vec![
            ("a".to_string(), -1.0),
            ("b".to_string(), -1.0),
            ("c".to_string(), -1.0),
        ];
        let expected = vec![10.0, 4.0, 0.2];
        let new_pieces = run_m_step(&pieces, &expected).expect("m step");
        assert_eq!(new_pieces.len(), 2);
        // Digamma smoothing keeps Σ exp(score) at or below one.
        let total: f32 = new_pieces.iter().map(|(_, s)| s.exp()).sum();
        assert!(total <= 1.0 + 1e-4);
        assert!(new_pieces[0].1 > new_pieces[1].1);
    }

    #[test]
    fn seed_pieces_contain_chars_and_frequent_substrings() {
        let trainer = trainer(20);
        let normalizer = trainer.build_normalizer().expect("normalizer");
        let sentences = corpus::from_raw_sentences(&pen_corpus(), &normalizer);
        let required = corpus::required_chars(&sentences);
        let seed = trainer
            .make_seed_pieces(&sentences, &required)
            .expect("seed");

        // Every observed character is present.
        for (c, _) in &required {
            assert!(seed.iter().any(|(s, _)| s == &c.to_string()));
        }
        // "pple" repeats (apple twice) and mixes no scripts.
        assert!(seed.iter().any(|(s, _)| s == "pple"));
        // Scores are log-probabilities of a proper distribution.
        let total: f64 = seed.iter().map(|(_, s)| f64::from(*s).exp()).sum();
        assert!((total - 1.0).abs() < 1e-4);
        // No piece carries an interior meta space.
        assert!(seed
            .iter()
            .all(|(s, _)| !s.chars().skip(1).any(|c| c == META_SPACE)));
    }

    #[test]
    fn validity_predicate_enforces_policies() {
        let trainer = trainer(20);
        assert!(trainer.is_valid_piece("▁apple"));
        assert!(trainer.is_valid_piece("apple"));
        assert!(!trainer.is_valid_piece(""));
        assert!(!trainer.is_valid_piece("ap▁ple"));
        assert!(!trainer.is_valid_piece("abc1"));
        assert!(trainer.is_valid_piece("123"));
        assert!(!trainer.is_valid_piece("abcあ"));
        assert!(trainer.is_valid_piece("日本語"));
        assert!(!trainer.is_valid_piece(&"x".repeat(17)));
    }

    #[test]
    fn finalizer_reproduces_character_frequencies() {
        let trainer = trainer(100);
        let normalizer = trainer.build_normalizer().expect("normalizer");
        let sentences = corpus::from_raw_sentences(&pen_corpus(), &normalizer);
        let required = corpus::required_chars(&sentences);

        // A character-only model scored by relative frequency.
        let mut pieces: Vec<(String, f64)> = required
            .iter()
            .map(|&(c, count)| (c.to_string(), count as f64))
            .collect();
        to_log_prob(&mut pieces);
        let pieces: Vec<ScoredPiece> = pieces
            .into_iter()
            .map(|(surface, score)| (surface, score as f32))
            .collect();
        let model = UnigramModel::from_training_pieces(&pieces).expect("model");

        let reserved = FxHashSet::default();
        let finals = trainer.finalize_pieces(&model, &pieces, &required, &reserved);
        let surfaces: Vec<&str> = finals.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(surfaces, vec!["▁", "a", "e", "p", "n", "I", "h", "l", "v"]);

        // A tiny target keeps only the most frequent required chars.
        let tiny = trainer_with_vocab(5);
        let finals = tiny.finalize_pieces(&model, &pieces, &required, &reserved);
        let surfaces: Vec<&str> = finals.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(surfaces, vec!["▁", "a"]);
    }

    fn trainer_with_vocab(vocab_size: usize) -> Trainer {
        let cfg = TrainerConfig {
            vocab_size,
            seed_piece_size: 200,
            num_threads: 1,
            show_progress: false,
            ..TrainerConfig::default()
        };
        Trainer::new(cfg)
    }

    #[test]
    fn end_to_end_training_round_trips() {
        let trainer = trainer(18);
        let artifacts = trainer
            .train_from_sentences(&pen_corpus())
            .expect("training succeeds");
        let model = &artifacts.model;

        assert!(model.len() <= 18);
        assert_eq!(artifacts.metrics.final_vocab_size, model.len());
        assert!(!artifacts.metrics.iterations.is_empty());

        // Every required character survived, so encoding round-trips.
        let normalizer = trainer.build_normalizer().expect("normalizer");
        for raw in pen_corpus() {
            let normalized = normalizer.normalize(raw);
            let pieces = model.encode(&normalized);
            let joined: String = pieces.iter().map(|p| p.surface.as_str()).collect();
            assert_eq!(joined, normalized);
            let ids: Vec<u32> = pieces.iter().map(|p| p.id).collect();
            assert_eq!(model.decode(&ids, " ⁇ "), raw.trim());
        }

        // Vocabulary invariants: dense unique surfaces, exactly one UNK.
        let mut surfaces: Vec<&str> =
            model.pieces().iter().map(|p| p.surface.as_str()).collect();
        surfaces.sort_unstable();
        let before = surfaces.len();
        surfaces.dedup();
        assert_eq!(before, surfaces.len());
        assert_eq!(model.unk_id(), Some(0));
    }

    #[test]
    fn e_step_is_deterministic_for_a_fixed_thread_count() {
        let trainer = trainer(18);
        let normalizer = trainer.build_normalizer().expect("normalizer");
        let sentences = corpus::from_raw_sentences(&pen_corpus(), &normalizer);
        let required = corpus::required_chars(&sentences);
        let seed = trainer
            .make_seed_pieces(&sentences, &required)
            .expect("seed");
        let model = UnigramModel::from_training_pieces(&seed).expect("model");
        let total = corpus::total_weight(&sentences) as f32;

        let first = trainer
            .run_e_step(&model, &sentences, total)
            .expect("e step");
        let second = trainer
            .run_e_step(&model, &sentences, total)
            .expect("e step");
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
        assert_eq!(first.2, second.2);
    }

    #[test]
    fn pruning_respects_the_retention_floor() {
        let trainer = trainer(18);
        let normalizer = trainer.build_normalizer().expect("normalizer");
        let sentences = corpus::from_raw_sentences(&pen_corpus(), &normalizer);
        let required = corpus::required_chars(&sentences);
        let seed = trainer
            .make_seed_pieces(&sentences, &required)
            .expect("seed");
        let model = UnigramModel::from_training_pieces(&seed).expect("model");
        let words =
            corpus::split_by_whitespace(&sentences, false);

        let desired = 10;
        let pruned = trainer
            .prune_pieces(&model, &seed, &words, desired)
            .expect("pruning");
        assert!(!pruned.is_empty());
        assert!(pruned.len() <= seed.len());
        // Pruning only ever removes pieces; every survivor came from the seed.
        let seed_surfaces: FxHashSet<&str> = seed.iter().map(|(s, _)| s.as_str()).collect();
        assert!(pruned.iter().all(|(s, _)| seed_surfaces.contains(s.as_str())));
        // Survivor surfaces stay unique.
        let unique: FxHashSet<&str> = pruned.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(unique.len(), pruned.len());
    }
}
