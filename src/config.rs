//! Configuration records controlling training and normalization.

use serde::{Deserialize, Serialize};

use crate::error::{Result, UnipieceError};

/// Configuration for unigram model training.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainerConfig {
    /// Target vocabulary size including meta pieces.
    pub vocab_size: usize,
    /// Size of the seed vocabulary bootstrapped from the suffix array.
    pub seed_piece_size: usize,
    /// Number of EM sub-iterations executed between pruning rounds.
    pub num_sub_iterations: usize,
    /// Minimum retention ratio applied by each pruning round.
    pub shrinking_factor: f64,
    /// Number of worker shards used by the E-step and pruning re-segmentation.
    pub num_threads: usize,
    /// Maximum piece length in Unicode scalars.
    pub max_piece_length: usize,
    /// Rejects seed pieces mixing distinct Unicode scripts.
    pub split_by_unicode_script: bool,
    /// Rejects seed pieces mixing digits and non-digits.
    pub split_by_number: bool,
    /// Splits training sentences into whitespace-delimited words before EM.
    pub split_by_whitespace: bool,
    /// Surface of the unknown piece.
    pub unk_piece: String,
    /// Surface of the begin-of-sentence piece.
    pub bos_piece: String,
    /// Surface of the end-of-sentence piece.
    pub eos_piece: String,
    /// Surface of the padding piece; empty disables the PAD meta piece.
    pub pad_piece: String,
    /// Visible substitution emitted when decoding the unknown piece.
    pub unk_surface: String,
    /// Surfaces always segmented as single pieces, protected during training.
    pub user_defined_symbols: Vec<String>,
    /// Additional control surfaces reserved next to BOS/EOS/PAD.
    pub control_symbols: Vec<String>,
    /// Enables per-iteration logging through the `log` facade.
    pub show_progress: bool,
}

impl TrainerConfig {
    /// Returns a builder initialised with [`TrainerConfig::default`].
    #[must_use]
    pub fn builder() -> TrainerBuilder {
        TrainerBuilder::default()
    }

    /// Number of meta pieces reserved at the head of the vocabulary.
    #[must_use]
    pub fn meta_piece_count(&self) -> usize {
        // UNK/BOS/EOS always exist; PAD only when a surface is configured.
        3 + usize::from(!self.pad_piece.is_empty())
            + self.control_symbols.len()
            + self.user_defined_symbols.len()
    }

    /// Validates the invariants required for training.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size <= self.meta_piece_count() {
            return Err(UnipieceError::InvalidArgument(format!(
                "vocab_size ({}) must exceed the {} reserved meta pieces",
                self.vocab_size,
                self.meta_piece_count()
            )));
        }
        if self.seed_piece_size < self.vocab_size {
            return Err(UnipieceError::InvalidArgument(format!(
                "seed_piece_size ({}) must be at least vocab_size ({})",
                self.seed_piece_size, self.vocab_size
            )));
        }
        if self.num_sub_iterations == 0 {
            return Err(UnipieceError::InvalidArgument(
                "num_sub_iterations must be greater than zero".into(),
            ));
        }
        if !(self.shrinking_factor > 0.0 && self.shrinking_factor <= 1.0) {
            return Err(UnipieceError::InvalidArgument(format!(
                "shrinking_factor ({}) must be in (0, 1]",
                self.shrinking_factor
            )));
        }
        if self.num_threads == 0 {
            return Err(UnipieceError::InvalidArgument(
                "num_threads must be greater than zero".into(),
            ));
        }
        if self.max_piece_length == 0 {
            return Err(UnipieceError::InvalidArgument(
                "max_piece_length must be greater than zero".into(),
            ));
        }
        if self.unk_piece.is_empty() {
            return Err(UnipieceError::InvalidArgument(
                "unk_piece must not be empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            vocab_size: 8000,
            seed_piece_size: 1_000_000,
            num_sub_iterations: 2,
            shrinking_factor: 0.75,
            num_threads: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            max_piece_length: 16,
            split_by_unicode_script: true,
            split_by_number: true,
            split_by_whitespace: true,
            unk_piece: "<unk>".into(),
            bos_piece: "<s>".into(),
            eos_piece: "</s>".into(),
            pad_piece: String::new(),
            unk_surface: " \u{2047} ".into(),
            user_defined_symbols: Vec::new(),
            control_symbols: Vec::new(),
            show_progress: true,
        }
    }
}

/// Builder for [`TrainerConfig`].
#[derive(Debug, Default, Clone)]
pub struct TrainerBuilder {
    cfg: TrainerConfig,
}

impl TrainerBuilder {
    /// Creates a builder with [`TrainerConfig::default`] settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target vocabulary size.
    #[must_use]
    pub fn vocab_size(mut self, value: usize) -> Self {
        self.cfg.vocab_size = value;
        self
    }

    /// Sets the seed vocabulary size.
    #[must_use]
    pub fn seed_piece_size(mut self, value: usize) -> Self {
        self.cfg.seed_piece_size = value;
        self
    }

    /// Sets the number of EM sub-iterations per pruning round.
    #[must_use]
    pub fn num_sub_iterations(mut self, value: usize) -> Self {
        self.cfg.num_sub_iterations = value;
        self
    }

    /// Sets the pruning retention ratio.
    #[must_use]
    pub fn shrinking_factor(mut self, value: f64) -> Self {
        self.cfg.shrinking_factor = value;
        self
    }

    /// Sets the worker shard count.
    #[must_use]
    pub fn num_threads(mut self, value: usize) -> Self {
        self.cfg.num_threads = value;
        self
    }

    /// Sets the maximum piece length in Unicode scalars.
    #[must_use]
    pub fn max_piece_length(mut self, value: usize) -> Self {
        self.cfg.max_piece_length = value;
        self
    }

    /// Enables or disables script-mixing rejection for seed pieces.
    #[must_use]
    pub fn split_by_unicode_script(mut self, enabled: bool) -> Self {
        self.cfg.split_by_unicode_script = enabled;
        self
    }

    /// Enables or disables digit-mixing rejection for seed pieces.
    #[must_use]
    pub fn split_by_number(mut self, enabled: bool) -> Self {
        self.cfg.split_by_number = enabled;
        self
    }

    /// Enables or disables whitespace splitting of the training corpus.
    #[must_use]
    pub fn split_by_whitespace(mut self, enabled: bool) -> Self {
        self.cfg.split_by_whitespace = enabled;
        self
    }

    /// Overrides the user-defined symbol inventory.
    #[must_use]
    pub fn user_defined_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cfg.user_defined_symbols = symbols.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Overrides the control symbol inventory.
    #[must_use]
    pub fn control_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cfg.control_symbols = symbols.into_iter().map(|s| s.into()).collect();
        self
    }

    /// Enables the PAD meta piece with the given surface.
    #[must_use]
    pub fn pad_piece<S: Into<String>>(mut self, surface: S) -> Self {
        self.cfg.pad_piece = surface.into();
        self
    }

    /// Enables or disables per-iteration logging.
    #[must_use]
    pub fn show_progress(mut self, enabled: bool) -> Self {
        self.cfg.show_progress = enabled;
        self
    }

    /// Finalises the builder, returning a validated [`TrainerConfig`].
    pub fn build(self) -> Result<TrainerConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

/// Configuration for the text normalizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizerConfig {
    /// Name of the chars-map rule set (`nmt_nfkc` or `identity`).
    pub name: String,
    /// Prepends one meta space to the normalized output.
    pub add_dummy_prefix: bool,
    /// Collapses consecutive spaces and strips leading/trailing ones.
    pub remove_extra_whitespaces: bool,
    /// Replaces whitespace with the meta space symbol U+2581.
    pub escape_whitespaces: bool,
    /// Attaches whitespace boundaries to the preceding word.
    pub treat_whitespace_as_suffix: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            name: "nmt_nfkc".into(),
            add_dummy_prefix: true,
            remove_extra_whitespaces: true,
            escape_whitespaces: true,
            treat_whitespace_as_suffix: false,
        }
    }
}

impl NormalizerConfig {
    /// Returns the identity rule set with all other options unchanged.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            name: "identity".into(),
            ..Self::default()
        }
    }
}
