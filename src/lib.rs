//! Unigram language-model subword tokenization: training library and CLI.
//!
//! The crate learns a fixed-size vocabulary of sub-word pieces from a raw
//! text corpus and segments strings into pieces (and back) at serving time.
//! Training bootstraps a large seed vocabulary from a suffix array over the
//! corpus, then shrinks it with EM plus loss-based pruning; segmentation
//! runs Viterbi (or N-best / sampling) over a lattice of piece candidates.
//!
//! ```no_run
//! use unipiece::{Trainer, TrainerConfig};
//!
//! # fn main() -> unipiece::Result<()> {
//! let cfg = TrainerConfig::builder()
//!     .vocab_size(8000)
//!     .show_progress(false)
//!     .build()?;
//! let trainer = Trainer::new(cfg);
//! let artifacts = trainer.train_from_paths(&["/path/to/corpus.txt"])?;
//! artifacts.data.save("unipiece.model.json", false)?;
//! let pieces = artifacts.model.encode(&artifacts.data.normalizer()?.normalize("hello world"));
//! # let _ = pieces;
//! # Ok(())
//! # }
//! ```
//!
//! The CLI is enabled by default through the `cli` feature. Users targeting
//! the library portion only can disable default features:
//! `unipiece = { version = "...", default-features = false }`.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    clippy::all,
    rust_2018_idioms,
    future_incompatible,
    unused_lifetimes,
    unreachable_pub
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    clippy::multiple_crate_versions
)]

pub mod charsmap;
pub mod config;
pub mod corpus;
pub mod error;
pub mod lattice;
pub mod metrics;
pub mod model;
pub mod normalizer;
pub mod piece;
pub mod serialization;
pub mod suffix;
pub mod trainer;
pub mod trie;

pub use config::{NormalizerConfig, TrainerBuilder, TrainerConfig};
pub use error::{Result, UnipieceError};
pub use metrics::{EmIterationMetrics, TrainingMetrics};
pub use model::{ExtraOption, SegmentedPiece, UnigramModel};
pub use normalizer::{Normalizer, META_SPACE};
pub use piece::{Piece, PieceKind};
pub use serialization::ModelData;
pub use trainer::{Trainer, TrainerArtifacts};
