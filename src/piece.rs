//! Vocabulary pieces and the reserved meta-piece inventory.

use serde::{Deserialize, Serialize};

use crate::config::TrainerConfig;

/// Classification of a vocabulary piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceKind {
    /// A learned piece scored by the unigram model.
    Normal,
    /// A caller-supplied surface that always wins segmentation.
    UserDefined,
    /// A reserved symbol carrying no surface in the text (BOS/EOS/PAD).
    Control,
    /// The single out-of-vocabulary fallback piece.
    Unknown,
    /// A piece kept in the vocabulary but excluded from segmentation.
    Unused,
}

/// An immutable vocabulary entry; its position in the vocabulary is its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Piece {
    /// Piece surface in UTF-8 bytes.
    pub surface: String,
    /// Unigram log-probability.
    pub score: f32,
    /// Piece classification.
    pub kind: PieceKind,
}

impl Piece {
    /// Creates a NORMAL piece.
    #[must_use]
    pub fn normal<S: Into<String>>(surface: S, score: f32) -> Self {
        Self {
            surface: surface.into(),
            score,
            kind: PieceKind::Normal,
        }
    }

    /// Creates a USER_DEFINED piece.
    #[must_use]
    pub fn user_defined<S: Into<String>>(surface: S) -> Self {
        Self {
            surface: surface.into(),
            score: 0.0,
            kind: PieceKind::UserDefined,
        }
    }

    /// Creates a CONTROL piece.
    #[must_use]
    pub fn control<S: Into<String>>(surface: S) -> Self {
        Self {
            surface: surface.into(),
            score: 0.0,
            kind: PieceKind::Control,
        }
    }

    /// Creates the UNKNOWN piece.
    #[must_use]
    pub fn unknown<S: Into<String>>(surface: S) -> Self {
        Self {
            surface: surface.into(),
            score: 0.0,
            kind: PieceKind::Unknown,
        }
    }
}

/// Builds the reserved meta pieces occupying the head of the vocabulary.
///
/// Order: UNK, BOS, EOS, PAD (when configured), control symbols, then
/// user-defined symbols. Ids are dense from zero by position.
#[must_use]
pub fn meta_pieces(cfg: &TrainerConfig) -> Vec<Piece> {
    let mut pieces = Vec::with_capacity(cfg.meta_piece_count());
    pieces.push(Piece::unknown(&cfg.unk_piece));
    pieces.push(Piece::control(&cfg.bos_piece));
    pieces.push(Piece::control(&cfg.eos_piece));
    if !cfg.pad_piece.is_empty() {
        pieces.push(Piece::control(&cfg.pad_piece));
    }
    for symbol in &cfg.control_symbols {
        pieces.push(Piece::control(symbol));
    }
    for symbol in &cfg.user_defined_symbols {
        pieces.push(Piece::user_defined(symbol));
    }
    pieces
}
