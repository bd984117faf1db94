//! Self-describing JSON model container.
//!
//! The container carries the trainer hyperparameters, the normalizer spec,
//! and the pieces in id order; readers reject unknown piece kinds and
//! malformed documents outright, and writers always emit dense ids by
//! position.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{NormalizerConfig, TrainerConfig};
use crate::error::{Result, UnipieceError};
use crate::model::UnigramModel;
use crate::normalizer::{Normalizer, PrefixMatcher};
use crate::piece::{Piece, PieceKind};

/// A trained model as persisted on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelData {
    /// Hyperparameters the model was trained with.
    pub trainer_spec: TrainerConfig,
    /// Normalization options and chars-map name.
    pub normalizer_spec: NormalizerConfig,
    /// Vocabulary in id order.
    pub pieces: Vec<Piece>,
}

impl ModelData {
    /// Serialises the container to JSON.
    pub fn to_json(&self, pretty: bool) -> Result<String> {
        if pretty {
            Ok(serde_json::to_string_pretty(self)?)
        } else {
            Ok(serde_json::to_string(self)?)
        }
    }

    /// Parses a container, rejecting malformed documents and unknown kinds.
    pub fn from_json(json: &str) -> Result<Self> {
        let data: Self = serde_json::from_str(json)?;
        if data.pieces.is_empty() {
            return Err(UnipieceError::DataLoss(
                "model container holds no pieces".into(),
            ));
        }
        Ok(data)
    }

    /// Writes the container to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P, pretty: bool) -> Result<()> {
        let json = self.to_json(pretty)?;
        fs::write(path.as_ref(), json)
            .map_err(|err| UnipieceError::io(err, Some(path.as_ref().to_path_buf())))
    }

    /// Reads a container from `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())
            .map_err(|err| UnipieceError::io(err, Some(path.as_ref().to_path_buf())))?;
        Self::from_json(&json)
    }

    /// Builds the segmentation model from the stored pieces.
    pub fn segmenter(&self) -> Result<UnigramModel> {
        UnigramModel::new(self.pieces.clone())
    }

    /// Builds the normalizer, protecting stored USER_DEFINED surfaces.
    pub fn normalizer(&self) -> Result<Normalizer> {
        let mut normalizer = Normalizer::new(self.normalizer_spec.clone())?;
        let user_defined: Vec<&str> = self
            .pieces
            .iter()
            .filter(|p| p.kind == PieceKind::UserDefined)
            .map(|p| p.surface.as_str())
            .collect();
        if !user_defined.is_empty() {
            normalizer.set_prefix_matcher(Some(PrefixMatcher::new(&user_defined)?));
        }
        Ok(normalizer)
    }

    /// Renders the vocabulary as `surface\tscore` lines in id order.
    #[must_use]
    pub fn vocab_tsv(&self) -> String {
        let mut out = String::new();
        for piece in &self.pieces {
            let _ = writeln!(out, "{}\t{}", piece.surface, piece.score);
        }
        out
    }

    /// Writes the vocabulary TSV to `path`.
    pub fn save_vocab<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path.as_ref(), self.vocab_tsv())
            .map_err(|err| UnipieceError::io(err, Some(path.as_ref().to_path_buf())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_data() -> ModelData {
        ModelData {
            trainer_spec: TrainerConfig {
                vocab_size: 6,
                seed_piece_size: 100,
                show_progress: false,
                ..TrainerConfig::default()
            },
            normalizer_spec: NormalizerConfig::default(),
            pieces: vec![
                Piece::unknown("<unk>"),
                Piece::control("<s>"),
                Piece::control("</s>"),
                Piece::normal("▁", -1.5),
                Piece::normal("ab", -2.25),
            ],
        }
    }

    #[test]
    fn json_round_trip() {
        let data = sample_data();
        let json = data.to_json(true).expect("serialize");
        let restored = ModelData::from_json(&json).expect("deserialize");
        assert_eq!(restored, data);
    }

    #[test]
    fn save_and_load() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("model.json");
        let data = sample_data();
        data.save(&path, false).expect("save");
        let restored = ModelData::load(&path).expect("load");
        assert_eq!(restored, data);
        assert!(restored.segmenter().is_ok());
        assert!(restored.normalizer().is_ok());
    }

    #[test]
    fn unknown_piece_kind_is_data_loss() {
        let json = sample_data().to_json(false).expect("serialize");
        let json = json.replace("\"normal\"", "\"mystery\"");
        assert!(matches!(
            ModelData::from_json(&json),
            Err(UnipieceError::DataLoss(_))
        ));
    }

    #[test]
    fn empty_container_is_rejected() {
        let mut data = sample_data();
        data.pieces.clear();
        let json = data.to_json(false).expect("serialize");
        assert!(matches!(
            ModelData::from_json(&json),
            Err(UnipieceError::DataLoss(_))
        ));
    }

    #[test]
    fn vocab_tsv_lists_pieces_in_id_order() {
        let tsv = sample_data().vocab_tsv();
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "<unk>\t0");
        assert_eq!(lines[3], "▁\t-1.5");
        assert_eq!(lines[4], "ab\t-2.25");
    }
}
