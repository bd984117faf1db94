//! Facilities for loading training sentences and corpus statistics.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use walkdir::WalkDir;

use crate::error::{Result, UnipieceError};
use crate::normalizer::{Normalizer, META_SPACE};

/// A normalized training sentence with its occurrence weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    /// Normalized text.
    pub text: String,
    /// Occurrence count.
    pub weight: i64,
}

impl Sentence {
    /// Creates a sentence with weight one.
    #[must_use]
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            weight: 1,
        }
    }
}

/// Discovers files rooted at the provided input paths.
///
/// Directories are traversed recursively in a deterministic order.
pub fn collect_paths<P: AsRef<Path>>(inputs: &[P]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        let path = input.as_ref();
        if !path.exists() {
            return Err(UnipieceError::InvalidArgument(format!(
                "input path {path:?} does not exist"
            )));
        }
        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry.map_err(|err| UnipieceError::Internal(err.to_string()))?;
                if entry.file_type().is_file() {
                    files.push(entry.path().to_path_buf());
                }
            }
        } else {
            files.push(path.to_path_buf());
        }
    }
    if files.is_empty() {
        return Err(UnipieceError::InvalidArgument(
            "no files discovered in provided inputs".into(),
        ));
    }
    Ok(files)
}

/// Loads one sentence per input line, normalized; empty lines are dropped.
pub fn load_sentences<P: AsRef<Path>>(
    inputs: &[P],
    normalizer: &Normalizer,
) -> Result<Vec<Sentence>> {
    let mut sentences = Vec::new();
    for path in collect_paths(inputs)? {
        let file = File::open(&path).map_err(|err| UnipieceError::io(err, Some(path.clone())))?;
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(|err| UnipieceError::io(err, Some(path.clone())))?;
            if read == 0 {
                break;
            }
            while line.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
                line.pop();
            }
            let (normalized, _) = normalizer.normalize_with_offsets(&line);
            if !normalized.is_empty() {
                sentences.push(Sentence::new(normalized));
            }
        }
    }
    if sentences.is_empty() {
        return Err(UnipieceError::InvalidArgument(
            "no sentences could be loaded from inputs".into(),
        ));
    }
    Ok(sentences)
}

/// Normalizes in-memory raw sentences; empty results are dropped.
#[must_use]
pub fn from_raw_sentences<S: AsRef<str>>(raw: &[S], normalizer: &Normalizer) -> Vec<Sentence> {
    raw.iter()
        .filter_map(|line| {
            let normalized = normalizer.normalize(line.as_ref());
            (!normalized.is_empty()).then(|| Sentence::new(normalized))
        })
        .collect()
}

/// Sum of sentence weights.
#[must_use]
pub fn total_weight(sentences: &[Sentence]) -> i64 {
    sentences.iter().map(|s| s.weight).sum()
}

/// Weight-aware character counts, most frequent first (ties by scalar).
#[must_use]
pub fn required_chars(sentences: &[Sentence]) -> Vec<(char, i64)> {
    let mut counts: FxHashMap<char, i64> = FxHashMap::default();
    for sentence in sentences {
        for c in sentence.text.chars() {
            if c != '\u{0}' {
                *counts.entry(c).or_insert(0) += sentence.weight;
            }
        }
    }
    let mut chars: Vec<(char, i64)> = counts.into_iter().collect();
    chars.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    chars
}

/// Splits sentences into whitespace-delimited words with summed weights.
///
/// Word boundaries sit before each meta space (after it in suffix mode), so
/// `▁I▁saw` becomes the words `▁I` and `▁saw`.
#[must_use]
pub fn split_by_whitespace(sentences: &[Sentence], treat_whitespace_as_suffix: bool) -> Vec<Sentence> {
    let mut counts: FxHashMap<String, i64> = FxHashMap::default();
    for sentence in sentences {
        for word in split_into_words(&sentence.text, treat_whitespace_as_suffix) {
            if !word.is_empty() {
                *counts.entry(word.to_string()).or_insert(0) += sentence.weight;
            }
        }
    }
    let mut words: Vec<(String, i64)> = counts.into_iter().collect();
    words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    words
        .into_iter()
        .map(|(text, weight)| Sentence { text, weight })
        .collect()
}

fn split_into_words(text: &str, treat_whitespace_as_suffix: bool) -> Vec<&str> {
    let mut words = Vec::new();
    let mut start = 0usize;
    if treat_whitespace_as_suffix {
        for (offset, c) in text.char_indices() {
            if c == META_SPACE {
                let end = offset + c.len_utf8();
                words.push(&text[start..end]);
                start = end;
            }
        }
        if start < text.len() {
            words.push(&text[start..]);
        }
    } else {
        for (offset, c) in text.char_indices() {
            if c == META_SPACE && offset > start {
                words.push(&text[start..offset]);
                start = offset;
            }
        }
        if start < text.len() {
            words.push(&text[start..]);
        }
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormalizerConfig;
    use std::fs;
    use tempfile::tempdir;

    fn normalizer() -> Normalizer {
        Normalizer::new(NormalizerConfig::default()).expect("builtin chars map")
    }

    #[test]
    fn load_sentences_normalizes_lines() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("corpus.txt");
        fs::write(&file, "hello world\n\n  spaced  \n").expect("write corpus");
        let sentences = load_sentences(&[&file], &normalizer()).expect("load");
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0].text, "▁hello▁world");
        assert_eq!(sentences[1].text, "▁spaced");
    }

    #[test]
    fn collect_paths_walks_directories_deterministically() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("b.txt"), "b\n").expect("write b");
        fs::write(dir.path().join("a.txt"), "a\n").expect("write a");
        let paths = collect_paths(&[dir.path()]).expect("collect");
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("a.txt"));
    }

    #[test]
    fn missing_input_is_an_error() {
        let err = collect_paths(&[Path::new("/definitely/not/here")])
            .expect_err("missing path must fail");
        assert!(matches!(err, UnipieceError::InvalidArgument(_)));
    }

    #[test]
    fn required_chars_are_weighted_and_ordered() {
        let sentences = vec![
            Sentence { text: "▁ab".into(), weight: 2 },
            Sentence { text: "▁b".into(), weight: 1 },
        ];
        let chars = required_chars(&sentences);
        // Ties order by scalar value: 'b' (U+0062) precedes '▁' (U+2581).
        assert_eq!(chars[0], ('b', 3));
        assert_eq!(chars[1], ('▁', 3));
        assert_eq!(chars[2], ('a', 2));
    }

    #[test]
    fn whitespace_split_aggregates_word_weights() {
        let sentences = vec![
            Sentence { text: "▁hello▁world".into(), weight: 1 },
            Sentence { text: "▁hello".into(), weight: 2 },
        ];
        let words = split_by_whitespace(&sentences, false);
        assert_eq!(words[0], Sentence { text: "▁hello".into(), weight: 3 });
        assert_eq!(words[1], Sentence { text: "▁world".into(), weight: 1 });
    }

    #[test]
    fn suffix_mode_splits_after_the_meta_space() {
        let sentences = vec![Sentence { text: "I▁saw▁".into(), weight: 1 }];
        let words = split_by_whitespace(&sentences, true);
        let texts: Vec<&str> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["I▁", "saw▁"]);
    }
}
