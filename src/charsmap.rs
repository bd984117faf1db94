//! Character replacement maps driving the normalizer.
//!
//! A [`CharsMap`] is an ordered set of `source → target` byte-string rules.
//! Compiling one produces a longest-match trie plus a single `"\0"`-joined
//! target buffer, the same shape as the precompiled tables the serialized
//! blob format carries: `u32 trie_size (LE) | trie bytes | target bytes`.

use std::sync::OnceLock;

use rustc_hash::FxHashMap;
use unicode_normalization::UnicodeNormalization;

use crate::error::{Result, UnipieceError};
use crate::trie::Trie;

/// String-to-string replacement rules applied with leftmost longest matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharsMap {
    rules: Vec<(String, String)>,
}

impl CharsMap {
    /// An empty rule set: every character passes through unchanged.
    #[must_use]
    pub fn identity() -> Self {
        Self::default()
    }

    /// Creates a map from explicit replacement rules.
    #[must_use]
    pub fn from_rules<I, S, T>(rules: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            rules: rules
                .into_iter()
                .map(|(src, dst)| (src.into(), dst.into()))
                .collect(),
        }
    }

    /// The built-in NFKC-approximating rule set.
    ///
    /// Each Unicode scalar whose NFKC form differs from itself maps to that
    /// form. Multi-character canonical reordering is not modelled; the map is
    /// a per-scalar approximation applied with longest-match replacement.
    #[must_use]
    pub fn nmt_nfkc() -> Self {
        let mut rules = Vec::new();
        for c in (0u32..=0x10FFFF).filter_map(char::from_u32) {
            let mapped: String = std::iter::once(c).nfkc().collect();
            if mapped.chars().ne(std::iter::once(c)) {
                rules.push((c.to_string(), mapped));
            }
        }
        Self { rules }
    }

    /// Returns the rules as `(source, target)` pairs.
    #[must_use]
    pub fn rules(&self) -> &[(String, String)] {
        &self.rules
    }

    /// Compiles the rules into the longest-match form used by the normalizer.
    pub fn compile(&self) -> Result<CompiledCharsMap> {
        let mut targets: Vec<u8> = Vec::new();
        let mut offsets: FxHashMap<&str, u32> = FxHashMap::default();
        let mut entries: Vec<(&[u8], u32)> = Vec::with_capacity(self.rules.len());
        for (source, target) in &self.rules {
            if source.is_empty() {
                return Err(UnipieceError::InvalidArgument(
                    "chars map rule with empty source".into(),
                ));
            }
            let offset = *offsets.entry(target.as_str()).or_insert_with(|| {
                let at = targets.len() as u32;
                targets.extend_from_slice(target.as_bytes());
                targets.push(0);
                at
            });
            entries.push((source.as_bytes(), offset));
        }
        let trie = Trie::build(&entries)?;
        Ok(CompiledCharsMap { trie, targets })
    }
}

/// Compiled longest-match replacement table.
#[derive(Debug, Clone, Default)]
pub struct CompiledCharsMap {
    trie: Trie,
    targets: Vec<u8>,
}

impl CompiledCharsMap {
    /// Resolves a rule set by its registered name.
    ///
    /// `nmt_nfkc` is compiled once per process and reused; `identity` is an
    /// empty table. Unknown names are rejected.
    pub fn by_name(name: &str) -> Result<Self> {
        match name {
            "identity" => Ok(Self::default()),
            "nmt_nfkc" => {
                static NFKC: OnceLock<CompiledCharsMap> = OnceLock::new();
                Ok(NFKC
                    .get_or_init(|| {
                        CharsMap::nmt_nfkc()
                            .compile()
                            .expect("built-in NFKC chars map must compile")
                    })
                    .clone())
            }
            other => Err(UnipieceError::InvalidArgument(format!(
                "unknown chars map name `{other}`"
            ))),
        }
    }

    /// Returns `true` when the table holds no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    /// Finds the longest rule source that is a prefix of `text`.
    ///
    /// Returns the consumed byte length and the replacement bytes.
    #[must_use]
    pub fn longest_match<'a>(&'a self, text: &[u8]) -> Option<(usize, &'a [u8])> {
        let (len, offset) = self.trie.longest_match(text)?;
        let start = offset as usize;
        if start > self.targets.len() {
            return None;
        }
        let end = self.targets[start..]
            .iter()
            .position(|&b| b == 0)
            .map_or(self.targets.len(), |i| start + i);
        Some((len, &self.targets[start..end]))
    }

    /// Encodes the table into the self-describing binary blob format.
    #[must_use]
    pub fn to_blob(&self) -> Vec<u8> {
        let trie_bytes = self.trie.to_bytes();
        let mut blob = Vec::with_capacity(4 + trie_bytes.len() + self.targets.len());
        blob.extend_from_slice(&(trie_bytes.len() as u32).to_le_bytes());
        blob.extend_from_slice(&trie_bytes);
        blob.extend_from_slice(&self.targets);
        blob
    }

    /// Decodes a blob produced by [`CompiledCharsMap::to_blob`].
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        if blob.len() < 4 {
            return Err(UnipieceError::DataLoss(
                "chars map blob shorter than its header".into(),
            ));
        }
        let trie_size = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
        let rest = &blob[4..];
        if rest.len() < trie_size {
            return Err(UnipieceError::DataLoss(format!(
                "chars map blob declares trie of {trie_size} bytes but only {} remain",
                rest.len()
            )));
        }
        let trie = Trie::from_bytes(&rest[..trie_size])?;
        Ok(Self {
            trie,
            targets: rest[trie_size..].to_vec(),
        })
    }
}
