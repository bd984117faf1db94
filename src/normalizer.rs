//! Deterministic text normalization driven by a longest-match chars map.

use bstr::decode_utf8;

use crate::charsmap::CompiledCharsMap;
use crate::config::NormalizerConfig;
use crate::error::Result;
use crate::trie::Trie;

/// Meta space symbol standing in for whitespace boundaries (U+2581).
pub const META_SPACE: char = '\u{2581}';
/// UTF-8 form of [`META_SPACE`].
pub const META_SPACE_STR: &str = "\u{2581}";

/// Canonicalizes raw input into the model's internal representation.
///
/// Normalization applies, in order: user-defined surface pass-through,
/// longest-match chars-map replacement (one UTF-8 scalar of pass-through on a
/// miss, U+FFFD for invalid bytes), whitespace escaping, duplicate-whitespace
/// removal, and the dummy whitespace prefix. Every output byte is attributed
/// to the first input byte of the span that produced it.
#[derive(Debug, Clone)]
pub struct Normalizer {
    cfg: NormalizerConfig,
    charsmap: CompiledCharsMap,
    matcher: Option<PrefixMatcher>,
}

impl Normalizer {
    /// Creates a normalizer, resolving the chars map named by the config.
    pub fn new(cfg: NormalizerConfig) -> Result<Self> {
        let charsmap = CompiledCharsMap::by_name(&cfg.name)?;
        Ok(Self::from_parts(cfg, charsmap))
    }

    /// Creates a normalizer from an already compiled chars map.
    #[must_use]
    pub fn from_parts(cfg: NormalizerConfig, charsmap: CompiledCharsMap) -> Self {
        Self {
            cfg,
            charsmap,
            matcher: None,
        }
    }

    /// Installs a matcher whose surfaces bypass normalization untouched.
    pub fn set_prefix_matcher(&mut self, matcher: Option<PrefixMatcher>) {
        self.matcher = matcher;
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &NormalizerConfig {
        &self.cfg
    }

    /// Normalizes `input`, returning only the normalized text.
    #[must_use]
    pub fn normalize(&self, input: &str) -> String {
        self.normalize_with_offsets(input.as_bytes()).0
    }

    /// Normalizes `input` and reports the normalized-to-original byte map.
    ///
    /// `n2o[i]` is the input byte offset that produced normalized byte `i`;
    /// the final entry equals `input.len()`.
    #[must_use]
    pub fn normalize_with_offsets(&self, input: &[u8]) -> (String, Vec<usize>) {
        if input.is_empty() {
            return (String::new(), vec![0]);
        }

        let space = if self.cfg.escape_whitespaces {
            META_SPACE
        } else {
            ' '
        };

        // One entry per output scalar, tagged with its origin byte.
        let mut chars: Vec<(char, usize)> = Vec::with_capacity(input.len());
        let mut pos = 0usize;
        while pos < input.len() {
            let rest = &input[pos..];

            if let Some(matcher) = &self.matcher {
                let (len, found) = matcher.prefix_match(rest);
                if found {
                    let mut span = &rest[..len];
                    while !span.is_empty() {
                        let (decoded, size) = decode_utf8(span);
                        chars.push((decoded.unwrap_or('\u{FFFD}'), pos));
                        span = &span[size.max(1)..];
                    }
                    pos += len;
                    continue;
                }
            }

            if let Some((len, target)) = self.charsmap.longest_match(rest) {
                let mut span = target;
                while !span.is_empty() {
                    let (decoded, size) = decode_utf8(span);
                    let c = decoded.unwrap_or('\u{FFFD}');
                    chars.push((self.escape_char(c, space), pos));
                    span = &span[size.max(1)..];
                }
                pos += len;
                continue;
            }

            let (decoded, size) = decode_utf8(rest);
            let c = decoded.unwrap_or('\u{FFFD}');
            chars.push((self.escape_char(c, space), pos));
            pos += size.max(1);
        }

        if self.cfg.remove_extra_whitespaces {
            let mut collapsed = Vec::with_capacity(chars.len());
            let mut prev_space = false;
            for (c, origin) in chars {
                let is_space = c == space;
                if !(is_space && prev_space) {
                    collapsed.push((c, origin));
                }
                prev_space = is_space;
            }
            while collapsed.first().is_some_and(|&(c, _)| c == space) {
                collapsed.remove(0);
            }
            while collapsed.last().is_some_and(|&(c, _)| c == space) {
                collapsed.pop();
            }
            chars = collapsed;
        }

        if self.cfg.add_dummy_prefix {
            if self.cfg.treat_whitespace_as_suffix {
                chars.push((space, input.len()));
            } else {
                chars.insert(0, (space, 0));
            }
        }

        let mut normalized = String::with_capacity(chars.len());
        let mut n2o = Vec::with_capacity(chars.len() + 1);
        for (c, origin) in chars {
            normalized.push(c);
            for _ in 0..c.len_utf8() {
                n2o.push(origin);
            }
        }
        n2o.push(input.len());
        (normalized, n2o)
    }

    fn escape_char(&self, c: char, space: char) -> char {
        if self.cfg.escape_whitespaces && c.is_whitespace() {
            space
        } else {
            c
        }
    }
}

/// Longest-prefix matcher over a fixed set of surfaces.
#[derive(Debug, Clone, Default)]
pub struct PrefixMatcher {
    trie: Option<Trie>,
}

impl PrefixMatcher {
    /// Builds a matcher from the given surfaces; duplicates are ignored.
    pub fn new<S: AsRef<str>>(surfaces: &[S]) -> Result<Self> {
        let mut keys: Vec<&str> = surfaces
            .iter()
            .map(AsRef::as_ref)
            .filter(|s| !s.is_empty())
            .collect();
        keys.sort_unstable();
        keys.dedup();
        if keys.is_empty() {
            return Ok(Self { trie: None });
        }
        let entries: Vec<(&str, u32)> = keys.into_iter().map(|k| (k, 0)).collect();
        Ok(Self {
            trie: Some(Trie::build(&entries)?),
        })
    }

    /// Finds the longest surface that is a prefix of `text`.
    ///
    /// Returns its UTF-8 byte length with `found = true`, or the length of a
    /// single scalar with `found = false` when nothing matches.
    #[must_use]
    pub fn prefix_match(&self, text: &[u8]) -> (usize, bool) {
        if text.is_empty() {
            return (0, false);
        }
        if let Some(trie) = &self.trie {
            if let Some((len, _)) = trie.longest_match(text) {
                return (len, true);
            }
        }
        let (_, size) = decode_utf8(text);
        (size.max(1), false)
    }

    /// Replaces every matched surface in `text` with `out`.
    #[must_use]
    pub fn global_replace(&self, text: &str, out: &str) -> String {
        let bytes = text.as_bytes();
        let mut result = String::with_capacity(text.len());
        let mut pos = 0usize;
        while pos < bytes.len() {
            let (len, found) = self.prefix_match(&bytes[pos..]);
            if found {
                result.push_str(out);
            } else {
                let (decoded, _) = decode_utf8(&bytes[pos..]);
                result.push(decoded.unwrap_or('\u{FFFD}'));
            }
            pos += len;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charsmap::CharsMap;
    use crate::config::NormalizerConfig;

    fn default_normalizer() -> Normalizer {
        Normalizer::new(NormalizerConfig::default()).expect("builtin chars map")
    }

    #[test]
    fn nfkc_like_replacements() {
        let normalizer = default_normalizer();
        assert_eq!(normalizer.normalize("①②③"), "▁123");
        assert_eq!(normalizer.normalize("㍿"), "▁株式会社");
    }

    #[test]
    fn whitespace_runs_collapse_with_offsets() {
        let normalizer = default_normalizer();
        let input = " I   saw a\u{3000} \u{3000}girl\u{3000}\u{3000}";
        let (normalized, n2o) = normalizer.normalize_with_offsets(input.as_bytes());
        assert_eq!(normalized, "▁I▁saw▁a▁girl");
        // Byte offset of `g` in the output maps back to its input position.
        let g_at = normalized.find('g').expect("g is present");
        assert_eq!(n2o[g_at], 17);
        assert_eq!(*n2o.last().expect("final entry"), input.len());
    }

    #[test]
    fn offset_map_is_monotone_and_bounded() {
        let normalizer = default_normalizer();
        let input = "  ab　c  ";
        let (normalized, n2o) = normalizer.normalize_with_offsets(input.as_bytes());
        assert_eq!(n2o.len(), normalized.len() + 1);
        for pair in n2o.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(n2o.iter().all(|&o| o <= input.len()));
    }

    #[test]
    fn invalid_utf8_becomes_replacement_char() {
        let cfg = NormalizerConfig {
            add_dummy_prefix: false,
            ..NormalizerConfig::default()
        };
        let normalizer = Normalizer::new(cfg).expect("builtin chars map");
        let (normalized, _) = normalizer.normalize_with_offsets(b"abc\x80xy");
        assert_eq!(normalized, "abc\u{FFFD}xy");
        // Trailing incomplete sequence.
        let (normalized, _) = normalizer.normalize_with_offsets(b"ab\xE2\x96");
        assert_eq!(normalized, "ab\u{FFFD}");
    }

    #[test]
    fn empty_input_is_empty_output() {
        let normalizer = default_normalizer();
        let (normalized, n2o) = normalizer.normalize_with_offsets(b"");
        assert!(normalized.is_empty());
        assert_eq!(n2o, vec![0]);
    }

    #[test]
    fn normalization_is_deterministic() {
        let normalizer = default_normalizer();
        let input = "Hello　World ①".as_bytes();
        assert_eq!(
            normalizer.normalize_with_offsets(input),
            normalizer.normalize_with_offsets(input)
        );
    }

    #[test]
    fn dummy_prefix_respects_suffix_mode() {
        let cfg = NormalizerConfig {
            treat_whitespace_as_suffix: true,
            ..NormalizerConfig::default()
        };
        let normalizer = Normalizer::new(cfg).expect("builtin chars map");
        assert_eq!(normalizer.normalize("hello"), "hello▁");
    }

    #[test]
    fn extra_whitespaces_kept_when_disabled() {
        let cfg = NormalizerConfig {
            add_dummy_prefix: false,
            remove_extra_whitespaces: false,
            name: "identity".into(),
            ..NormalizerConfig::default()
        };
        let normalizer = Normalizer::new(cfg).expect("identity chars map");
        assert_eq!(normalizer.normalize("a  b "), "a▁▁b▁");
    }

    #[test]
    fn user_defined_surfaces_bypass_the_chars_map() {
        let compiled = CharsMap::from_rules([("x", "y")]).compile().expect("compile");
        let cfg = NormalizerConfig {
            name: "custom".into(),
            add_dummy_prefix: false,
            ..NormalizerConfig::default()
        };
        let mut normalizer = Normalizer::from_parts(cfg, compiled);
        normalizer.set_prefix_matcher(Some(
            PrefixMatcher::new(&["xx"]).expect("matcher"),
        ));
        assert_eq!(normalizer.normalize("xxx"), "xxy");
    }

    #[test]
    fn prefix_matcher_consumes_one_scalar_on_miss() {
        let matcher = PrefixMatcher::new(&["ABC"]).expect("matcher");
        assert_eq!(matcher.prefix_match(b"ABCD"), (3, true));
        assert_eq!(matcher.prefix_match("日本".as_bytes()), (3, false));
        assert_eq!(matcher.prefix_match(b""), (0, false));
    }

    #[test]
    fn global_replace_rewrites_every_occurrence() {
        let matcher = PrefixMatcher::new(&["ab", "c"]).expect("matcher");
        assert_eq!(matcher.global_replace("abzcab", "_"), "_z__");
    }
}
