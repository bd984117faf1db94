//! Enhanced suffix array over Unicode scalar sequences.
//!
//! The seed builder needs, for a corpus laid out as one `u32` array, every
//! repeated substring with its occurrence range. That is exactly the set of
//! LCP intervals of the suffix array: an interval `[left, right)` at depth
//! `d` means the `right - left` suffixes `sa[left..right]` share a prefix of
//! `d` symbols, and `sa[left]` is one occurrence position.
//!
//! Construction uses prefix doubling, which is alphabet-agnostic and so
//! handles the full scalar range without bucket tables, followed by Kasai's
//! LCP recovery and a stack-driven interval enumeration.

use crate::error::{Result, UnipieceError};

/// An internal node of the (virtual) suffix tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LcpInterval {
    /// First suffix-array index of the interval.
    pub left: u32,
    /// One past the last suffix-array index of the interval.
    pub right: u32,
    /// Length of the shared prefix in symbols.
    pub depth: u32,
}

/// Suffix array plus its LCP array.
#[derive(Debug, Clone)]
pub struct SuffixArray {
    sa: Vec<u32>,
    lcp: Vec<u32>,
}

impl SuffixArray {
    /// Builds the suffix and LCP arrays for `text`.
    pub fn build(text: &[u32]) -> Result<Self> {
        if text.len() >= u32::MAX as usize {
            return Err(UnipieceError::Unavailable(format!(
                "corpus of {} symbols exceeds the suffix array limit",
                text.len()
            )));
        }
        let sa = suffix_array(text);
        let lcp = lcp_array(text, &sa);
        Ok(Self { sa, lcp })
    }

    /// The suffix array: starting positions in lexicographic suffix order.
    #[must_use]
    pub fn suffixes(&self) -> &[u32] {
        &self.sa
    }

    /// `lcp[i]` is the shared prefix length of `sa[i - 1]` and `sa[i]`.
    #[must_use]
    pub fn lcp(&self) -> &[u32] {
        &self.lcp
    }

    /// Enumerates every internal node as an [`LcpInterval`].
    ///
    /// Intervals always span at least two suffixes; the trivial root at
    /// depth zero is excluded.
    #[must_use]
    pub fn internal_nodes(&self) -> Vec<LcpInterval> {
        let n = self.sa.len();
        let mut nodes = Vec::new();
        let mut stack: Vec<(usize, u32)> = vec![(0, 0)];
        for i in 1..=n {
            let current = if i < n { self.lcp[i] } else { 0 };
            let mut left = i - 1;
            while let Some(&(l, d)) = stack.last() {
                if d <= current {
                    break;
                }
                stack.pop();
                nodes.push(LcpInterval {
                    left: l as u32,
                    right: i as u32,
                    depth: d,
                });
                left = l;
            }
            if stack.last().map_or(true, |&(_, d)| d < current) {
                stack.push((left, current));
            }
        }
        nodes
    }
}

fn suffix_array(text: &[u32]) -> Vec<u32> {
    let n = text.len();
    if n == 0 {
        return Vec::new();
    }

    // Compress the alphabet so ranks stay dense.
    let mut symbols: Vec<u32> = text.to_vec();
    symbols.sort_unstable();
    symbols.dedup();
    let mut rank: Vec<u32> = text
        .iter()
        .map(|c| symbols.binary_search(c).unwrap_or_default() as u32)
        .collect();

    let mut sa: Vec<u32> = (0..n as u32).collect();
    let mut tmp = vec![0u32; n];
    let mut k = 1usize;
    loop {
        {
            let key = |i: u32| -> (u32, u32) {
                let i = i as usize;
                let second = if i + k < n { rank[i + k] + 1 } else { 0 };
                (rank[i], second)
            };
            sa.sort_unstable_by_key(|&i| key(i));
            tmp[sa[0] as usize] = 0;
            for j in 1..n {
                let step = u32::from(key(sa[j]) != key(sa[j - 1]));
                tmp[sa[j] as usize] = tmp[sa[j - 1] as usize] + step;
            }
        }
        std::mem::swap(&mut rank, &mut tmp);
        if rank[sa[n - 1] as usize] as usize == n - 1 {
            break;
        }
        k <<= 1;
    }
    sa
}

fn lcp_array(text: &[u32], sa: &[u32]) -> Vec<u32> {
    let n = text.len();
    let mut inverse = vec![0u32; n];
    for (i, &s) in sa.iter().enumerate() {
        inverse[s as usize] = i as u32;
    }
    let mut lcp = vec![0u32; n];
    let mut h = 0usize;
    for i in 0..n {
        let r = inverse[i] as usize;
        if r == 0 {
            h = 0;
            continue;
        }
        let j = sa[r - 1] as usize;
        while i + h < n && j + h < n && text[i + h] == text[j + h] {
            h += 1;
        }
        lcp[r] = h as u32;
        h = h.saturating_sub(1);
    }
    lcp
}
