//! Metrics describing the evolution of the training process.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Metrics captured for each EM sub-iteration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmIterationMetrics {
    /// Outer EM round (1-indexed); a pruning pass follows each round.
    pub round: usize,
    /// Sub-iteration within the round (0-indexed).
    pub sub_iteration: usize,
    /// Working vocabulary size after the M-step.
    pub vocab_size: usize,
    /// Negative per-sentence log-likelihood after the E-step.
    pub objective: f32,
    /// Viterbi token count over the whole corpus.
    pub num_tokens: u64,
    /// Execution time for the sub-iteration.
    pub elapsed_iteration: Duration,
    /// Total time elapsed since training started.
    pub elapsed_total: Duration,
    /// Resident set size sample captured from `/proc/self/status` on Linux.
    pub rss_kb: Option<usize>,
}

/// Aggregate metrics produced by a training session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingMetrics {
    /// Seed vocabulary size the EM loop started from.
    pub seed_size: usize,
    /// Per-sub-iteration snapshots accrued during training.
    pub iterations: Vec<EmIterationMetrics>,
    /// Number of pruning passes executed.
    pub prune_rounds: usize,
    /// Final vocabulary size, meta pieces included.
    pub final_vocab_size: usize,
    /// Total duration of the training session.
    pub total_duration: Duration,
}

impl TrainingMetrics {
    /// Creates an empty metrics container with pre-allocated capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            seed_size: 0,
            iterations: Vec::with_capacity(capacity),
            prune_rounds: 0,
            final_vocab_size: 0,
            total_duration: Duration::ZERO,
        }
    }
}

#[cfg(target_os = "linux")]
fn current_rss_kb() -> Option<usize> {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let file = File::open("/proc/self/status").ok()?;
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let value = rest
                .split_whitespace()
                .find_map(|part| part.parse::<usize>().ok());
            return value;
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn current_rss_kb() -> Option<usize> {
    None
}

/// Samples the current resident set size (RSS) on supported platforms.
pub fn sample_rss_kb() -> Option<usize> {
    current_rss_kb()
}
