// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Backend-independent caption decoding
//!
//! Beam search over any `TokenScorer`. With `do_sample` unset the search is
//! fully deterministic: ties between candidates are broken by beam index and
//! then token id. Sampling draws from a seeded RNG, so a fixed seed still
//! reproduces the same captions.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cmp::Ordering;

use crate::config::Options;
use crate::error::{Result, VqaError};

/// Default beam width
pub const DEFAULT_BEAM_SIZE: usize = 5;

/// Default number of captions returned per image
pub const DEFAULT_OUT_SIZE: usize = 3;

/// Default maximum caption length in tokens
pub const DEFAULT_MAX_LENGTH: usize = 20;

/// Decoding parameters shared by every caption backend
#[derive(Debug, Clone, PartialEq)]
pub struct DecodingConfig {
    pub beam_size: usize,
    /// Captions kept per image (clamped to `beam_size`)
    pub out_size: usize,
    pub max_length: usize,
    pub temperature: f32,
    /// 0 disables top-k filtering
    pub top_k: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub length_penalty: f32,
    pub do_sample: bool,
    pub seed: u64,
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            beam_size: DEFAULT_BEAM_SIZE,
            out_size: DEFAULT_OUT_SIZE,
            max_length: DEFAULT_MAX_LENGTH,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            length_penalty: 1.0,
            do_sample: false,
            seed: 0,
        }
    }
}

impl DecodingConfig {
    /// Greedy decoding producing one caption
    pub fn greedy(max_length: usize) -> Self {
        Self {
            beam_size: 1,
            out_size: 1,
            max_length,
            ..Self::default()
        }
    }

    /// Read decoding options, accepting both `beam_size` and `num_beams`
    /// style names
    pub fn from_options(options: &Options) -> Result<Self> {
        let d = Self::default();
        let beam_size = first_present(options, &["beam_size", "num_beams"], d.beam_size)?;
        let out_size = first_present(
            options,
            &["out_size", "num_return_sequences", "num_keep_best"],
            d.out_size,
        )?;
        let max_length = first_present(options, &["max_length", "max_gen_length"], d.max_length)?;

        let config = Self {
            beam_size,
            out_size,
            max_length,
            temperature: options.get_f32("temperature", d.temperature)?,
            top_k: options.get_usize("top_k", d.top_k)?,
            top_p: options.get_f32("top_p", d.top_p)?,
            repetition_penalty: options.get_f32("repetition_penalty", d.repetition_penalty)?,
            length_penalty: options.get_f32("length_penalty", d.length_penalty)?,
            do_sample: options.get_bool("do_sample", d.do_sample)?,
            seed: options.get_or("seed", d.seed)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.beam_size == 0 {
            return Err(VqaError::Config("beam_size must be at least 1".to_string()));
        }
        if self.out_size == 0 {
            return Err(VqaError::Config("out_size must be at least 1".to_string()));
        }
        if self.max_length == 0 {
            return Err(VqaError::Config("max_length must be at least 1".to_string()));
        }
        if !(self.temperature > 0.0) {
            return Err(VqaError::Config("temperature must be positive".to_string()));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(VqaError::Config("top_p must be in (0, 1]".to_string()));
        }
        if !(self.repetition_penalty > 0.0) {
            return Err(VqaError::Config("repetition_penalty must be positive".to_string()));
        }
        Ok(())
    }
}

fn first_present(options: &Options, keys: &[&str], default: usize) -> Result<usize> {
    for key in keys {
        if options.contains(key) {
            return options.get_usize(key, default);
        }
    }
    Ok(default)
}

/// Source of next-token logits for a decoding prefix
///
/// Implementations wrap one decoder forward pass conditioned on one image's
/// visual features.
pub trait TokenScorer {
    fn next_token_logits(&self, prefix: &[u32]) -> Result<Vec<f32>>;
}

/// One finished (or length-capped) decoding
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    /// Generated tokens without BOS/EOS
    pub tokens: Vec<u32>,
    /// Sum of token log probabilities
    pub log_prob: f32,
    /// Length-normalized log probability used for ranking
    pub score: f32,
}

impl Hypothesis {
    /// Probability-like confidence in `(0, 1]`
    pub fn confidence(&self) -> f32 {
        self.score.exp()
    }
}

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    log_prob: f32,
}

/// Run beam search starting from `bos` until `eos` or `max_length`
///
/// Returns at most `out_size` hypotheses, best first.
pub fn beam_search<S>(scorer: &S, bos: u32, eos: u32, config: &DecodingConfig) -> Result<Vec<Hypothesis>>
where
    S: TokenScorer + ?Sized,
{
    config.validate()?;
    let beam_size = config.beam_size;
    let out_size = config.out_size.min(beam_size);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut live = vec![Beam {
        tokens: vec![bos],
        log_prob: 0.0,
    }];
    let mut finished: Vec<Beam> = Vec::new();

    for _ in 0..config.max_length {
        let mut candidates: Vec<(usize, u32, f32)> = Vec::new();

        for (b, beam) in live.iter().enumerate() {
            let mut logits = scorer.next_token_logits(&beam.tokens)?;
            if logits.is_empty() {
                return Err(VqaError::CaptionGeneration(
                    "decoder returned empty logits".to_string(),
                ));
            }
            apply_repetition_penalty(&mut logits, &beam.tokens[1..], config.repetition_penalty);
            let log_probs = log_softmax(&logits, config.temperature);

            let picks = if config.do_sample {
                sample_tokens(&log_probs, beam_size, config.top_k, config.top_p, &mut rng)?
            } else {
                top_tokens(&log_probs, beam_size)
            };

            for token in picks {
                candidates.push((b, token, beam.log_prob + log_probs[token as usize]));
            }
        }

        candidates.sort_by(|a, b| {
            b.2.total_cmp(&a.2)
                .then(a.0.cmp(&b.0))
                .then(a.1.cmp(&b.1))
        });

        let mut next = Vec::with_capacity(beam_size);
        for (b, token, log_prob) in candidates {
            let mut tokens = live[b].tokens.clone();
            if token == eos {
                finished.push(Beam { tokens, log_prob });
            } else {
                tokens.push(token);
                next.push(Beam { tokens, log_prob });
            }
            if next.len() == beam_size {
                break;
            }
        }

        live = next;
        if live.is_empty() || finished.len() >= beam_size {
            break;
        }
    }

    finished.extend(live);

    let mut hypotheses: Vec<Hypothesis> = finished
        .into_iter()
        .map(|beam| {
            let tokens = beam.tokens[1..].to_vec();
            let length = tokens.len().max(1) as f32;
            Hypothesis {
                score: beam.log_prob / length.powf(config.length_penalty),
                log_prob: beam.log_prob,
                tokens,
            }
        })
        .collect();

    hypotheses.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.tokens.cmp(&b.tokens)));
    hypotheses.dedup_by(|a, b| a.tokens == b.tokens);
    hypotheses.truncate(out_size);
    Ok(hypotheses)
}

/// CTRL-style penalty on tokens already generated
pub fn apply_repetition_penalty(logits: &mut [f32], generated: &[u32], penalty: f32) {
    if (penalty - 1.0).abs() < f32::EPSILON {
        return;
    }
    let mut seen = std::collections::HashSet::new();
    for &token in generated {
        if !seen.insert(token) {
            continue;
        }
        if let Some(logit) = logits.get_mut(token as usize) {
            *logit = if *logit > 0.0 {
                *logit / penalty
            } else {
                *logit * penalty
            };
        }
    }
}

/// Numerically stable log-softmax of `logits / temperature`
pub fn log_softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let t = if temperature > 0.0 { temperature } else { 1.0 };
    let scaled: Vec<f32> = logits.iter().map(|l| l / t).collect();
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = scaled.iter().map(|l| (l - max).exp()).sum();
    let log_sum = max + sum.ln();
    scaled.iter().map(|l| l - log_sum).collect()
}

/// Indices of the `k` largest values, largest first, ties by lower index
pub fn top_tokens(log_probs: &[f32], k: usize) -> Vec<u32> {
    let mut indexed: Vec<(usize, f32)> = log_probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| match b.1.total_cmp(&a.1) {
        Ordering::Equal => a.0.cmp(&b.0),
        other => other,
    });
    indexed.into_iter().take(k).map(|(i, _)| i as u32).collect()
}

/// Draw up to `n` distinct tokens after top-k / nucleus filtering
fn sample_tokens(
    log_probs: &[f32],
    n: usize,
    top_k: usize,
    top_p: f32,
    rng: &mut StdRng,
) -> Result<Vec<u32>> {
    let ranked = top_tokens(log_probs, if top_k == 0 { log_probs.len() } else { top_k });

    let mut pool: Vec<(u32, f32)> = Vec::with_capacity(ranked.len());
    let mut cumulative = 0.0;
    for token in ranked {
        let p = log_probs[token as usize].exp();
        pool.push((token, p));
        cumulative += p;
        if cumulative >= top_p {
            break;
        }
    }

    let mut picks = Vec::with_capacity(n.min(pool.len()));
    while picks.len() < n && !pool.is_empty() {
        let dist = WeightedIndex::new(pool.iter().map(|(_, p)| *p))
            .map_err(|e| VqaError::CaptionGeneration(format!("sampling failed: {}", e)))?;
        let (token, _) = pool.swap_remove(dist.sample(rng));
        picks.push(token);
    }
    Ok(picks)
}
