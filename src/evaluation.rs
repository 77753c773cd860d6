// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! VQA accuracy over collated batches
//!
//! A prediction scores `min(matching human answers / 3, 1)` after both sides
//! are normalized.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::dataset::{Batch, RecordId};
use crate::error::{Result, VqaError};

/// Matching human answers needed for full credit
pub const FULL_CREDIT_MATCHES: f32 = 3.0;

fn articles() -> Option<&'static Regex> {
    static ARTICLES: OnceLock<Option<Regex>> = OnceLock::new();
    ARTICLES
        .get_or_init(|| Regex::new(r"\b(a|an|the)\b").ok())
        .as_ref()
}

fn is_arabic_mark(c: char) -> bool {
    // harakat, tanween, shadda, sukun, tatweel
    matches!(c, '\u{064B}'..='\u{0652}' | '\u{0640}')
}

fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation() || matches!(c, '،' | '؛' | '؟' | '«' | '»' | '…')
}

/// Canonical form used for answer matching
///
/// Lowercases, strips Arabic diacritics and tatweel, unifies hamza-carrying
/// alef forms, turns punctuation into spaces, drops English articles and
/// collapses whitespace.
pub fn normalize_answer(answer: &str) -> String {
    let cleaned: String = answer
        .to_lowercase()
        .chars()
        .filter(|c| !is_arabic_mark(*c))
        .map(|c| match c {
            'أ' | 'إ' | 'آ' => 'ا',
            c if is_punctuation(c) => ' ',
            c => c,
        })
        .collect();

    let cleaned = match articles() {
        Some(re) => re.replace_all(&cleaned, " ").into_owned(),
        None => cleaned,
    };

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Accuracy of one prediction against the human answers
pub fn vqa_accuracy(prediction: &str, answers: &[String]) -> f32 {
    let prediction = normalize_answer(prediction);
    if prediction.is_empty() {
        return 0.0;
    }
    let matches = answers
        .iter()
        .filter(|a| normalize_answer(a) == prediction)
        .count() as f32;
    (matches / FULL_CREDIT_MATCHES).min(1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredAnswer {
    pub question_id: RecordId,
    pub prediction: String,
    pub accuracy: f32,
}

/// Running accuracy across batches
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub scored: Vec<ScoredAnswer>,
}

impl AccuracyReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score one batch; `predictions` must be index-aligned with it
    pub fn add_batch(&mut self, batch: &Batch, predictions: &[String]) -> Result<()> {
        if predictions.len() != batch.len() {
            return Err(VqaError::MalformedExample {
                index: None,
                reason: format!(
                    "{} predictions for a batch of {}",
                    predictions.len(),
                    batch.len()
                ),
            });
        }
        for ((question_id, answers), prediction) in batch
            .question_id
            .iter()
            .zip(&batch.answers)
            .zip(predictions)
        {
            self.scored.push(ScoredAnswer {
                question_id: question_id.clone(),
                prediction: prediction.clone(),
                accuracy: vqa_accuracy(prediction, answers),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.scored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scored.is_empty()
    }

    /// Mean accuracy, 0 when nothing was scored
    pub fn accuracy(&self) -> f32 {
        if self.scored.is_empty() {
            return 0.0;
        }
        self.scored.iter().map(|s| s.accuracy).sum::<f32>() / self.scored.len() as f32
    }
}
