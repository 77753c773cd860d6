// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Fused prompt composition
//!
//! The prompt lists the selected captions of source A, then source B, each on
//! its own labelled line, followed by the question:
//!
//! ```text
//! الوصف الأول: سيارة حمراء في الشارع
//! الوصف الثاني: سيارة، لونها أحمر
//! السؤال: ما لون السيارة؟
//! ```
//!
//! A source with no captions left after filtering gets no line. When neither
//! source contributes, the prompt is the question alone.

use std::collections::HashSet;

use crate::captioning::Caption;
use crate::config::Options;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    /// Captions taken from each source, best first
    pub captions_per_source: usize,
    /// Captions with a known confidence below this are dropped
    pub min_confidence: Option<f32>,
    pub label_a: String,
    pub label_b: String,
    pub caption_separator: String,
    pub question_prefix: String,
    /// Drop a caption already shown (A before B, first occurrence wins)
    pub dedupe: bool,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            captions_per_source: 2,
            min_confidence: None,
            label_a: "الوصف الأول".to_string(),
            label_b: "الوصف الثاني".to_string(),
            caption_separator: "، ".to_string(),
            question_prefix: "السؤال: ".to_string(),
            dedupe: true,
        }
    }
}

impl PromptTemplate {
    pub fn from_options(options: &Options) -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            captions_per_source: options.get_usize("captions_per_source", d.captions_per_source)?,
            min_confidence: options.get_or("min_confidence", d.min_confidence)?,
            label_a: options.get_or("label_a", d.label_a)?,
            label_b: options.get_or("label_b", d.label_b)?,
            caption_separator: options.get_or("caption_separator", d.caption_separator)?,
            question_prefix: options.get_or("question_prefix", d.question_prefix)?,
            dedupe: options.get_bool("dedupe_captions", d.dedupe)?,
        })
    }
}

/// Pure mapping from a question and two caption lists to one prompt string
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptComposer {
    template: PromptTemplate,
}

impl PromptComposer {
    pub fn new(template: PromptTemplate) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    pub fn compose(&self, question: &str, captions_a: &[Caption], captions_b: &[Caption]) -> String {
        let t = &self.template;
        let mut seen = HashSet::new();
        let selected_a = self.select(captions_a, &mut seen);
        let selected_b = self.select(captions_b, &mut seen);

        if selected_a.is_empty() && selected_b.is_empty() {
            return question.to_string();
        }

        let mut lines = Vec::with_capacity(3);
        for (label, selected) in [(&t.label_a, selected_a), (&t.label_b, selected_b)] {
            if !selected.is_empty() {
                lines.push(format!("{}: {}", label, selected.join(t.caption_separator.as_str())));
            }
        }
        lines.push(format!("{}{}", t.question_prefix, question));
        lines.join("\n")
    }

    fn select<'c>(&self, captions: &'c [Caption], seen: &mut HashSet<&'c str>) -> Vec<&'c str> {
        let t = &self.template;
        let mut selected = Vec::new();
        for caption in captions {
            if selected.len() == t.captions_per_source {
                break;
            }
            let text = caption.text.trim();
            if text.is_empty() {
                continue;
            }
            if let (Some(floor), Some(confidence)) = (t.min_confidence, caption.confidence) {
                if confidence < floor {
                    continue;
                }
            }
            if t.dedupe && !seen.insert(text) {
                continue;
            }
            selected.push(text);
        }
        selected
    }
}
