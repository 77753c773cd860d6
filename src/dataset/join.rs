// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Positional join of a base source with an auxiliary caption source
//!
//! Record `i` of the base source is paired with record `i` of the auxiliary
//! source. Nothing ties the two together but the index, so the lengths are
//! checked when the join is built.

use serde_json::Value;
use tracing::debug;

use super::prompt::PromptComposer;
use super::records::{AnswerEntry, AuxiliaryRecord, BaseRecord, Metadata};
use super::source::RecordSource;
use crate::captioning::Caption;
use crate::error::{Result, VqaError};

/// How strictly source lengths must agree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinPolicy {
    /// Lengths must be equal
    #[default]
    Strict,
    /// The auxiliary source may have trailing records
    AllowLongerAuxiliary,
}

/// One logical example assembled from both sources
#[derive(Debug, Clone, PartialEq)]
pub struct DualSourceRecord {
    pub index: usize,
    pub metadata: Option<Metadata>,
    pub image: Value,
    pub question: Option<String>,
    pub answers: Vec<AnswerEntry>,
    pub multiple_choice_answer: Option<String>,
    pub captions_a: Vec<Caption>,
    pub captions_b: Vec<Caption>,
}

impl DualSourceRecord {
    pub fn from_parts(index: usize, base: BaseRecord, auxiliary: Option<AuxiliaryRecord>) -> Self {
        Self {
            index,
            metadata: base.metadata,
            image: base.image,
            question: base.question,
            answers: base.answers,
            multiple_choice_answer: base.multiple_choice_answer,
            captions_a: base.captions,
            captions_b: auxiliary.map(|aux| aux.captions).unwrap_or_default(),
        }
    }

    /// Validate required fields and compose the prompt
    pub fn fuse(self, composer: &PromptComposer) -> Result<FusedExample> {
        let question = self
            .question
            .ok_or_else(|| VqaError::malformed(self.index, "missing question"))?;
        let metadata = self
            .metadata
            .ok_or_else(|| VqaError::malformed(self.index, "missing metadata"))?;

        let prompt = composer.compose(&question, &self.captions_a, &self.captions_b);

        Ok(FusedExample {
            metadata,
            image: self.image,
            question,
            answers: self.answers,
            multiple_choice_answer: self.multiple_choice_answer.unwrap_or_default(),
            prompt,
        })
    }
}

/// Example with its composed prompt, ready for collation
#[derive(Debug, Clone, PartialEq)]
pub struct FusedExample {
    pub metadata: Metadata,
    pub image: Value,
    pub question: String,
    pub answers: Vec<AnswerEntry>,
    pub multiple_choice_answer: String,
    pub prompt: String,
}

/// Base and auxiliary sources read side by side
#[derive(Debug)]
pub struct DualSourceDataset<B, A> {
    base: B,
    auxiliary: A,
}

impl<B, A> DualSourceDataset<B, A>
where
    B: RecordSource<BaseRecord>,
    A: RecordSource<AuxiliaryRecord>,
{
    /// Join with equal-length sources
    pub fn new(base: B, auxiliary: A) -> Result<Self> {
        Self::with_policy(base, auxiliary, JoinPolicy::Strict)
    }

    pub fn with_policy(base: B, auxiliary: A, policy: JoinPolicy) -> Result<Self> {
        let (base_len, aux_len) = (base.len(), auxiliary.len());
        let aligned = match policy {
            JoinPolicy::Strict => aux_len == base_len,
            JoinPolicy::AllowLongerAuxiliary => aux_len >= base_len,
        };
        if !aligned {
            return Err(VqaError::MalformedExample {
                index: None,
                reason: format!(
                    "auxiliary source has {} records, base source has {} ({:?} join)",
                    aux_len, base_len, policy
                ),
            });
        }
        debug!("Joined {} base records with {} auxiliary records", base_len, aux_len);
        Ok(Self { base, auxiliary })
    }

    /// Number of examples, always the base length
    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Example at `index`; missing caption lists read as empty
    pub fn get(&self, index: usize) -> Option<DualSourceRecord> {
        let base = self.base.get(index)?;
        let auxiliary = self.auxiliary.get(index);
        Some(DualSourceRecord::from_parts(index, base, auxiliary))
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    pub fn auxiliary(&self) -> &A {
        &self.auxiliary
    }
}
