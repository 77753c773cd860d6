// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Column-oriented batching of fused examples

use serde::{Deserialize, Serialize};

use super::join::{DualSourceDataset, DualSourceRecord, FusedExample};
use super::prompt::PromptComposer;
use super::records::{AuxiliaryRecord, BaseRecord, RecordId};
use super::source::RecordSource;
use crate::error::{Result, VqaError};

/// Parallel columns, one entry per example, in source order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub question_id: Vec<RecordId>,
    pub image_id: Vec<RecordId>,
    pub prompts: Vec<String>,
    pub answers: Vec<Vec<String>>,
    pub multiple_choice_answer: Vec<String>,
}

impl Batch {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            question_id: Vec::with_capacity(n),
            image_id: Vec::with_capacity(n),
            prompts: Vec::with_capacity(n),
            answers: Vec::with_capacity(n),
            multiple_choice_answer: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.question_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, example: FusedExample) {
        self.question_id.push(example.metadata.question_id);
        self.image_id.push(example.metadata.image_id);
        self.prompts.push(example.prompt);
        self.answers
            .push(example.answers.into_iter().map(|a| a.answer).collect());
        self.multiple_choice_answer.push(example.multiple_choice_answer);
    }
}

impl FromIterator<FusedExample> for Batch {
    fn from_iter<I: IntoIterator<Item = FusedExample>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut batch = Batch::with_capacity(iter.size_hint().0);
        for example in iter {
            batch.push(example);
        }
        batch
    }
}

/// Fuses joined records and gathers them into a `Batch`
#[derive(Debug, Clone, Default)]
pub struct BatchCollator {
    composer: PromptComposer,
}

impl BatchCollator {
    pub fn new(composer: PromptComposer) -> Self {
        Self { composer }
    }

    pub fn composer(&self) -> &PromptComposer {
        &self.composer
    }

    /// Compose prompts and collate in input order
    ///
    /// Fails on the first record missing its question or metadata.
    pub fn collate<I>(&self, records: I) -> Result<Batch>
    where
        I: IntoIterator<Item = DualSourceRecord>,
    {
        records
            .into_iter()
            .map(|record| record.fuse(&self.composer))
            .collect::<Result<Vec<_>>>()
            .map(Batch::from_iter)
    }

    /// Collate examples whose prompts are already composed
    pub fn collate_fused(&self, examples: Vec<FusedExample>) -> Batch {
        examples.into_iter().collect()
    }
}

/// Walks a joined dataset front to back in fixed-size batches
///
/// No shuffling; the final batch holds the remainder.
pub struct DataLoader<'a, B, A> {
    dataset: &'a DualSourceDataset<B, A>,
    collator: BatchCollator,
    batch_size: usize,
    cursor: usize,
}

impl<'a, B, A> DataLoader<'a, B, A>
where
    B: RecordSource<BaseRecord>,
    A: RecordSource<AuxiliaryRecord>,
{
    pub fn new(dataset: &'a DualSourceDataset<B, A>, collator: BatchCollator, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(VqaError::Config("batch_size must be at least 1".to_string()));
        }
        Ok(Self {
            dataset,
            collator,
            batch_size,
            cursor: 0,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }
}

impl<B, A> Iterator for DataLoader<'_, B, A>
where
    B: RecordSource<BaseRecord>,
    A: RecordSource<AuxiliaryRecord>,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.dataset.len();
        if self.cursor >= len {
            return None;
        }
        let start = self.cursor;
        let end = (start + self.batch_size).min(len);
        self.cursor = end;

        let mut records = Vec::with_capacity(end - start);
        for index in start..end {
            match self.dataset.get(index) {
                Some(record) => records.push(record),
                None => {
                    return Some(Err(VqaError::malformed(
                        index,
                        "base source has no record at this index",
                    )))
                }
            }
        }
        Some(self.collator.collate(records))
    }
}
