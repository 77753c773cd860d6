// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Glue between the capability backends and the dataset layer

use std::sync::Arc;
use tracing::{info, warn};

use crate::answering::QaBackend;
use crate::captioning::{Caption, CaptionBackend};
use crate::dataset::{AuxiliaryRecord, Batch, BaseRecord, InMemorySource, RecordSource};
use crate::error::{Result, VqaError};
use crate::types::OneOrMany;
use crate::vision::ImageInput;

/// Default number of images sent to a backend per call
pub const DEFAULT_CHUNK_SIZE: usize = 16;

/// Captions every image of a base source with one backend
///
/// The result is index-aligned with the base source, so it can serve as the
/// auxiliary side of a `DualSourceDataset`.
pub struct CaptionAnnotator {
    backend: Arc<dyn CaptionBackend>,
    chunk_size: usize,
}

impl CaptionAnnotator {
    pub fn new(backend: Arc<dyn CaptionBackend>) -> Self {
        Self {
            backend,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Caption lists for every base record, in order
    ///
    /// Each chunk is normalized image by image; records whose image cannot be
    /// read or decoded get an empty list without affecting the rest of the
    /// chunk. Images that normalize are encoded and decoded together, and a
    /// backend failure there empties only those images.
    pub async fn caption_source<B>(&self, base: &B) -> Vec<Vec<Caption>>
    where
        B: RecordSource<BaseRecord>,
    {
        let total = base.len();
        let mut all = Vec::with_capacity(total);
        let mut start = 0;

        while start < total {
            let end = (start + self.chunk_size).min(total);
            let mut pending: Vec<(usize, ImageInput)> = Vec::with_capacity(end - start);
            for index in start..end {
                match base.get(index).map(|record| record.image_input()) {
                    Some(Ok(image)) => pending.push((index, image)),
                    Some(Err(e)) => warn!("Record {}: no usable image: {}", index, e),
                    None => {}
                }
            }

            let (indices, inputs): (Vec<usize>, Vec<ImageInput>) = pending.into_iter().unzip();
            let normalized = self.backend.normalizer().normalize_all(inputs).await;

            let mut ready = Vec::with_capacity(indices.len());
            let mut images = Vec::with_capacity(indices.len());
            for (index, result) in indices.into_iter().zip(normalized) {
                match result {
                    Ok(image) => {
                        ready.push(index);
                        images.push(image);
                    }
                    Err(e) => warn!("Record {}: image not loaded: {}", index, e),
                }
            }

            let mut chunk = vec![Vec::new(); end - start];
            if !images.is_empty() {
                match self.backend.caption_normalized(&images) {
                    Ok(captions) => {
                        for (index, captions) in ready.into_iter().zip(captions) {
                            chunk[index - start] = captions;
                        }
                    }
                    Err(e) => warn!(
                        "{}: captioning failed for records {}..{}: {}",
                        self.backend.name(),
                        start,
                        end,
                        e
                    ),
                }
            }
            all.extend(chunk);
            start = end;
        }

        info!("{} captioned {} records", self.backend.name(), total);
        all
    }

    /// Auxiliary source built from this backend's captions
    pub async fn annotate<B>(&self, base: &B) -> InMemorySource<AuxiliaryRecord>
    where
        B: RecordSource<BaseRecord>,
    {
        self.caption_source(base)
            .await
            .into_iter()
            .map(AuxiliaryRecord::new)
            .collect::<Vec<_>>()
            .into()
    }

    /// Copy of the base source with its own captions filled by this backend
    pub async fn annotate_base<B>(&self, base: &B) -> InMemorySource<BaseRecord>
    where
        B: RecordSource<BaseRecord>,
    {
        let captions = self.caption_source(base).await;
        captions
            .into_iter()
            .enumerate()
            .filter_map(|(index, captions)| base.get(index).map(|record| record.with_captions(captions)))
            .collect::<Vec<_>>()
            .into()
    }
}

/// Send a batch's prompts to a QA backend; answers are index-aligned
pub async fn answer_batch(qa: &dyn QaBackend, batch: &Batch) -> Result<Vec<String>> {
    if batch.is_empty() {
        return Ok(Vec::new());
    }
    let answers = qa
        .answer_question(OneOrMany::Many(batch.prompts.clone()))
        .await?
        .into_vec();
    if answers.len() != batch.len() {
        return Err(VqaError::AnswerGeneration(format!(
            "{} returned {} answers for {} prompts",
            qa.name(),
            answers.len(),
            batch.len()
        )));
    }
    Ok(answers)
}
