// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod answering;
pub mod captioning;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod pipeline;
pub mod types;
pub mod vision;

// Re-export main types
pub use answering::{ChatAnswerer, ChatAnswererConfig, QaBackend};
pub use captioning::{
    load_caption_backend, Caption, CaptionBackend, ClipCaptioner, ClipCaptionerConfig, DecodingConfig, Device,
    RegionCaptioner, RegionCaptionerConfig, VisualFeatures,
};
pub use config::Options;
pub use dataset::{
    AuxiliaryRecord, BaseRecord, Batch, BatchCollator, DataLoader, DualSourceDataset,
    DualSourceRecord, FusedExample, JoinPolicy, Metadata, PromptComposer, PromptTemplate,
    RecordId, RecordSource,
};
pub use error::{Result, VqaError};
pub use evaluation::{normalize_answer, vqa_accuracy, AccuracyReport};
pub use pipeline::{answer_batch, CaptionAnnotator};
pub use types::OneOrMany;
pub use vision::{ImageInput, ImageNormalizer, NormalizerConfig};
