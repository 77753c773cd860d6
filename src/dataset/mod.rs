// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Dataset composition: sources, the dual-source join, prompts and batches

pub mod collate;
pub mod join;
pub mod prompt;
pub mod records;
pub mod source;

pub use collate::{Batch, BatchCollator, DataLoader};
pub use join::{DualSourceDataset, DualSourceRecord, FusedExample, JoinPolicy};
pub use prompt::{PromptComposer, PromptTemplate};
pub use records::{AnswerEntry, AuxiliaryRecord, BaseRecord, Metadata, RecordId};
pub use source::{InMemorySource, JsonlSource, RecordSource};
