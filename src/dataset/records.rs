// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Record types read from the base and auxiliary sources

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::captioning::Caption;
use crate::error::Result;
use crate::vision::ImageInput;

/// Question or image identifier; VQA dumps use both integers and strings
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => write!(f, "{}", id),
            Self::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self::Int(id)
    }
}

impl From<i32> for RecordId {
    fn from(id: i32) -> Self {
        Self::Int(id.into())
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::Text(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self::Text(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub question_id: RecordId,
    pub image_id: RecordId,
    /// Any other keys in the record's metadata, kept verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Metadata {
    pub fn new(question_id: impl Into<RecordId>, image_id: impl Into<RecordId>) -> Self {
        Self {
            question_id: question_id.into(),
            image_id: image_id.into(),
            extra: BTreeMap::new(),
        }
    }
}

/// One human answer; only the answer text is used downstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerEntry {
    #[serde(default)]
    pub answer: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl From<&str> for AnswerEntry {
    fn from(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            extra: BTreeMap::new(),
        }
    }
}

/// Example from the base source
///
/// `question` and `metadata` are optional here so that a record lacking them
/// can still be read and reported as malformed when it is fused.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Path, URL or pixel grid
    #[serde(default)]
    pub image: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default)]
    pub answers: Vec<AnswerEntry>,
    #[serde(default)]
    pub multiple_choice_answer: Option<String>,
    /// First caption source
    #[serde(default)]
    pub captions: Vec<Caption>,
}

impl BaseRecord {
    pub fn new(metadata: Metadata, question: impl Into<String>) -> Self {
        Self {
            metadata: Some(metadata),
            question: Some(question.into()),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image: impl Into<Value>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_answers<A: Into<AnswerEntry>>(mut self, answers: impl IntoIterator<Item = A>) -> Self {
        self.answers = answers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_multiple_choice_answer(mut self, answer: impl Into<String>) -> Self {
        self.multiple_choice_answer = Some(answer.into());
        self
    }

    pub fn with_captions(mut self, captions: Vec<Caption>) -> Self {
        self.captions = captions;
        self
    }

    /// Interpret the `image` field
    pub fn image_input(&self) -> Result<ImageInput> {
        ImageInput::try_from(&self.image)
    }
}

/// Example from the auxiliary source: only its captions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryRecord {
    #[serde(default)]
    pub captions: Vec<Caption>,
}

impl AuxiliaryRecord {
    pub fn new(captions: Vec<Caption>) -> Self {
        Self { captions }
    }
}
