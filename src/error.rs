// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Error types shared by the captioning, answering and dataset layers
//!
//! Primitive operations (feature extraction, caption decoding, question
//! answering) surface these to the caller. Only the convenience
//! `CaptionBackend::generate_captions` absorbs them.

use thiserror::Error;

/// Errors raised anywhere in the caption-fusion pipeline
#[derive(Error, Debug)]
pub enum VqaError {
    /// The caller handed over an image representation we do not know how to decode
    #[error("Unsupported image input type: {0}")]
    UnsupportedInputType(String),

    /// Network or filesystem failure while fetching an image
    #[error("Image source unavailable ({location}): {reason}")]
    SourceUnavailable { location: String, reason: String },

    /// Bytes or pixel buffers that do not decode into an RGB image
    #[error("Invalid image data: {0}")]
    InvalidImageData(String),

    /// Preprocessing or encoder forward pass failed
    #[error("Error extracting visual features: {0}")]
    FeatureExtraction(String),

    /// Decoder forward pass, search or detokenization failed
    #[error("Error generating captions from features: {0}")]
    CaptionGeneration(String),

    /// QA backend failed to produce an answer
    #[error("Error answering question: {0}")]
    AnswerGeneration(String),

    /// A record is missing a field it cannot be evaluated without
    #[error("Malformed example{}: {reason}", fmt_index(.index))]
    MalformedExample { index: Option<usize>, reason: String },

    /// Model files missing or unloadable
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    /// A configuration value is present but unusable
    #[error("Invalid configuration: {0}")]
    Config(String),
}

fn fmt_index(index: &Option<usize>) -> String {
    match index {
        Some(i) => format!(" at index {}", i),
        None => String::new(),
    }
}

impl VqaError {
    /// Shorthand for a `MalformedExample` tied to a position
    pub fn malformed(index: usize, reason: impl Into<String>) -> Self {
        Self::MalformedExample {
            index: Some(index),
            reason: reason.into(),
        }
    }

    /// Shorthand for a `SourceUnavailable` error
    pub fn unavailable(location: impl Into<String>, reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            location: location.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, VqaError>;
