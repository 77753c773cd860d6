// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Caption backends
//!
//! A caption backend turns images into ranked captions in two steps:
//! visual feature extraction, then caption decoding from those features.
//! `generate_captions` chains normalization and both steps, and degrades to
//! an empty caption list per image when anything in the chain fails.
//!
//! - `clip` - holistic CLIP-style captioner
//! - `region` - object-region captioner with detector tags
//! - `decoding` - beam search shared by both
//! - `onnx` - session loading helpers

pub mod clip;
pub mod decoding;
pub mod onnx;
pub mod region;

pub use clip::{ClipCaptioner, ClipCaptionerConfig};
pub use decoding::{beam_search, DecodingConfig, Hypothesis, TokenScorer};
pub use onnx::Device;
pub use region::{LabelMap, RegionCaptioner, RegionCaptionerConfig};

use async_trait::async_trait;
use image::RgbImage;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Options;
use crate::error::{Result, VqaError};
use crate::types::OneOrMany;
use crate::vision::{ImageInput, ImageNormalizer};

/// One generated caption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caption {
    #[serde(rename = "caption", alias = "text")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl Caption {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
        }
    }

    pub fn with_confidence(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence: Some(confidence),
        }
    }
}

/// Per-image region features with parallel detector labels
#[derive(Debug, Clone, PartialEq)]
pub struct RegionFeatures {
    /// `(num_images, max_regions, feature_dim)`, zero-padded past each image's count
    pub features: Array3<f32>,
    /// Real (unpadded) region count per image
    pub region_counts: Vec<usize>,
    /// Detector label per real region
    pub labels: Vec<Vec<String>>,
}

/// Encoder output for a batch of images
#[derive(Debug, Clone, PartialEq)]
pub enum VisualFeatures {
    /// One embedding per image, `(num_images, feature_dim)`
    Global(Array2<f32>),
    /// Decoder memory per image, `(num_images, positions, hidden_dim)`
    Encoded(Array3<f32>),
    Regions(RegionFeatures),
}

impl VisualFeatures {
    pub fn num_images(&self) -> usize {
        match self {
            Self::Global(embeds) => embeds.nrows(),
            Self::Encoded(memory) => memory.shape()[0],
            Self::Regions(regions) => regions.features.shape()[0],
        }
    }

    pub fn feature_dim(&self) -> usize {
        match self {
            Self::Global(embeds) => embeds.ncols(),
            Self::Encoded(memory) => memory.shape()[2],
            Self::Regions(regions) => regions.features.shape()[2],
        }
    }
}

/// Image captioning capability
///
/// Implementations load their models once at construction and hold them for
/// their lifetime. Calls into one instance are serialized by the instance.
#[async_trait]
pub trait CaptionBackend: Send + Sync {
    /// Short backend identifier used in logs
    fn name(&self) -> &str;

    fn normalizer(&self) -> &ImageNormalizer;

    /// Preprocess and encode a batch of normalized images
    fn extract_visual_features(&self, images: &[RgbImage]) -> Result<VisualFeatures>;

    /// Decode ranked captions, one best-first list per image
    fn generate_captions_from_features(&self, features: &VisualFeatures) -> Result<Vec<Vec<Caption>>>;

    /// Normalize, encode and decode, surfacing the first error
    async fn try_generate_captions(&self, images: Vec<ImageInput>) -> Result<Vec<Vec<Caption>>> {
        let mut normalized = Vec::with_capacity(images.len());
        for result in self.normalizer().normalize_all(images).await {
            normalized.push(result?);
        }
        self.caption_normalized(&normalized)
    }

    /// Encode and decode already-normalized images, one list per image
    fn caption_normalized(&self, images: &[RgbImage]) -> Result<Vec<Vec<Caption>>> {
        let count = images.len();
        let features = self.extract_visual_features(images)?;
        debug!(
            "{}: features for {} images (dim {})",
            self.name(),
            features.num_images(),
            features.feature_dim()
        );

        let captions = self.generate_captions_from_features(&features)?;
        if captions.len() != count {
            return Err(VqaError::CaptionGeneration(format!(
                "expected captions for {} images, got {}",
                count,
                captions.len()
            )));
        }
        Ok(captions)
    }

    /// Captions for one image or a list, never failing
    ///
    /// Any failure yields one empty list per requested image.
    async fn generate_captions(&self, images: OneOrMany<ImageInput>) -> Vec<Vec<Caption>> {
        let images = images.into_vec();
        let count = images.len();
        if count == 0 {
            return Vec::new();
        }

        match self.try_generate_captions(images).await {
            Ok(captions) => captions,
            Err(e) => {
                warn!("{}: caption generation failed for {} images: {}", self.name(), count, e);
                vec![Vec::new(); count]
            }
        }
    }

    /// Like `generate_captions`, but a failing image only empties its own entry
    async fn generate_captions_per_image(&self, images: Vec<ImageInput>) -> Vec<Vec<Caption>> {
        let mut out = Vec::with_capacity(images.len());
        for image in images {
            out.extend(self.generate_captions(OneOrMany::One(image)).await);
        }
        out
    }
}

/// Construct a caption backend by name (`clip` or `region`)
///
/// Backend-specific settings are read from `options.scoped(kind)`, so both
/// backends can share one options file.
pub fn load_caption_backend(kind: &str, options: &Options) -> Result<Arc<dyn CaptionBackend>> {
    let scoped = options.scoped(kind);
    let backend: Arc<dyn CaptionBackend> = match kind {
        "clip" => Arc::new(
            ClipCaptioner::new(ClipCaptionerConfig::from_options(&scoped)?)
                .map_err(|e| VqaError::ModelLoad(format!("{:#}", e)))?,
        ),
        "region" => Arc::new(
            RegionCaptioner::new(RegionCaptionerConfig::from_options(&scoped)?)
                .map_err(|e| VqaError::ModelLoad(format!("{:#}", e)))?,
        ),
        other => {
            return Err(VqaError::Config(format!("unknown caption backend '{}'", other)));
        }
    };
    info!("Loaded {} caption backend", backend.name());
    Ok(backend)
}
