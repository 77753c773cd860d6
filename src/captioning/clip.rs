// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Holistic CLIP-style captioner
//!
//! Model directory layout:
//! - `clip_visual.onnx` - CLIP image tower, `pixel_values [N,3,S,S]` to `image_embeds [N,D]`
//! - `visual_encoder.onnx` (optional) - `image_embeds [N,1,D]` to decoder memory `[N,P,H]`
//! - `caption_decoder.onnx` - `encoder_hidden_states [1,P,H]` + `input_ids` to `logits [1,T,V]`
//! - `tokenizer.json`
//!
//! With a visual encoder, feature extraction returns the encoded memory
//! (`VisualFeatures::Encoded`). Without one it returns the CLIP embeddings
//! and each embedding is the one-position memory.

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::RgbImage;
use ndarray::{s, Array2, Array3, ArrayD, Axis, Ix2, Ix3};
use ort::value::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::decoding::{beam_search, DecodingConfig, TokenScorer};
use super::onnx::{find_model_file, find_optional_file, last_position_logits, load_session, lock_session, Device, SharedSession};
use super::{Caption, CaptionBackend, VisualFeatures};
use crate::config::Options;
use crate::error::VqaError;
use crate::vision::{preprocess_batch, ImageNormalizer, NormalizerConfig, PreprocessConfig};

pub const CLIP_VISUAL_FILE: &str = "clip_visual.onnx";
pub const VISUAL_ENCODER_FILE: &str = "visual_encoder.onnx";
pub const CAPTION_DECODER_FILE: &str = "caption_decoder.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// GPT-2 style tokenizers use one marker for both start and end of text
pub const DEFAULT_SPECIAL_TOKEN: &str = "<|endoftext|>";

#[derive(Debug, Clone)]
pub struct ClipCaptionerConfig {
    pub model_dir: PathBuf,
    pub device: Device,
    pub intra_threads: usize,
    pub preprocess: PreprocessConfig,
    pub decoding: DecodingConfig,
    pub normalizer: NormalizerConfig,
    pub bos_token: String,
    pub eos_token: String,
}

impl ClipCaptionerConfig {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            device: Device::Cpu,
            intra_threads: 4,
            preprocess: PreprocessConfig::clip(),
            decoding: DecodingConfig::default(),
            normalizer: NormalizerConfig::default(),
            bos_token: DEFAULT_SPECIAL_TOKEN.to_string(),
            eos_token: DEFAULT_SPECIAL_TOKEN.to_string(),
        }
    }

    /// Build from flat options; `checkpoint` (or `model_dir`) is required
    pub fn from_options(options: &Options) -> crate::Result<Self> {
        let model_dir = match options.get_str("checkpoint")? {
            Some(dir) => dir,
            None => options
                .get_str("model_dir")?
                .ok_or_else(|| VqaError::Config("missing option 'checkpoint'".to_string()))?,
        };
        let base = Self::new(model_dir);

        let device = match options.get_str("device")? {
            Some(device) => device.parse()?,
            None => base.device,
        };

        Ok(Self {
            device,
            intra_threads: options.get_usize("intra_threads", base.intra_threads)?,
            preprocess: PreprocessConfig::from_options(options, base.preprocess)?,
            decoding: DecodingConfig::from_options(options)?,
            normalizer: NormalizerConfig::from_options(options)?,
            bos_token: options.get_or("bos_token", base.bos_token)?,
            eos_token: options.get_or("eos_token", base.eos_token)?,
            model_dir: base.model_dir,
        })
    }
}

/// CLIP image embeddings decoded by a captioning transformer
#[derive(Clone)]
pub struct ClipCaptioner {
    clip_visual: SharedSession,
    visual_encoder: Option<SharedSession>,
    decoder: SharedSession,
    tokenizer: Arc<Tokenizer>,
    normalizer: ImageNormalizer,
    preprocess: PreprocessConfig,
    decoding: DecodingConfig,
    bos_token_id: u32,
    eos_token_id: u32,
}

impl std::fmt::Debug for ClipCaptioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipCaptioner")
            .field("has_visual_encoder", &self.visual_encoder.is_some())
            .field("decoding", &self.decoding)
            .field("bos_token_id", &self.bos_token_id)
            .field("eos_token_id", &self.eos_token_id)
            .finish_non_exhaustive()
    }
}

impl ClipCaptioner {
    /// Load every session and the tokenizer once
    pub fn new(config: ClipCaptionerConfig) -> Result<Self> {
        let dir = &config.model_dir;
        let clip_path = find_model_file(dir, CLIP_VISUAL_FILE)?;
        let decoder_path = find_model_file(dir, CAPTION_DECODER_FILE)?;
        let tokenizer_path = find_model_file(dir, TOKENIZER_FILE)?;

        info!("Loading CLIP captioner from {}", dir.display());

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;
        let bos_token_id = tokenizer
            .token_to_id(&config.bos_token)
            .with_context(|| format!("Tokenizer has no BOS token '{}'", config.bos_token))?;
        let eos_token_id = tokenizer
            .token_to_id(&config.eos_token)
            .with_context(|| format!("Tokenizer has no EOS token '{}'", config.eos_token))?;

        let clip_visual = load_session(&clip_path, config.device, config.intra_threads)?;
        let visual_encoder = find_optional_file(dir, VISUAL_ENCODER_FILE)
            .map(|path| load_session(&path, config.device, config.intra_threads))
            .transpose()?;
        let decoder = load_session(&decoder_path, config.device, config.intra_threads)?;

        let normalizer = ImageNormalizer::new(config.normalizer.clone())?;

        info!(
            "CLIP captioner ready (visual encoder: {}, beam {}, {} per image)",
            visual_encoder.is_some(),
            config.decoding.beam_size,
            config.decoding.out_size
        );

        Ok(Self {
            clip_visual,
            visual_encoder,
            decoder,
            tokenizer: Arc::new(tokenizer),
            normalizer,
            preprocess: config.preprocess,
            decoding: config.decoding,
            bos_token_id,
            eos_token_id,
        })
    }

    pub fn from_options(options: &Options) -> Result<Self> {
        Self::new(ClipCaptionerConfig::from_options(options)?)
    }

    pub fn decoding(&self) -> &DecodingConfig {
        &self.decoding
    }

    /// Run the visual encoder over a whole batch of CLIP embeddings
    fn encode_embeddings(&self, encoder: &SharedSession, embeds: Array2<f32>) -> crate::Result<Array3<f32>> {
        let count = embeds.nrows();
        let mut session = lock_session(encoder, VqaError::FeatureExtraction)?;
        let input = Value::from_array(encoder_input(embeds)?).map_err(extraction_error)?;
        let outputs = session
            .run(ort::inputs!["image_embeds" => input])
            .map_err(extraction_error)?;
        let memory = outputs[0]
            .try_extract_array::<f32>()
            .map_err(extraction_error)?;
        encoded_memory(memory.to_owned(), count)
    }

    fn detokenize(&self, tokens: &[u32]) -> crate::Result<String> {
        let text = self
            .tokenizer
            .decode(tokens, true)
            .map_err(|e| VqaError::CaptionGeneration(format!("Decoding failed: {}", e)))?;
        Ok(text.trim().to_string())
    }
}

fn generation_error(e: impl std::fmt::Display) -> VqaError {
    VqaError::CaptionGeneration(e.to_string())
}

fn extraction_error(e: impl std::fmt::Display) -> VqaError {
    VqaError::FeatureExtraction(e.to_string())
}

/// `(N, D)` embeddings as an `(N, 1, D)` encoder input
fn encoder_input(embeds: Array2<f32>) -> crate::Result<Array3<f32>> {
    let (count, dim) = embeds.dim();
    embeds
        .into_shape_with_order((count, 1, dim))
        .map_err(extraction_error)
}

/// Check the encoder output is `(count, P, H)` memory
fn encoded_memory(memory: ArrayD<f32>, count: usize) -> crate::Result<Array3<f32>> {
    let memory = memory
        .into_dimensionality::<Ix3>()
        .map_err(|e| VqaError::FeatureExtraction(format!("visual encoder output: {}", e)))?;
    if memory.shape()[0] != count {
        return Err(VqaError::FeatureExtraction(format!(
            "visual encoder returned memory for {} images, expected {}",
            memory.shape()[0],
            count
        )));
    }
    Ok(memory)
}

/// Decoder memory `[1, P, H]` for image `index`
fn image_memory(features: &VisualFeatures, index: usize) -> crate::Result<Array3<f32>> {
    match features {
        VisualFeatures::Global(embeds) => Ok(embeds
            .slice(s![index..index + 1, ..])
            .to_owned()
            .insert_axis(Axis(1))),
        VisualFeatures::Encoded(memory) => Ok(memory.slice(s![index..index + 1, .., ..]).to_owned()),
        VisualFeatures::Regions(_) => Err(VqaError::CaptionGeneration(
            "CLIP captioner expects image embeddings or encoded memory".to_string(),
        )),
    }
}

/// Decoder forward pass conditioned on one image's memory
struct MemoryScorer<'a> {
    decoder: &'a SharedSession,
    memory: &'a Array3<f32>,
}

impl TokenScorer for MemoryScorer<'_> {
    fn next_token_logits(&self, prefix: &[u32]) -> crate::Result<Vec<f32>> {
        let ids: Vec<i64> = prefix.iter().map(|&t| t as i64).collect();
        let input_ids = Array2::from_shape_vec((1, ids.len()), ids).map_err(generation_error)?;

        let mut session = lock_session(self.decoder, VqaError::CaptionGeneration)?;
        let outputs = session
            .run(ort::inputs![
                "encoder_hidden_states" => Value::from_array(self.memory.clone()).map_err(generation_error)?,
                "input_ids" => Value::from_array(input_ids).map_err(generation_error)?
            ])
            .map_err(generation_error)?;
        let logits = outputs[0]
            .try_extract_array::<f32>()
            .map_err(generation_error)?;
        last_position_logits(&logits)
    }
}

#[async_trait]
impl CaptionBackend for ClipCaptioner {
    fn name(&self) -> &str {
        "clip"
    }

    fn normalizer(&self) -> &ImageNormalizer {
        &self.normalizer
    }

    fn extract_visual_features(&self, images: &[RgbImage]) -> crate::Result<VisualFeatures> {
        if images.is_empty() {
            return Ok(VisualFeatures::Global(Array2::zeros((0, 0))));
        }

        let pixel_values = preprocess_batch(images, &self.preprocess);
        debug!("CLIP input shape: {:?}", pixel_values.shape());

        let embeds = {
            let mut session = lock_session(&self.clip_visual, VqaError::FeatureExtraction)?;
            let input = Value::from_array(pixel_values).map_err(extraction_error)?;
            let outputs = session
                .run(ort::inputs!["pixel_values" => input])
                .map_err(extraction_error)?;
            let embeds = outputs[0]
                .try_extract_array::<f32>()
                .map_err(extraction_error)?
                .to_owned()
                .into_dimensionality::<Ix2>()
                .map_err(|e| VqaError::FeatureExtraction(format!("image_embeds: {}", e)))?;
            embeds
        };
        if embeds.nrows() != images.len() {
            return Err(VqaError::FeatureExtraction(format!(
                "expected {} embeddings, got {}",
                images.len(),
                embeds.nrows()
            )));
        }

        match &self.visual_encoder {
            Some(encoder) => {
                let memory = self.encode_embeddings(encoder, embeds)?;
                debug!("Visual encoder memory shape: {:?}", memory.shape());
                Ok(VisualFeatures::Encoded(memory))
            }
            None => Ok(VisualFeatures::Global(embeds)),
        }
    }

    fn generate_captions_from_features(&self, features: &VisualFeatures) -> crate::Result<Vec<Vec<Caption>>> {
        let count = features.num_images();
        let mut all = Vec::with_capacity(count);
        for index in 0..count {
            let memory = image_memory(features, index)?;
            let scorer = MemoryScorer {
                decoder: &self.decoder,
                memory: &memory,
            };
            let hypotheses = beam_search(&scorer, self.bos_token_id, self.eos_token_id, &self.decoding)?;

            let mut captions = Vec::with_capacity(hypotheses.len());
            for hyp in hypotheses {
                captions.push(Caption::with_confidence(
                    self.detokenize(&hyp.tokens)?,
                    hyp.confidence(),
                ));
            }
            all.push(captions);
        }
        Ok(all)
    }
}
