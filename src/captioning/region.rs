// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Object-region captioner
//!
//! A detector proposes regions per image; each region's appearance feature is
//! concatenated with six box-geometry values and decoded together with the
//! detected class names ("object tags") by a BERT-style caption decoder.
//!
//! Model directory layout:
//! - `detector.onnx` - `pixel_values [N,3,S,S]` to, in output order,
//!   `features [N,R,F]`, `boxes [N,R,4]` (x1, y1, x2, y2 in detector-input pixels),
//!   `scores [N,R]`, `class_ids [N,R]` (int64)
//! - `caption_decoder.onnx` - `img_feats [1,R,F+6]`, `img_mask [1,R]`,
//!   `od_label_ids [1,L]`, `input_ids [1,T]` to `logits [1,T,V]`
//! - `labelmap.json` - class names, as an array or `{"idx_to_label": {..}}`
//! - `tokenizer.json`

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::RgbImage;
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use ort::value::Value;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::decoding::{beam_search, DecodingConfig, TokenScorer};
use super::onnx::{find_model_file, last_position_logits, load_session, lock_session, Device, SharedSession};
use super::{Caption, CaptionBackend, RegionFeatures, VisualFeatures};
use crate::config::Options;
use crate::error::VqaError;
use crate::vision::{preprocess_batch, ImageNormalizer, NormalizerConfig, Placement, PreprocessConfig};

pub const DETECTOR_FILE: &str = "detector.onnx";
pub const CAPTION_DECODER_FILE: &str = "caption_decoder.onnx";
pub const LABELMAP_FILE: &str = "labelmap.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Number of geometry values appended to every region feature
pub const SPATIAL_DIM: usize = 6;

/// Detector input resolution
pub const DETECTOR_INPUT_SIZE: u32 = 600;

/// Class-id to class-name mapping for detector output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelMap {
    labels: HashMap<i64, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LabelMapFile {
    List(Vec<String>),
    Indexed { idx_to_label: HashMap<String, String> },
}

impl LabelMap {
    pub fn from_json_str(content: &str) -> Result<Self> {
        let file: LabelMapFile = serde_json::from_str(content).context("Invalid label map")?;
        let labels = match file {
            LabelMapFile::List(names) => names
                .into_iter()
                .enumerate()
                .map(|(i, name)| (i as i64, name))
                .collect(),
            LabelMapFile::Indexed { idx_to_label } => {
                let mut labels = HashMap::with_capacity(idx_to_label.len());
                for (idx, name) in idx_to_label {
                    let idx: i64 = idx
                        .parse()
                        .with_context(|| format!("Label map index '{}' is not an integer", idx))?;
                    labels.insert(idx, name);
                }
                labels
            }
        };
        Ok(Self { labels })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read label map {}", path.display()))?;
        Self::from_json_str(&content)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, class_id: i64) -> Option<&str> {
        self.labels.get(&class_id).map(String::as_str)
    }
}

/// Box geometry relative to an image of `width` x `height`
///
/// `[x1/w, y1/h, x2/w, y2/h, (x2-x1)/w, (y2-y1)/h]`
pub fn spatial_features(bbox: [f32; 4], width: f32, height: f32) -> [f32; SPATIAL_DIM] {
    let [x1, y1, x2, y2] = bbox;
    [
        x1 / width,
        y1 / height,
        x2 / width,
        y2 / height,
        (x2 - x1) / width,
        (y2 - y1) / height,
    ]
}

/// Indices of regions scoring at least `threshold`, best first, at most `max_regions`
pub fn select_regions(scores: &[f32], threshold: f32, max_regions: usize) -> Vec<usize> {
    let mut keep: Vec<usize> = (0..scores.len())
        .filter(|&i| scores[i] >= threshold)
        .collect();
    keep.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    keep.truncate(max_regions);
    keep
}

/// Region selection parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSelection {
    pub score_threshold: f32,
    pub max_regions: usize,
}

impl Default for RegionSelection {
    fn default() -> Self {
        Self {
            score_threshold: 0.2,
            max_regions: 50,
        }
    }
}

/// Turn raw detector output into zero-padded region features
///
/// `placements[i]` says how image `i` was fitted into the detector input;
/// box geometry is expressed relative to the source image.
pub fn assemble_regions(
    features: ArrayView3<f32>,
    boxes: ArrayView3<f32>,
    scores: ArrayView2<f32>,
    class_ids: ArrayView2<i64>,
    placements: &[Placement],
    label_map: &LabelMap,
    selection: &RegionSelection,
) -> crate::Result<RegionFeatures> {
    let (num_images, num_regions, feature_dim) = features.dim();
    if boxes.dim() != (num_images, num_regions, 4)
        || scores.dim() != (num_images, num_regions)
        || class_ids.dim() != (num_images, num_regions)
        || placements.len() != num_images
    {
        return Err(VqaError::FeatureExtraction(format!(
            "inconsistent detector outputs: features {:?}, boxes {:?}, scores {:?}, classes {:?}, {} images",
            features.shape(),
            boxes.shape(),
            scores.shape(),
            class_ids.shape(),
            placements.len()
        )));
    }

    let kept: Vec<Vec<usize>> = scores
        .axis_iter(Axis(0))
        .map(|row| {
            let row: Vec<f32> = row.to_vec();
            select_regions(&row, selection.score_threshold, selection.max_regions)
        })
        .collect();
    let max_kept = kept.iter().map(Vec::len).max().unwrap_or(0);

    let mut out = Array3::<f32>::zeros((num_images, max_kept, feature_dim + SPATIAL_DIM));
    let mut labels = Vec::with_capacity(num_images);

    for (img, regions) in kept.iter().enumerate() {
        let placement = &placements[img];
        let (width, height) = (placement.source_width as f32, placement.source_height as f32);
        let mut image_labels = Vec::with_capacity(regions.len());
        for (slot, &r) in regions.iter().enumerate() {
            out.slice_mut(s![img, slot, ..feature_dim])
                .assign(&features.slice(s![img, r, ..]));
            let bbox = [
                boxes[[img, r, 0]],
                boxes[[img, r, 1]],
                boxes[[img, r, 2]],
                boxes[[img, r, 3]],
            ];
            let bbox = placement.to_source(bbox);
            for (k, value) in spatial_features(bbox, width, height).into_iter().enumerate() {
                out[[img, slot, feature_dim + k]] = value;
            }
            let class_id = class_ids[[img, r]];
            image_labels.push(
                label_map
                    .label(class_id)
                    .map(str::to_string)
                    .unwrap_or_else(|| class_id.to_string()),
            );
        }
        labels.push(image_labels);
    }

    Ok(RegionFeatures {
        features: out,
        region_counts: kept.iter().map(Vec::len).collect(),
        labels,
    })
}

#[derive(Debug, Clone)]
pub struct RegionCaptionerConfig {
    pub model_dir: PathBuf,
    pub device: Device,
    pub intra_threads: usize,
    pub preprocess: PreprocessConfig,
    pub decoding: DecodingConfig,
    pub normalizer: NormalizerConfig,
    pub selection: RegionSelection,
    /// Feed detector class names to the decoder as object tags
    pub add_od_labels: bool,
    pub max_tag_tokens: usize,
    pub bos_token: String,
    pub eos_token: String,
}

impl RegionCaptionerConfig {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            device: Device::Cpu,
            intra_threads: 4,
            preprocess: PreprocessConfig::imagenet(DETECTOR_INPUT_SIZE),
            decoding: DecodingConfig::default(),
            normalizer: NormalizerConfig::default(),
            selection: RegionSelection::default(),
            add_od_labels: true,
            max_tag_tokens: 30,
            bos_token: "[CLS]".to_string(),
            eos_token: "[SEP]".to_string(),
        }
    }

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
        let preprocess = PreprocessConfig::from_options(options, base.preprocess)?;

        Ok(Self {
            device,
            intra_threads: options.get_usize("intra_threads", base.intra_threads)?,
            decoding: DecodingConfig::from_options(options)?,
            normalizer: NormalizerConfig::from_options(options)?,
            selection: RegionSelection {
                score_threshold: options.get_f32("score_threshold", base.selection.score_threshold)?,
                max_regions: options.get_usize("max_regions", base.selection.max_regions)?,
            },
            preprocess,
            add_od_labels: options.get_bool("add_od_labels", base.add_od_labels)?,
            max_tag_tokens: options.get_usize("max_tag_tokens", base.max_tag_tokens)?,
            bos_token: options.get_or("bos_token", base.bos_token)?,
            eos_token: options.get_or("eos_token", base.eos_token)?,
            model_dir: base.model_dir,
        })
    }
}

/// Region features plus object tags decoded into captions
#[derive(Clone)]
pub struct RegionCaptioner {
    detector: SharedSession,
    decoder: SharedSession,
    tokenizer: Arc<Tokenizer>,
    label_map: LabelMap,
    normalizer: ImageNormalizer,
    preprocess: PreprocessConfig,
    decoding: DecodingConfig,
    selection: RegionSelection,
    add_od_labels: bool,
    max_tag_tokens: usize,
    bos_token_id: u32,
    eos_token_id: u32,
}

impl std::fmt::Debug for RegionCaptioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionCaptioner")
            .field("labels", &self.label_map.len())
            .field("selection", &self.selection)
            .field("add_od_labels", &self.add_od_labels)
            .field("decoding", &self.decoding)
            .finish_non_exhaustive()
    }
}

impl RegionCaptioner {
    pub fn new(config: RegionCaptionerConfig) -> Result<Self> {
        let dir = &config.model_dir;
        let detector_path = find_model_file(dir, DETECTOR_FILE)?;
        let decoder_path = find_model_file(dir, CAPTION_DECODER_FILE)?;
        let labelmap_path = find_model_file(dir, LABELMAP_FILE)?;
        let tokenizer_path = find_model_file(dir, TOKENIZER_FILE)?;

        info!("Loading region captioner from {}", dir.display());

        let label_map = LabelMap::from_file(&labelmap_path)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;
        let bos_token_id = tokenizer
            .token_to_id(&config.bos_token)
            .with_context(|| format!("Tokenizer has no BOS token '{}'", config.bos_token))?;
        let eos_token_id = tokenizer
            .token_to_id(&config.eos_token)
            .with_context(|| format!("Tokenizer has no EOS token '{}'", config.eos_token))?;

        let detector = load_session(&detector_path, config.device, config.intra_threads)?;
        let decoder = load_session(&decoder_path, config.device, config.intra_threads)?;
        let normalizer = ImageNormalizer::new(config.normalizer.clone())?;

        info!(
            "Region captioner ready ({} classes, od labels: {})",
            label_map.len(),
            config.add_od_labels
        );

        Ok(Self {
            detector,
            decoder,
            tokenizer: Arc::new(tokenizer),
            label_map,
            normalizer,
            preprocess: config.preprocess,
            decoding: config.decoding,
            selection: config.selection,
            add_od_labels: config.add_od_labels,
            max_tag_tokens: config.max_tag_tokens,
            bos_token_id,
            eos_token_id,
        })
    }

    pub fn from_options(options: &Options) -> Result<Self> {
        Self::new(RegionCaptionerConfig::from_options(options)?)
    }

    /// Token ids for an image's object tags, always terminated by EOS
    fn tag_ids(&self, labels: &[String]) -> crate::Result<Vec<i64>> {
        let mut ids = Vec::new();
        if self.add_od_labels && !labels.is_empty() {
            let encoding = self
                .tokenizer
                .encode(labels.join(" "), false)
                .map_err(|e| VqaError::CaptionGeneration(format!("Failed to encode tags: {}", e)))?;
            ids.extend(
                encoding
                    .get_ids()
                    .iter()
                    .take(self.max_tag_tokens)
                    .map(|&id| id as i64),
            );
        }
        ids.push(self.eos_token_id as i64);
        Ok(ids)
    }
}

fn generation_error(e: impl std::fmt::Display) -> VqaError {
    VqaError::CaptionGeneration(e.to_string())
}

fn extraction_error(e: impl std::fmt::Display) -> VqaError {
    VqaError::FeatureExtraction(e.to_string())
}

struct RegionScorer<'a> {
    decoder: &'a SharedSession,
    img_feats: Array3<f32>,
    img_mask: Array2<i64>,
    tag_ids: Array2<i64>,
}

impl TokenScorer for RegionScorer<'_> {
    fn next_token_logits(&self, prefix: &[u32]) -> crate::Result<Vec<f32>> {
        let ids: Vec<i64> = prefix.iter().map(|&t| t as i64).collect();
        let input_ids = Array2::from_shape_vec((1, ids.len()), ids).map_err(generation_error)?;

        let mut session = lock_session(self.decoder, VqaError::CaptionGeneration)?;
        let outputs = session
            .run(ort::inputs![
                "img_feats" => Value::from_array(self.img_feats.clone()).map_err(generation_error)?,
                "img_mask" => Value::from_array(self.img_mask.clone()).map_err(generation_error)?,
                "od_label_ids" => Value::from_array(self.tag_ids.clone()).map_err(generation_error)?,
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
impl CaptionBackend for RegionCaptioner {
    fn name(&self) -> &str {
        "region"
    }

    fn normalizer(&self) -> &ImageNormalizer {
        &self.normalizer
    }

    fn extract_visual_features(&self, images: &[RgbImage]) -> crate::Result<VisualFeatures> {
        let pixel_values = preprocess_batch(images, &self.preprocess);
        let placements: Vec<Placement> = images
            .iter()
            .map(|image| {
                Placement::compute(
                    image.width(),
                    image.height(),
                    self.preprocess.size,
                    self.preprocess.resize_mode,
                )
            })
            .collect();

        let mut session = lock_session(&self.detector, VqaError::FeatureExtraction)?;
        let input = Value::from_array(pixel_values).map_err(extraction_error)?;
        let outputs = session
            .run(ort::inputs!["pixel_values" => input])
            .map_err(extraction_error)?;
        if outputs.len() < 4 {
            return Err(VqaError::FeatureExtraction(format!(
                "detector returned {} outputs, expected 4",
                outputs.len()
            )));
        }

        let features = outputs[0].try_extract_array::<f32>().map_err(extraction_error)?;
        let boxes = outputs[1].try_extract_array::<f32>().map_err(extraction_error)?;
        let scores = outputs[2].try_extract_array::<f32>().map_err(extraction_error)?;
        let class_ids = outputs[3].try_extract_array::<i64>().map_err(extraction_error)?;

        let regions = assemble_regions(
            features.into_dimensionality().map_err(extraction_error)?,
            boxes.into_dimensionality().map_err(extraction_error)?,
            scores.into_dimensionality().map_err(extraction_error)?,
            class_ids.into_dimensionality().map_err(extraction_error)?,
            &placements,
            &self.label_map,
            &self.selection,
        )?;
        debug!("Region counts: {:?}", regions.region_counts);

        Ok(VisualFeatures::Regions(regions))
    }

    fn generate_captions_from_features(&self, features: &VisualFeatures) -> crate::Result<Vec<Vec<Caption>>> {
        let VisualFeatures::Regions(regions) = features else {
            return Err(VqaError::CaptionGeneration(
                "region captioner expects region features".to_string(),
            ));
        };

        let max_regions = regions.features.shape()[1];
        let mut all = Vec::with_capacity(regions.region_counts.len());

        for (img, &count) in regions.region_counts.iter().enumerate() {
            let img_feats = regions.features.slice(s![img..img + 1, .., ..]).to_owned();
            let mut img_mask = Array2::<i64>::zeros((1, max_regions));
            img_mask.slice_mut(s![0, ..count]).fill(1);

            let labels = regions.labels.get(img).map(Vec::as_slice).unwrap_or_default();
            let tags = self.tag_ids(labels)?;
            let tag_ids = Array2::from_shape_vec((1, tags.len()), tags).map_err(generation_error)?;

            let scorer = RegionScorer {
                decoder: &self.decoder,
                img_feats,
                img_mask,
                tag_ids,
            };
            let hypotheses = beam_search(&scorer, self.bos_token_id, self.eos_token_id, &self.decoding)?;

            let mut captions = Vec::with_capacity(hypotheses.len());
            for hyp in hypotheses {
                let text = self
                    .tokenizer
                    .decode(&hyp.tokens, true)
                    .map_err(|e| VqaError::CaptionGeneration(format!("Decoding failed: {}", e)))?;
                captions.push(Caption::with_confidence(text.trim(), hyp.confidence()));
            }
            all.push(captions);
        }
        Ok(all)
    }
}
