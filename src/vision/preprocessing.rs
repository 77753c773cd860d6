// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Resize, crop and normalize RGB images into encoder-ready NCHW tensors

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use ndarray::{s, Array3, Array4};

use crate::config::Options;
use crate::error::{Result, VqaError};

/// CLIP normalization mean values
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];

/// CLIP normalization std values
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// ImageNet normalization mean values
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet normalization std values
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Input resolution of ViT-B CLIP image towers
pub const CLIP_INPUT_SIZE: u32 = 224;

/// How an image is fitted into the square encoder input
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResizeMode {
    /// Resize to exact size (may distort aspect ratio)
    Stretch,
    /// Resize keeping aspect ratio with center crop
    CenterCrop,
    /// Resize keeping aspect ratio with padding
    Letterbox,
}

impl Default for ResizeMode {
    fn default() -> Self {
        Self::CenterCrop
    }
}

impl std::str::FromStr for ResizeMode {
    type Err = VqaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stretch" | "exact" => Ok(Self::Stretch),
            "center_crop" | "crop" => Ok(Self::CenterCrop),
            "letterbox" | "pad" => Ok(Self::Letterbox),
            other => Err(VqaError::Config(format!("unknown resize mode '{}'", other))),
        }
    }
}

/// Backend-specific preprocessing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessConfig {
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub resize_mode: ResizeMode,
}

impl PreprocessConfig {
    /// CLIP image processor defaults (224px, bicubic, center crop)
    pub fn clip() -> Self {
        Self {
            size: CLIP_INPUT_SIZE,
            mean: CLIP_MEAN,
            std: CLIP_STD,
            resize_mode: ResizeMode::CenterCrop,
        }
    }

    /// ImageNet statistics at an arbitrary resolution
    pub fn imagenet(size: u32) -> Self {
        Self {
            size,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            resize_mode: ResizeMode::Letterbox,
        }
    }

    /// Override `base` with `image_size` / `resize_mode` options when present
    pub fn from_options(options: &Options, base: Self) -> Result<Self> {
        let size = options.get_or("image_size", base.size)?;
        let resize_mode = match options.get_str("resize_mode")? {
            Some(mode) => mode.parse()?,
            None => base.resize_mode,
        };
        Ok(Self {
            size,
            resize_mode,
            ..base
        })
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self::clip()
    }
}

/// Preprocess one image into a `(3, size, size)` tensor
pub fn preprocess_image(image: &RgbImage, config: &PreprocessConfig) -> Array3<f32> {
    let resized = resize_for_encoder(
        &DynamicImage::ImageRgb8(image.clone()),
        config.size,
        config.resize_mode,
    );
    let rgb = resized.to_rgb8();

    let size = config.size as usize;
    let mut tensor = Array3::zeros((3, size, size));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            let normalized = (pixel[c] as f32 / 255.0 - config.mean[c]) / config.std[c];
            tensor[[c, y as usize, x as usize]] = normalized;
        }
    }

    tensor
}

/// Preprocess a batch into an NCHW tensor `(n, 3, size, size)`
pub fn preprocess_batch(images: &[RgbImage], config: &PreprocessConfig) -> Array4<f32> {
    let size = config.size as usize;
    let mut batch = Array4::zeros((images.len(), 3, size, size));
    for (i, image) in images.iter().enumerate() {
        batch
            .slice_mut(s![i, .., .., ..])
            .assign(&preprocess_image(image, config));
    }
    batch
}

/// Where a source image lands inside the square encoder input
///
/// The image is resized to `resized_width` x `resized_height` and its top-left
/// corner placed at `(offset_x, offset_y)`. Offsets are negative when the
/// resized image is cropped and positive when it is padded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub source_width: u32,
    pub source_height: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub offset_x: i64,
    pub offset_y: i64,
}

impl Placement {
    pub fn compute(source_width: u32, source_height: u32, target_size: u32, mode: ResizeMode) -> Self {
        if source_width == 0 || source_height == 0 {
            return Self {
                source_width: target_size,
                source_height: target_size,
                resized_width: target_size,
                resized_height: target_size,
                offset_x: 0,
                offset_y: 0,
            };
        }

        let (w, h, t) = (source_width as f32, source_height as f32, target_size as f32);
        let (resized_width, resized_height) = match mode {
            ResizeMode::Stretch => (target_size, target_size),
            ResizeMode::CenterCrop => {
                // cover the target, then crop the overflow
                let scale = (t / w).max(t / h);
                (
                    ((w * scale).round() as u32).max(target_size),
                    ((h * scale).round() as u32).max(target_size),
                )
            }
            ResizeMode::Letterbox => {
                let scale = (t / w).min(t / h);
                (
                    ((w * scale).round() as u32).clamp(1, target_size),
                    ((h * scale).round() as u32).clamp(1, target_size),
                )
            }
        };
        let centered = |resized: u32| (i64::from(target_size) - i64::from(resized)) / 2;

        Self {
            source_width,
            source_height,
            resized_width,
            resized_height,
            offset_x: centered(resized_width),
            offset_y: centered(resized_height),
        }
    }

    /// Map an `[x1, y1, x2, y2]` box from encoder-input pixels back to source
    /// pixels, clamped to the source image
    pub fn to_source(&self, bbox: [f32; 4]) -> [f32; 4] {
        let sx = self.resized_width as f32 / self.source_width as f32;
        let sy = self.resized_height as f32 / self.source_height as f32;
        let (max_x, max_y) = (self.source_width as f32, self.source_height as f32);
        let x = |v: f32| ((v - self.offset_x as f32) / sx).clamp(0.0, max_x);
        let y = |v: f32| ((v - self.offset_y as f32) / sy).clamp(0.0, max_y);
        [x(bbox[0]), y(bbox[1]), x(bbox[2]), y(bbox[3])]
    }
}

/// Resize image to target size using specified mode
pub fn resize_for_encoder(image: &DynamicImage, target_size: u32, mode: ResizeMode) -> DynamicImage {
    let (orig_w, orig_h) = image.dimensions();

    if orig_w == 0 || orig_h == 0 {
        return DynamicImage::ImageRgb8(RgbImage::from_pixel(
            target_size,
            target_size,
            Rgb([128, 128, 128]),
        ));
    }

    let placement = Placement::compute(orig_w, orig_h, target_size, mode);
    let resized = image.resize_exact(
        placement.resized_width,
        placement.resized_height,
        FilterType::CatmullRom,
    );

    match mode {
        ResizeMode::Stretch => resized,
        ResizeMode::CenterCrop => resized.crop_imm(
            (-placement.offset_x) as u32,
            (-placement.offset_y) as u32,
            target_size,
            target_size,
        ),
        ResizeMode::Letterbox => {
            let mut output = RgbImage::from_pixel(target_size, target_size, Rgb([128, 128, 128]));
            image::imageops::replace(&mut output, &resized.to_rgb8(), placement.offset_x, placement.offset_y);
            DynamicImage::ImageRgb8(output)
        }
    }
}
