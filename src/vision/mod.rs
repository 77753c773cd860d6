// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Image handling shared by every caption backend
//!
//! - `normalizer` - converts paths, URLs, arrays and tensors into RGB images
//! - `preprocessing` - resize/crop/normalize into NCHW encoder input
//! - `image_utils` - encoded-bytes and data URL decoding

pub mod image_utils;
pub mod normalizer;
pub mod preprocessing;

pub use image_utils::{decode_bytes, decode_data_url, DecodeError, DecodedImage, MAX_ENCODED_BYTES};
pub use normalizer::{ImageInput, ImageNormalizer, NormalizerConfig};
pub use preprocessing::{preprocess_batch, preprocess_image, Placement, PreprocessConfig, ResizeMode};
