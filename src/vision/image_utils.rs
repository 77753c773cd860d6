// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Decoding helpers for encoded image payloads (files, HTTP bodies, data URLs)

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, ImageFormat};
use thiserror::Error;

use crate::error::VqaError;

/// Largest encoded payload accepted from a file, URL or data URL (10MB)
pub const MAX_ENCODED_BYTES: usize = 10 * 1024 * 1024;

/// Why an encoded payload could not become an image
///
/// Every variant surfaces to callers as `VqaError::InvalidImageData`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("encoded image is {size} bytes, limit is {limit}")]
    Oversized { size: usize, limit: usize },

    #[error("no image bytes")]
    Empty,

    #[error("bad base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("not a base64 data URL")]
    DataUrl,

    #[error("unrecognized image container")]
    UnknownFormat,

    #[error("{format:?} payload is corrupt: {reason}")]
    Corrupt { format: ImageFormat, reason: String },
}

impl From<DecodeError> for VqaError {
    fn from(err: DecodeError) -> Self {
        VqaError::InvalidImageData(err.to_string())
    }
}

/// A decoded image plus what was learned about its encoding
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub format: ImageFormat,
    pub encoded_len: usize,
}

impl DecodedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }
}

/// Sniff the container from its leading bytes and decode it
pub fn decode_bytes(bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
    match bytes.len() {
        0 => return Err(DecodeError::Empty),
        size if size > MAX_ENCODED_BYTES => {
            return Err(DecodeError::Oversized {
                size,
                limit: MAX_ENCODED_BYTES,
            })
        }
        _ => {}
    }

    let format = image::guess_format(bytes).map_err(|_| DecodeError::UnknownFormat)?;
    let image = image::load_from_memory_with_format(bytes, format).map_err(|e| {
        DecodeError::Corrupt {
            format,
            reason: e.to_string(),
        }
    })?;

    Ok(DecodedImage {
        image,
        format,
        encoded_len: bytes.len(),
    })
}

/// Decode a `data:image/<fmt>;base64,<payload>` URL without any I/O
pub fn decode_data_url(url: &str) -> Result<DecodedImage, DecodeError> {
    let (header, payload) = url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(','))
        .ok_or(DecodeError::DataUrl)?;
    if !header.ends_with(";base64") {
        return Err(DecodeError::DataUrl);
    }

    let payload = payload.trim();
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }
    decode_bytes(&STANDARD.decode(payload)?)
}

pub fn is_data_url(s: &str) -> bool {
    s.starts_with("data:image/")
}
