// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Image normalization
//!
//! Every caption backend accepts images in several shapes (decoded images,
//! file paths, URLs, raw pixel arrays, channel-first tensors) and converts
//! them to one canonical `RgbImage` before preprocessing. Network fetches are
//! never cached: normalizing the same URL twice downloads it twice.

use futures::future::join_all;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use ndarray::{Array2, Array3};
use reqwest::Client;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use super::image_utils::{decode_bytes, decode_data_url, is_data_url, DecodeError, MAX_ENCODED_BYTES};
use crate::config::Options;
use crate::error::{Result, VqaError};

/// Supported image representations
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// An already-decoded image in any color type
    Decoded(DynamicImage),
    /// Local file path
    Path(PathBuf),
    /// Remote `http`/`https` location
    Url(String),
    /// Encoded file bytes (PNG, JPEG, ...)
    Encoded(Vec<u8>),
    /// Grayscale pixel grid `(height, width)`
    Gray(Array2<u8>),
    /// Channel-last pixel grid `(height, width, channels)` with 1, 3 or 4 channels
    Pixels(Array3<u8>),
    /// Channel-first tensor `(3, height, width)` in byte range
    ChannelFirst(Array3<f32>),
}

impl ImageInput {
    /// Short name of the variant, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decoded(_) => "decoded",
            Self::Path(_) => "path",
            Self::Url(_) => "url",
            Self::Encoded(_) => "encoded",
            Self::Gray(_) => "gray",
            Self::Pixels(_) => "pixels",
            Self::ChannelFirst(_) => "channel_first",
        }
    }

    /// Classify a string: `http` prefix or an inline `data:image/` URL is a
    /// URL, anything else is a local path
    pub fn from_location(s: &str) -> Self {
        if s.starts_with("http") || is_data_url(s) {
            Self::Url(s.to_string())
        } else {
            Self::Path(PathBuf::from(s))
        }
    }
}

impl std::str::FromStr for ImageInput {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from_location(s))
    }
}

impl From<&str> for ImageInput {
    fn from(s: &str) -> Self {
        Self::from_location(s)
    }
}

impl From<String> for ImageInput {
    fn from(s: String) -> Self {
        Self::from_location(&s)
    }
}

impl From<PathBuf> for ImageInput {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<DynamicImage> for ImageInput {
    fn from(image: DynamicImage) -> Self {
        Self::Decoded(image)
    }
}

impl From<RgbImage> for ImageInput {
    fn from(image: RgbImage) -> Self {
        Self::Decoded(DynamicImage::ImageRgb8(image))
    }
}

impl From<Array3<u8>> for ImageInput {
    fn from(pixels: Array3<u8>) -> Self {
        Self::Pixels(pixels)
    }
}

impl From<Array3<f32>> for ImageInput {
    fn from(tensor: Array3<f32>) -> Self {
        Self::ChannelFirst(tensor)
    }
}

impl TryFrom<&Value> for ImageInput {
    type Error = VqaError;

    /// Interpret the `image` field of a dataset record
    ///
    /// Strings follow the location rule, nested numeric arrays of rank 2 or 3
    /// are pixel grids. Everything else is unsupported.
    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Self::from_location(s)),
            Value::Array(_) => json_pixels(value),
            Value::Null => Err(VqaError::UnsupportedInputType("null".to_string())),
            Value::Bool(_) => Err(VqaError::UnsupportedInputType("bool".to_string())),
            Value::Number(_) => Err(VqaError::UnsupportedInputType("number".to_string())),
            Value::Object(_) => Err(VqaError::UnsupportedInputType("object".to_string())),
        }
    }
}

fn json_rank(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.first().map(json_rank).unwrap_or(0),
        _ => 0,
    }
}

fn json_byte(value: &Value) -> Result<u8> {
    value
        .as_u64()
        .filter(|v| *v <= 255)
        .map(|v| v as u8)
        .ok_or_else(|| VqaError::InvalidImageData(format!("pixel value out of range: {}", value)))
}

fn json_pixels(value: &Value) -> Result<ImageInput> {
    let rank = json_rank(value);
    let rows = value.as_array().map(Vec::as_slice).unwrap_or_default();
    if rows.is_empty() {
        return Err(VqaError::InvalidImageData("empty pixel array".to_string()));
    }

    let ragged = || VqaError::InvalidImageData("ragged pixel array".to_string());

    match rank {
        2 => {
            let height = rows.len();
            let width = rows[0].as_array().map(Vec::len).unwrap_or(0);
            let mut data = Vec::with_capacity(height * width);
            for row in rows {
                let row = row.as_array().filter(|r| r.len() == width).ok_or_else(ragged)?;
                for v in row {
                    data.push(json_byte(v)?);
                }
            }
            let grid = Array2::from_shape_vec((height, width), data)
                .map_err(|e| VqaError::InvalidImageData(e.to_string()))?;
            Ok(ImageInput::Gray(grid))
        }
        3 => {
            let height = rows.len();
            let first_row = rows[0].as_array().map(Vec::as_slice).unwrap_or_default();
            let width = first_row.len();
            let channels = first_row
                .first()
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            let mut data = Vec::with_capacity(height * width * channels);
            for row in rows {
                let row = row.as_array().filter(|r| r.len() == width).ok_or_else(ragged)?;
                for px in row {
                    let px = px.as_array().filter(|p| p.len() == channels).ok_or_else(ragged)?;
                    for v in px {
                        data.push(json_byte(v)?);
                    }
                }
            }
            let grid = Array3::from_shape_vec((height, width, channels), data)
                .map_err(|e| VqaError::InvalidImageData(e.to_string()))?;
            Ok(ImageInput::Pixels(grid))
        }
        other => Err(VqaError::UnsupportedInputType(format!(
            "array of rank {}",
            other
        ))),
    }
}

/// Network settings for URL inputs
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Per-request timeout for URL fetches
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: format!("aravqa/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl NormalizerConfig {
    pub fn from_options(options: &Options) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            timeout_secs: options.get_or("fetch_timeout_secs", defaults.timeout_secs)?,
            user_agent: options.get_or("user_agent", defaults.user_agent)?,
        })
    }
}

/// Converts any `ImageInput` into an RGB pixel grid
#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    client: Client,
}

impl ImageNormalizer {
    pub fn new(config: NormalizerConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self { client })
    }

    /// Normalize a single image to RGB
    pub async fn normalize(&self, input: ImageInput) -> Result<RgbImage> {
        match input {
            ImageInput::Decoded(image) => Ok(image.to_rgb8()),
            ImageInput::Path(path) => {
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|e| VqaError::unavailable(path.display().to_string(), e))?;
                let decoded = decode_bytes(&bytes)?;
                let (width, height) = decoded.dimensions();
                debug!(
                    "Loaded {} ({}x{}, {:?})",
                    path.display(),
                    width,
                    height,
                    decoded.format
                );
                Ok(decoded.image.to_rgb8())
            }
            ImageInput::Url(location) if is_data_url(&location) => {
                Ok(decode_data_url(&location)?.image.to_rgb8())
            }
            ImageInput::Url(location) => {
                let bytes = self.fetch(&location).await?;
                let decoded = decode_bytes(&bytes)?;
                let (width, height) = decoded.dimensions();
                debug!(
                    "Fetched {} ({}x{}, {} bytes)",
                    location, width, height, decoded.encoded_len
                );
                Ok(decoded.image.to_rgb8())
            }
            ImageInput::Encoded(bytes) => {
                Ok(decode_bytes(&bytes)?.image.to_rgb8())
            }
            ImageInput::Gray(grid) => gray_to_rgb(grid),
            ImageInput::Pixels(pixels) => pixels_to_rgb(pixels),
            ImageInput::ChannelFirst(tensor) => channel_first_to_rgb(tensor),
        }
    }

    /// Normalize a batch concurrently; one result per input, order preserved
    pub async fn normalize_all(&self, inputs: Vec<ImageInput>) -> Vec<Result<RgbImage>> {
        join_all(inputs.into_iter().map(|input| self.normalize(input))).await
    }

    /// Download an encoded image, refusing bodies over `MAX_ENCODED_BYTES`
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        url::Url::parse(location).map_err(|e| VqaError::unavailable(location, e))?;

        let mut response = self
            .client
            .get(location)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| VqaError::unavailable(location, e))?;

        let oversized = |size: usize| DecodeError::Oversized {
            size,
            limit: MAX_ENCODED_BYTES,
        };
        if let Some(declared) = response.content_length() {
            if declared > MAX_ENCODED_BYTES as u64 {
                return Err(oversized(usize::try_from(declared).unwrap_or(usize::MAX)).into());
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| VqaError::unavailable(location, e))?
        {
            if body.len() + chunk.len() > MAX_ENCODED_BYTES {
                return Err(oversized(body.len() + chunk.len()).into());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

fn ensure_area(height: usize, width: usize) -> Result<()> {
    if height == 0 || width == 0 {
        return Err(VqaError::InvalidImageData(format!(
            "empty pixel array ({}x{})",
            height, width
        )));
    }
    Ok(())
}

/// Expand a grayscale grid to RGB
pub fn gray_to_rgb(grid: Array2<u8>) -> Result<RgbImage> {
    let (height, width) = grid.dim();
    ensure_area(height, width)?;
    let data: Vec<u8> = grid.iter().copied().collect();
    let gray = GrayImage::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| VqaError::InvalidImageData("gray buffer size mismatch".to_string()))?;
    Ok(DynamicImage::ImageLuma8(gray).to_rgb8())
}

/// Interpret a channel-last `(height, width, channels)` grid as an image
pub fn pixels_to_rgb(pixels: Array3<u8>) -> Result<RgbImage> {
    let (height, width, channels) = pixels.dim();
    ensure_area(height, width)?;
    let data: Vec<u8> = pixels.iter().copied().collect();
    let (w, h) = (width as u32, height as u32);
    let mismatch = || VqaError::InvalidImageData("pixel buffer size mismatch".to_string());

    match channels {
        1 => {
            let gray = GrayImage::from_raw(w, h, data).ok_or_else(mismatch)?;
            Ok(DynamicImage::ImageLuma8(gray).to_rgb8())
        }
        3 => RgbImage::from_raw(w, h, data).ok_or_else(mismatch),
        4 => {
            let rgba = RgbaImage::from_raw(w, h, data).ok_or_else(mismatch)?;
            Ok(DynamicImage::ImageRgba8(rgba).to_rgb8())
        }
        n => Err(VqaError::InvalidImageData(format!(
            "expected 1, 3 or 4 channels, got {}",
            n
        ))),
    }
}

/// Permute a `(3, height, width)` tensor to channel-last and cast to bytes
pub fn channel_first_to_rgb(tensor: Array3<f32>) -> Result<RgbImage> {
    let (channels, height, width) = tensor.dim();
    if channels != 3 {
        return Err(VqaError::InvalidImageData(format!(
            "channel-first tensor must have 3 channels, got {}",
            channels
        )));
    }
    ensure_area(height, width)?;
    let hwc = tensor.permuted_axes([1, 2, 0]);
    let data: Vec<u8> = hwc.iter().map(|v| *v as u8).collect();
    RgbImage::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| VqaError::InvalidImageData("tensor buffer size mismatch".to_string()))
}

/// View an RGB image as a `(height, width, 3)` array
pub fn rgb_to_array(image: &RgbImage) -> Array3<u8> {
    let (width, height) = image.dimensions();
    Array3::from_shape_vec(
        (height as usize, width as usize, 3),
        image.as_raw().clone(),
    )
    .unwrap_or_else(|_| Array3::zeros((height as usize, width as usize, 3)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use serde_json::json;

    fn normalizer() -> ImageNormalizer {
        ImageNormalizer::new(NormalizerConfig::default()).unwrap()
    }

    #[test]
    fn test_location_prefix_rule() {
        assert!(matches!(
            ImageInput::from("http://example.com/a.png"),
            ImageInput::Url(_)
        ));
        assert!(matches!(
            ImageInput::from("https://example.com/a.png"),
            ImageInput::Url(_)
        ));
        assert!(matches!(ImageInput::from("images/a.png"), ImageInput::Path(_)));
    }

    #[test]
    fn test_json_string_is_location() {
        let input = ImageInput::try_from(&json!("COCO_val2014_000000000042.jpg")).unwrap();
        assert_eq!(input.kind(), "path");
    }

    #[test]
    fn test_json_unsupported_kinds() {
        for (value, name) in [
            (json!(null), "null"),
            (json!(true), "bool"),
            (json!(42), "number"),
            (json!({"bytes": "..."}), "object"),
        ] {
            match ImageInput::try_from(&value) {
                Err(VqaError::UnsupportedInputType(t)) => assert_eq!(t, name),
                other => panic!("expected UnsupportedInputType, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_json_rank_three_pixels() {
        let value = json!([[[255, 0, 0], [0, 255, 0]]]);
        let input = ImageInput::try_from(&value).unwrap();
        match input {
            ImageInput::Pixels(p) => assert_eq!(p.dim(), (1, 2, 3)),
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    #[test]
    fn test_json_rank_one_is_unsupported() {
        let result = ImageInput::try_from(&json!([1, 2, 3]));
        assert!(matches!(result, Err(VqaError::UnsupportedInputType(_))));
    }

    #[test]
    fn test_json_ragged_pixels() {
        let result = ImageInput::try_from(&json!([[1, 2], [3]]));
        assert!(matches!(result, Err(VqaError::InvalidImageData(_))));
    }

    #[test]
    fn test_json_pixel_out_of_range() {
        let result = ImageInput::try_from(&json!([[1, 300]]));
        assert!(matches!(result, Err(VqaError::InvalidImageData(_))));
    }

    #[test]
    fn test_pixels_rgba_drops_alpha() {
        let mut pixels = Array3::<u8>::zeros((2, 2, 4));
        pixels[[0, 0, 0]] = 200;
        pixels[[0, 0, 3]] = 255;
        let rgb = pixels_to_rgb(pixels).unwrap();
        assert_eq!(rgb.dimensions(), (2, 2));
        assert_eq!(rgb.get_pixel(0, 0)[0], 200);
    }

    #[test]
    fn test_pixels_bad_channel_count() {
        let pixels = Array3::<u8>::zeros((2, 2, 2));
        assert!(matches!(
            pixels_to_rgb(pixels),
            Err(VqaError::InvalidImageData(_))
        ));
    }

    #[test]
    fn test_channel_first_is_permuted() {
        let mut tensor = Array3::<f32>::zeros((3, 2, 4));
        tensor[[0, 1, 3]] = 10.0;
        tensor[[2, 1, 3]] = 30.0;
        let rgb = channel_first_to_rgb(tensor).unwrap();
        assert_eq!(rgb.dimensions(), (4, 2));
        assert_eq!(*rgb.get_pixel(3, 1), Rgb([10, 0, 30]));
    }

    #[test]
    fn test_channel_first_requires_three_channels() {
        let tensor = Array3::<f32>::zeros((1, 2, 2));
        assert!(channel_first_to_rgb(tensor).is_err());
    }

    #[test]
    fn test_zero_area_rejected_for_every_grid() {
        let gray = ImageInput::try_from(&json!([[], []])).unwrap();
        assert_eq!(gray.kind(), "gray");
        let ImageInput::Gray(grid) = gray else { unreachable!() };
        assert!(matches!(gray_to_rgb(grid), Err(VqaError::InvalidImageData(_))));

        assert!(matches!(
            channel_first_to_rgb(Array3::zeros((3, 0, 5))),
            Err(VqaError::InvalidImageData(_))
        ));
        assert!(matches!(
            pixels_to_rgb(Array3::zeros((0, 5, 3))),
            Err(VqaError::InvalidImageData(_))
        ));
        assert!(matches!(
            gray_to_rgb(Array2::zeros((4, 0))),
            Err(VqaError::InvalidImageData(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_area_json_grid_fails_normalize() {
        let input = ImageInput::try_from(&json!([[], []])).unwrap();
        let result = normalizer().normalize(input).await;
        assert!(matches!(result, Err(VqaError::InvalidImageData(_))));
    }

    #[test]
    fn test_rgb_array_roundtrip_shape() {
        let img = RgbImage::from_pixel(5, 3, Rgb([1, 2, 3]));
        let arr = rgb_to_array(&img);
        assert_eq!(arr.dim(), (3, 5, 3));
        assert_eq!(arr[[2, 4, 2]], 3);
    }

    #[tokio::test]
    async fn test_missing_path_is_source_unavailable() {
        let result = normalizer()
            .normalize(ImageInput::Path(PathBuf::from("/nonexistent/img.png")))
            .await;
        assert!(matches!(result, Err(VqaError::SourceUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_url_is_source_unavailable() {
        let result = normalizer()
            .normalize(ImageInput::Url("http://127.0.0.1:59999/img.png".to_string()))
            .await;
        assert!(matches!(result, Err(VqaError::SourceUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_garbage_bytes_are_invalid_image_data() {
        let result = normalizer()
            .normalize(ImageInput::Encoded(vec![0, 1, 2, 3, 4, 5]))
            .await;
        assert!(matches!(result, Err(VqaError::InvalidImageData(_))));
    }

    #[tokio::test]
    async fn test_normalize_all_isolates_failures() {
        let inputs = vec![
            ImageInput::from(RgbImage::from_pixel(2, 2, Rgb([9, 9, 9]))),
            ImageInput::Encoded(vec![0, 0, 0, 0]),
            ImageInput::Pixels(Array3::zeros((2, 2, 3))),
        ];
        let results = normalizer().normalize_all(inputs).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }
}
