// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Shared fakes and helpers for the pipeline tests
#![allow(dead_code)]

use aravqa::captioning::{Caption, CaptionBackend, VisualFeatures};
use aravqa::error::{Result, VqaError};
use aravqa::vision::{ImageNormalizer, NormalizerConfig};
use aravqa::QaBackend;
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::Array2;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

static INIT: Once = Once::new();

/// Route library logs to the test harness (only once)
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Caption backend that returns the same captions for every image
pub struct FixedCaptioner {
    normalizer: ImageNormalizer,
    captions: Vec<Caption>,
    fail_extract: bool,
    pub extract_calls: AtomicUsize,
    pub decode_calls: AtomicUsize,
}

impl FixedCaptioner {
    pub fn new(captions: &[&str]) -> Self {
        Self {
            normalizer: ImageNormalizer::new(NormalizerConfig::default()).unwrap(),
            captions: captions.iter().map(|c| Caption::new(*c)).collect(),
            fail_extract: false,
            extract_calls: AtomicUsize::new(0),
            decode_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_extract: true,
            ..Self::new(&["never"])
        }
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptionBackend for FixedCaptioner {
    fn name(&self) -> &str {
        "fixed"
    }

    fn normalizer(&self) -> &ImageNormalizer {
        &self.normalizer
    }

    fn extract_visual_features(&self, images: &[RgbImage]) -> Result<VisualFeatures> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_extract {
            return Err(VqaError::FeatureExtraction("encoder exploded".to_string()));
        }
        Ok(VisualFeatures::Global(Array2::zeros((images.len(), 4))))
    }

    fn generate_captions_from_features(&self, features: &VisualFeatures) -> Result<Vec<Vec<Caption>>> {
        self.decode_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![self.captions.clone(); features.num_images()])
    }
}

/// QA backend that answers every question with the same text
pub struct StaticAnswerer(pub &'static str);

#[async_trait]
impl QaBackend for StaticAnswerer {
    fn name(&self) -> &str {
        "static"
    }

    async fn answer(&self, _question: &str) -> Result<String> {
        Ok(self.0.to_string())
    }
}

pub fn solid_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([200, 30, 30]))
}

pub fn png_bytes(image: &RgbImage) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// Serve one HTTP response on a loopback port and return its URL
pub async fn serve_once(status: &'static str, content_type: &'static str, body: Vec<u8>) -> String {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    );
    serve_raw(head, body).await
}

/// Serve a hand-written response head followed by `body`; write errors are
/// ignored since the client may hang up early
pub async fn serve_raw(head: String, body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = vec![0u8; 4096];
        let _ = stream.read(&mut request).await;

        if stream.write_all(head.as_bytes()).await.is_ok() {
            let _ = stream.write_all(&body).await;
        }
        stream.shutdown().await.ok();
    });

    format!("http://{}/image.png", addr)
}
