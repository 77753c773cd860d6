// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Image normalization across input variants, including local files and URLs

use super::common::{png_bytes, serve_once, serve_raw, solid_image};
use aravqa::vision::{ImageInput, ImageNormalizer, NormalizerConfig, MAX_ENCODED_BYTES};
use aravqa::VqaError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ndarray::{Array2, Array3};
use std::io::Write;

fn normalizer() -> ImageNormalizer {
    ImageNormalizer::new(NormalizerConfig {
        timeout_secs: 5,
        ..NormalizerConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_all_variants_share_one_shape() {
    let image = solid_image(6, 4);
    let png = png_bytes(&image);

    let mut file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
    file.write_all(&png).unwrap();

    let data_url = format!("data:image/png;base64,{}", STANDARD.encode(&png));
    let pixels = Array3::from_shape_vec((4, 6, 3), image.as_raw().clone()).unwrap();
    let tensor = pixels.mapv(f32::from).permuted_axes([2, 0, 1]).to_owned();

    let inputs = vec![
        ImageInput::from(image.clone()),
        ImageInput::Encoded(png.clone()),
        ImageInput::Path(file.path().to_path_buf()),
        ImageInput::from(data_url),
        ImageInput::Pixels(pixels),
        ImageInput::ChannelFirst(tensor),
        ImageInput::Gray(Array2::from_elem((4, 6), 128u8)),
    ];

    let results = normalizer().normalize_all(inputs).await;
    assert_eq!(results.len(), 7);
    for (i, result) in results.into_iter().enumerate() {
        let rgb = result.unwrap_or_else(|e| panic!("variant {} failed: {}", i, e));
        assert_eq!(rgb.dimensions(), (6, 4), "variant {}", i);
        if i < 6 {
            assert_eq!(rgb, image, "variant {}", i);
        }
    }
}

#[tokio::test]
async fn test_url_is_fetched() {
    let image = solid_image(5, 3);
    let url = serve_once("200 OK", "image/png", png_bytes(&image)).await;

    let rgb = normalizer().normalize(ImageInput::from(url.as_str())).await.unwrap();
    assert_eq!(rgb, image);
}

#[tokio::test]
async fn test_url_error_status_is_unavailable() {
    let url = serve_once("404 Not Found", "text/plain", b"missing".to_vec()).await;
    let err = normalizer().normalize(ImageInput::from(url)).await.unwrap_err();
    assert!(matches!(err, VqaError::SourceUnavailable { .. }));
}

#[tokio::test]
async fn test_url_with_non_image_body_is_invalid() {
    let url = serve_once("200 OK", "text/html", b"<html></html>".to_vec()).await;
    let err = normalizer().normalize(ImageInput::from(url)).await.unwrap_err();
    assert!(matches!(err, VqaError::InvalidImageData(_)));
}

#[tokio::test]
async fn test_missing_path_is_unavailable() {
    let err = normalizer()
        .normalize(ImageInput::from("/nonexistent/aravqa/photo.jpg"))
        .await
        .unwrap_err();
    assert!(matches!(err, VqaError::SourceUnavailable { .. }));
}

#[test]
fn test_unsupported_json_is_rejected() {
    let err = ImageInput::try_from(&serde_json::json!({"bytes": "..."})).unwrap_err();
    assert!(matches!(err, VqaError::UnsupportedInputType(_)));
}

#[tokio::test]
async fn test_url_declaring_oversized_body_is_rejected() {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        MAX_ENCODED_BYTES + 1
    );
    let url = serve_raw(head, b"\x89PNG".to_vec()).await;
    let err = normalizer().normalize(ImageInput::from(url)).await.unwrap_err();
    assert!(matches!(err, VqaError::InvalidImageData(_)), "{}", err);
}

#[tokio::test]
async fn test_url_streaming_past_limit_is_rejected() {
    // no Content-Length: the body runs until the server closes
    let head = "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nConnection: close\r\n\r\n".to_string();
    let url = serve_raw(head, vec![0u8; MAX_ENCODED_BYTES + 4096]).await;
    let err = normalizer().normalize(ImageInput::from(url)).await.unwrap_err();
    assert!(matches!(err, VqaError::InvalidImageData(_)), "{}", err);
}
