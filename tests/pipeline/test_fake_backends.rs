// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Caption backend contract: degradation, length preservation, shape handling

use super::common::{solid_image, FixedCaptioner};
use aravqa::captioning::CaptionBackend;
use aravqa::dataset::{BaseRecord, InMemorySource, Metadata, RecordSource};
use aravqa::vision::ImageInput;
use aravqa::{CaptionAnnotator, OneOrMany, VqaError};
use std::path::PathBuf;
use std::sync::Arc;

fn images(n: u32) -> Vec<ImageInput> {
    (0..n).map(|i| ImageInput::from(solid_image(8 + i, 8))).collect()
}

#[tokio::test]
async fn test_extract_failure_skips_decoding() {
    let backend = FixedCaptioner::failing();
    let captions = backend.generate_captions(OneOrMany::Many(images(4))).await;

    assert_eq!(captions.len(), 4);
    assert!(captions.iter().all(Vec::is_empty));
    assert_eq!(backend.decode_calls(), 0);
}

#[tokio::test]
async fn test_try_generate_surfaces_the_error() {
    let backend = FixedCaptioner::failing();
    let err = backend.try_generate_captions(images(2)).await.unwrap_err();
    assert!(matches!(err, VqaError::FeatureExtraction(_)));
}

#[tokio::test]
async fn test_single_image_yields_one_list() {
    let backend = FixedCaptioner::new(&["a red square"]);
    let captions = backend
        .generate_captions(OneOrMany::One(ImageInput::from(solid_image(4, 4))))
        .await;
    assert_eq!(captions.len(), 1);
    assert_eq!(captions[0][0].text, "a red square");
}

#[tokio::test]
async fn test_empty_input_never_reaches_the_model() {
    let backend = FixedCaptioner::new(&["unused"]);
    let captions = backend.generate_captions(OneOrMany::Many(Vec::new())).await;
    assert!(captions.is_empty());
    assert_eq!(backend.decode_calls(), 0);
}

#[tokio::test]
async fn test_missing_file_fails_whole_batch() {
    let backend = FixedCaptioner::new(&["ok"]);
    let mut inputs = images(2);
    inputs.push(ImageInput::Path(PathBuf::from("/nonexistent/aravqa/missing.png")));

    let captions = backend.generate_captions(OneOrMany::Many(inputs)).await;
    assert_eq!(captions.len(), 3);
    assert!(captions.iter().all(Vec::is_empty));
}

#[tokio::test]
async fn test_per_image_isolates_failures() {
    let backend = FixedCaptioner::new(&["ok"]);
    let mut inputs = images(2);
    inputs.insert(1, ImageInput::Path(PathBuf::from("/nonexistent/aravqa/missing.png")));

    let captions = backend.generate_captions_per_image(inputs).await;
    assert_eq!(captions.len(), 3);
    assert_eq!(captions[0][0].text, "ok");
    assert!(captions[1].is_empty());
    assert_eq!(captions[2][0].text, "ok");
}

#[tokio::test]
async fn test_annotator_keeps_alignment_when_backend_fails() {
    let base: InMemorySource<BaseRecord> = (0..5i64)
        .map(|i| {
            BaseRecord::new(Metadata::new(i, i), "q").with_image(serde_json::json!([[0, 0], [0, 0]]))
        })
        .collect::<Vec<_>>()
        .into();

    let backend = Arc::new(FixedCaptioner::failing());
    let aux = CaptionAnnotator::new(backend.clone())
        .with_chunk_size(2)
        .annotate(&base)
        .await;

    assert_eq!(aux.len(), base.len());
    assert!(aux.records().iter().all(|r| r.captions.is_empty()));
    assert_eq!(backend.decode_calls(), 0);
}
