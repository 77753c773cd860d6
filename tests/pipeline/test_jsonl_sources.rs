// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// JSON Lines sources and the positional join

use aravqa::dataset::{
    AuxiliaryRecord, BaseRecord, BatchCollator, DataLoader, DualSourceDataset, JoinPolicy,
    JsonlSource, RecordId, RecordSource,
};
use aravqa::VqaError;
use std::io::Write;
use tempfile::TempDir;

const BASE: &str = r#"{"metadata": {"question_id": 458752000, "image_id": 458752}, "image": "/data/COCO_val2014_000000458752.jpg", "question": "ما لون القميص؟", "answers": [{"answer": "أحمر", "answer_id": 1}, {"answer": "احمر"}, {"answer": "أحمر"}], "multiple_choice_answer": "أحمر", "captions": [{"caption": "رجل يرتدي قميصا أحمر"}]}

{"metadata": {"question_id": "q-2", "image_id": "img-2"}, "image": "/data/2.jpg", "question": "كم عدد القطط؟"}
"#;

const AUX: &str = r#"{"captions": [{"caption": "a man in a red shirt", "confidence": 0.81}]}
{"captions": []}
"#;

fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

#[tokio::test]
async fn test_join_two_jsonl_files() {
    let dir = TempDir::new().unwrap();
    let base = JsonlSource::<BaseRecord>::open(write(&dir, "base.jsonl", BASE)).await.unwrap();
    let aux = JsonlSource::<AuxiliaryRecord>::open(write(&dir, "aux.jsonl", AUX)).await.unwrap();
    assert_eq!(base.len(), 2);

    let dataset = DualSourceDataset::new(base, aux).unwrap();
    let batch = DataLoader::new(&dataset, BatchCollator::default(), 4)
        .unwrap()
        .next()
        .unwrap()
        .unwrap();

    assert_eq!(batch.question_id, vec![RecordId::Int(458752000), RecordId::from("q-2")]);
    assert_eq!(batch.answers[0], vec!["أحمر", "احمر", "أحمر"]);
    assert!(batch.answers[1].is_empty());
    assert!(batch.prompts[0].contains("رجل يرتدي قميصا أحمر"));
    assert!(batch.prompts[0].contains("a man in a red shirt"));
    assert_eq!(batch.prompts[1], "كم عدد القطط؟");
}

#[tokio::test]
async fn test_length_mismatch_is_rejected() {
    let dir = TempDir::new().unwrap();
    let base = JsonlSource::<BaseRecord>::open(write(&dir, "base.jsonl", BASE)).await.unwrap();
    let aux = JsonlSource::<AuxiliaryRecord>::open(write(&dir, "aux.jsonl", "{\"captions\": []}\n"))
        .await
        .unwrap();

    let err = DualSourceDataset::new(base, aux).unwrap_err();
    assert!(matches!(err, VqaError::MalformedExample { index: None, .. }));
}

#[tokio::test]
async fn test_longer_auxiliary_allowed_by_policy() {
    let dir = TempDir::new().unwrap();
    let base = JsonlSource::<BaseRecord>::open(write(&dir, "base.jsonl", BASE)).await.unwrap();
    let aux_text = format!("{}{}", AUX, "{\"captions\": []}\n");
    let aux = JsonlSource::<AuxiliaryRecord>::open(write(&dir, "aux.jsonl", &aux_text))
        .await
        .unwrap();

    let dataset = DualSourceDataset::with_policy(base, aux, JoinPolicy::AllowLongerAuxiliary).unwrap();
    assert_eq!(dataset.len(), 2);
}

#[tokio::test]
async fn test_missing_file_is_unavailable() {
    let err = JsonlSource::<BaseRecord>::open("/nonexistent/aravqa/base.jsonl")
        .await
        .unwrap_err();
    assert!(matches!(err, VqaError::SourceUnavailable { .. }));
}

#[tokio::test]
async fn test_bad_line_reports_record_position() {
    let dir = TempDir::new().unwrap();
    let content = "{\"captions\": []}\nnot json\n";
    let err = JsonlSource::<AuxiliaryRecord>::open(write(&dir, "aux.jsonl", content))
        .await
        .unwrap_err();
    assert!(matches!(err, VqaError::MalformedExample { index: Some(1), .. }));
}
