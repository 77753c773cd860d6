// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// End-to-end: base source + annotated auxiliary source -> batches -> answers -> accuracy

use super::common::{init_tracing, FixedCaptioner, StaticAnswerer};
use aravqa::captioning::Caption;
use aravqa::dataset::{
    AnswerEntry, AuxiliaryRecord, BaseRecord, BatchCollator, DataLoader, DualSourceDataset, InMemorySource,
    Metadata, RecordId,
};
use aravqa::{answer_batch, AccuracyReport, CaptionAnnotator};
use serde_json::json;
use std::sync::Arc;

fn car_record() -> BaseRecord {
    let mut record = BaseRecord::new(Metadata::new("Q1", "I1"), "What color is the car?")
        .with_image(json!([[[200, 30, 30], [200, 30, 30]], [[200, 30, 30], [200, 30, 30]]]))
        .with_multiple_choice_answer("red")
        .with_captions(vec![Caption::new("a red car on a street")]);
    record.answers = vec![
        serde_json::from_value(json!({"answer": "red", "answer_confidence": "yes", "answer_id": 1})).unwrap(),
        AnswerEntry::from("red"),
        AnswerEntry::from("crimson"),
    ];
    record
}

#[tokio::test]
async fn test_single_example_through_the_pipeline() {
    init_tracing();
    let base: InMemorySource<BaseRecord> = vec![car_record()].into();
    let annotator = CaptionAnnotator::new(Arc::new(FixedCaptioner::new(&["an automobile, red colored"])));
    let auxiliary = annotator.annotate(&base).await;

    let dataset = DualSourceDataset::new(base, auxiliary).unwrap();
    let mut loader = DataLoader::new(&dataset, BatchCollator::default(), 8).unwrap();
    let batch = loader.next().unwrap().unwrap();
    assert!(loader.next().is_none());

    assert_eq!(batch.len(), 1);
    assert_eq!(batch.question_id, vec![RecordId::from("Q1")]);
    assert_eq!(batch.image_id, vec![RecordId::from("I1")]);
    assert_eq!(batch.answers[0], vec!["red", "red", "crimson"]);
    assert_eq!(batch.multiple_choice_answer[0], "red");

    let prompt = &batch.prompts[0];
    let first = prompt.find("a red car on a street").unwrap();
    let second = prompt.find("an automobile, red colored").unwrap();
    let question = prompt.find("What color is the car?").unwrap();
    assert!(first < second && second < question);

    let predictions = answer_batch(&StaticAnswerer("Red"), &batch).await.unwrap();
    let mut report = AccuracyReport::new();
    report.add_batch(&batch, &predictions).unwrap();
    assert!((report.accuracy() - 2.0 / 3.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_batches_preserve_source_order() {
    init_tracing();
    let base: Vec<BaseRecord> = (0..7i64)
        .map(|i| BaseRecord::new(Metadata::new(i, 1000 + i), format!("q{}", i)))
        .collect();
    let base: InMemorySource<BaseRecord> = base.into();
    let auxiliary = CaptionAnnotator::new(Arc::new(FixedCaptioner::new(&["x"])))
        .annotate(&base)
        .await;

    // no images at all: every auxiliary entry is empty and prompts are bare questions
    let dataset = DualSourceDataset::new(base, auxiliary).unwrap();
    let loader = DataLoader::new(&dataset, BatchCollator::default(), 3).unwrap();
    assert_eq!(loader.num_batches(), 3);

    let mut seen = Vec::new();
    for batch in loader {
        let batch = batch.unwrap();
        assert_eq!(batch.prompts.len(), batch.question_id.len());
        for (id, prompt) in batch.question_id.iter().zip(&batch.prompts) {
            assert_eq!(prompt, &format!("q{}", id));
        }
        seen.extend(batch.question_id);
    }
    assert_eq!(seen, (0..7).map(RecordId::Int).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_answers_default_to_empty_columns() {
    let record = BaseRecord::new(Metadata::new(5, 6), "ما هذا؟");
    let dataset = DualSourceDataset::new(
        InMemorySource::new(vec![record]),
        InMemorySource::new(vec![AuxiliaryRecord::default()]),
    )
    .unwrap();
    let batch = DataLoader::new(&dataset, BatchCollator::default(), 1)
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert!(batch.answers[0].is_empty());
    assert_eq!(batch.multiple_choice_answer[0], "");
    assert_eq!(batch.prompts[0], "ما هذا؟");
}
