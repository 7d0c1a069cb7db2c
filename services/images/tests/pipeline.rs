mod common;

use common::{comment, created, created_many, removed, settings, start, RecordingMailer};
use image_service::notifier::{DELETED_SUBJECT, INSERTED_SUBJECT};
use image_service::rejection::REJECTED_SUBJECT;
use image_service::{ImageRecord, RecordStore};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_created_image_is_confirmed_and_recorded() {
    let harness = start(&["cat.jpg"], RecordingMailer::default(), settings());

    let delivered = harness.pipeline.publish(created("cat.jpg"));
    assert_eq!(delivered, vec!["processing", "notifier", "deletion"]);

    let report = harness.pipeline.shutdown().await.unwrap();

    let inserted = harness.mailer.with_subject(INSERTED_SUBJECT);
    assert_eq!(inserted.len(), 1);
    assert!(inserted[0].html_body.contains("cat.jpg"));

    let record = harness.records.get("cat.jpg").await.unwrap().unwrap();
    assert_eq!(record.content_type.as_deref(), Some("image/jpeg"));
    assert_eq!(report.processing.acknowledged, 1);
    assert_eq!(report.processing.dead_lettered, 0);
    assert!(harness.mailer.with_subject(REJECTED_SUBJECT).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_image_is_rejected_exactly_once() {
    let harness = start(&["cat.jpg"], RecordingMailer::default(), settings());

    // bad.jpg was never uploaded, so processing fails on it
    harness.pipeline.publish(created("cat.jpg"));
    harness.pipeline.publish(created("bad.jpg"));
    let report = harness.pipeline.shutdown().await.unwrap();

    let rejected = harness.mailer.with_subject(REJECTED_SUBJECT);
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].html_body.contains("bad.jpg"));
    assert!(!rejected[0].html_body.contains("cat.jpg"));

    assert_eq!(report.processing.acknowledged, 1);
    assert_eq!(report.processing.failed, 1);
    assert_eq!(report.processing.requeued, 0);
    assert_eq!(report.processing.dead_lettered, 1);
    assert_eq!(report.dead_letter.batches, 1);
    assert_eq!(report.dead_letter.acknowledged, 1);
    assert_eq!(harness.records.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_multi_record_notification_names_the_failed_image() {
    let harness = start(&["good.jpg"], RecordingMailer::default(), settings());

    harness
        .pipeline
        .publish(created_many(&["good.jpg", "bad.jpg"]));
    let report = harness.pipeline.shutdown().await.unwrap();

    let rejected = harness.mailer.with_subject(REJECTED_SUBJECT);
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].html_body.contains("bad.jpg"));
    assert_eq!(report.processing.dead_lettered, 1);

    assert!(harness.records.get("good.jpg").await.unwrap().is_some());
    assert_eq!(harness.mailer.with_subject(INSERTED_SUBJECT).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_caption_without_record_creates_nothing() {
    let harness = start(&[], RecordingMailer::default(), settings());

    let delivered = harness
        .pipeline
        .publish(comment("cat.jpg", "Caption", "a cat"));
    assert!(delivered.contains(&"metadata".to_string()));

    let report = harness.pipeline.shutdown().await.unwrap();

    assert_eq!(harness.records.updates(), 1);
    assert!(harness.records.get("cat.jpg").await.unwrap().is_none());
    assert_eq!(harness.records.len(), 0);
    // The processing lane acknowledges attribute changes without work
    assert_eq!(report.processing.acknowledged, 1);
    assert_eq!(report.processing.dead_lettered, 0);
    assert!(harness.mailer.with_subject(INSERTED_SUBJECT).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_only_caption_changes_reach_metadata_updater() {
    let harness = start(&[], RecordingMailer::default(), settings());
    harness
        .records
        .put(&ImageRecord::new("cat.jpg"))
        .await
        .unwrap();

    let delivered = harness.pipeline.publish(comment("cat.jpg", "Rating", "5"));
    assert!(!delivered.contains(&"metadata".to_string()));
    harness.pipeline.topic().drain().await;
    assert_eq!(harness.records.updates(), 0);

    harness
        .pipeline
        .publish(comment("cat.jpg", "Caption", "a cat"));
    harness.pipeline.shutdown().await.unwrap();

    assert_eq!(harness.records.updates(), 1);
    let record = harness.records.get("cat.jpg").await.unwrap().unwrap();
    assert_eq!(record.attribute("caption"), Some("a cat"));
}

#[tokio::test(start_paused = true)]
async fn test_removed_image_is_announced_and_deleted() {
    let harness = start(&[], RecordingMailer::default(), settings());
    harness
        .records
        .put(&ImageRecord::new("cat.jpg"))
        .await
        .unwrap();

    harness.pipeline.publish(removed("cat.jpg"));
    let report = harness.pipeline.shutdown().await.unwrap();

    let deleted = harness.mailer.with_subject(DELETED_SUBJECT);
    assert_eq!(deleted.len(), 1);
    assert!(deleted[0].html_body.contains("cat.jpg"));
    assert!(harness.records.get("cat.jpg").await.unwrap().is_none());
    assert_eq!(report.processing.dead_lettered, 0);
}

#[tokio::test(start_paused = true)]
async fn test_every_storage_event_is_announced() {
    let harness = start(&["a.jpg", "b.png"], RecordingMailer::default(), settings());

    harness.pipeline.publish(created("a.jpg"));
    harness.pipeline.publish(created("b.png"));
    harness.pipeline.publish(removed("a.jpg"));
    // No dedup: a repeated event is announced again
    harness.pipeline.publish(removed("a.jpg"));
    harness.pipeline.shutdown().await.unwrap();

    assert_eq!(harness.mailer.with_subject(INSERTED_SUBJECT).len(), 2);
    assert_eq!(harness.mailer.with_subject(DELETED_SUBJECT).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dead_letter_burst_respects_concurrency_cap() {
    let mailer = RecordingMailer::with_delay(Duration::from_millis(100));
    let harness = start(&[], mailer, settings());

    for i in 0..25 {
        harness.pipeline.publish(created(&format!("image-{}.gif", i)));
    }
    let report = harness.pipeline.shutdown().await.unwrap();

    assert_eq!(harness.mailer.with_subject(REJECTED_SUBJECT).len(), 25);
    assert!(harness.mailer.max_rejections_in_flight() <= 5);
    assert_eq!(report.processing.dead_lettered, 25);
    assert_eq!(report.dead_letter.acknowledged, 25);
}

#[tokio::test(start_paused = true)]
async fn test_dead_letter_semaphore_caps_single_message_batches() {
    let mut settings = settings();
    settings.dead_letter_lane.batch_size = 1;

    let mailer = RecordingMailer::with_delay(Duration::from_millis(100));
    let harness = start(&[], mailer, settings);

    for i in 0..25 {
        harness.pipeline.publish(created(&format!("image-{}.gif", i)));
    }
    let report = harness.pipeline.shutdown().await.unwrap();

    assert_eq!(report.dead_letter.batches, 25);
    assert_eq!(harness.mailer.with_subject(REJECTED_SUBJECT).len(), 25);
    assert_eq!(harness.mailer.max_rejections_in_flight(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_message_is_rejected_as_unknown() {
    let harness = start(&[], RecordingMailer::default(), settings());

    harness
        .pipeline
        .publish(eda_pipeline::TopicMessage::new("not a notification"));
    let report = harness.pipeline.shutdown().await.unwrap();

    let rejected = harness.mailer.with_subject(REJECTED_SUBJECT);
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].html_body.contains("unknown"));
    assert_eq!(report.processing.dead_lettered, 1);
}
