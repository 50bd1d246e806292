//! Upload notification to polled result, wired through the in-memory store.

use agrovision_analysis::classifier::{DetectionError, ImageRef, Label, LabelDetector};
use agrovision_analysis::identity::public_object_url;
use agrovision_analysis::uploads::{plan_upload, UploadRequest};
use agrovision_analysis::{
    ClassifierBuilder, HealthStatus, InMemoryResultStore, IngestionTrigger, ObjectIdentity,
    PollBudget, PollError, ResultPoller, S3EventNotification,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const BUCKET: &str = "agrovision-image-app";
const REGION: &str = "eu-west-1";

/// Answers with fixed labels per object key
struct ScriptedDetector {
    labels: HashMap<String, Vec<Label>>,
}

impl ScriptedDetector {
    fn new() -> Self {
        Self {
            labels: HashMap::new(),
        }
    }

    fn with(mut self, key: &str, labels: Vec<Label>) -> Self {
        self.labels.insert(key.to_string(), labels);
        self
    }
}

#[async_trait]
impl LabelDetector for ScriptedDetector {
    async fn detect_labels(
        &self,
        image: &ImageRef,
        _min_confidence: f32,
    ) -> Result<Vec<Label>, DetectionError> {
        self.labels
            .get(&image.key)
            .cloned()
            .ok_or_else(|| DetectionError::RequestFailed(format!("unknown object {}", image.key)))
    }
}

fn notification(key: &str) -> S3EventNotification {
    serde_json::from_value(serde_json::json!({
        "Records": [{
            "eventName": "ObjectCreated:Post",
            "s3": {
                "bucket": { "name": BUCKET },
                "object": { "key": key }
            }
        }]
    }))
    .unwrap()
}

fn trigger(detector: ScriptedDetector, store: Arc<InMemoryResultStore>) -> IngestionTrigger {
    let classifier = ClassifierBuilder::new(Arc::new(detector)).build();
    IngestionTrigger::new(Arc::new(classifier), store, REGION, "uploads")
}

fn assert_elapsed(start: Instant, expected: Duration) {
    let elapsed = start.elapsed();
    let tolerance = Duration::from_millis(50);
    assert!(
        elapsed >= expected && elapsed <= expected + tolerance,
        "elapsed {:?}, expected {:?}",
        elapsed,
        expected
    );
}

#[tokio::test(start_paused = true)]
async fn test_poll_returns_record_written_while_waiting() {
    let store = Arc::new(InMemoryResultStore::new());
    let key = "uploads/0b7c9a52-leaf.png";
    let trigger = trigger(
        ScriptedDetector::new().with(
            key,
            vec![Label::new("brown-spot", 81.0), Label::new("healthy", 20.0)],
        ),
        store.clone(),
    );
    let poller = ResultPoller::new(store.clone(), PollBudget::default());

    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(4)).await;
        trigger.process_batch(&notification(key)).await
    });

    let start = Instant::now();
    let id = ObjectIdentity::from_key(key, "uploads").unwrap();
    let found = poller.await_result(&id).await.unwrap();

    // Lookups at 2s and 5s; the write lands at 4s
    assert_elapsed(start, Duration::from_secs(5));

    let written = writer.await.unwrap().unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(found, written[0]);
    assert_eq!(found.status, HealthStatus::Diseased);
    assert_eq!(found.detected_disease, "brown-spot");
    assert_eq!(found.confidence_score, 81.0);
    assert_eq!(found.recommendations.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_poll_times_out_after_full_budget() {
    let store = Arc::new(InMemoryResultStore::new());
    let poller = ResultPoller::new(store, PollBudget::default());

    let start = Instant::now();
    let id = ObjectIdentity::from_key("uploads/never-written.jpg", "uploads").unwrap();
    let result = poller.await_result(&id).await;

    assert!(matches!(result, Err(PollError::Timeout { attempts: 20 })));
    assert_elapsed(start, Duration::from_secs(62));
}

#[tokio::test]
async fn test_failed_batch_leaves_poll_waiting() {
    let store = Arc::new(InMemoryResultStore::new());
    let trigger = trigger(ScriptedDetector::new(), store.clone());

    let result = trigger.process_batch(&notification("uploads/unknown.jpg")).await;
    assert!(result.is_err());

    let poller = ResultPoller::new(
        store,
        PollBudget {
            initial_delay: Duration::from_millis(1),
            interval: Duration::from_millis(1),
            max_attempts: 2,
        },
    );
    let id = ObjectIdentity::from_key("uploads/unknown.jpg", "uploads").unwrap();
    assert!(matches!(
        poller.await_result(&id).await,
        Err(PollError::Timeout { .. })
    ));
}

#[tokio::test]
async fn test_upload_grant_image_url_resolves_to_trigger_identity() {
    let request = UploadRequest {
        filename: Some("Field Sample.JPG".to_string()),
        content_type: Some("image/jpeg".to_string()),
        content_length: Some(512 * 1024),
    };
    let plan = plan_upload(&request, "uploads", 10 * 1024 * 1024, Uuid::new_v4()).unwrap();
    let image_url = public_object_url(BUCKET, REGION, &plan.key);

    let store = Arc::new(InMemoryResultStore::new());
    let trigger = trigger(
        ScriptedDetector::new().with(&plan.key, vec![Label::new("healthy", 97.5)]),
        store,
    );
    let written = trigger.process_batch(&notification(&plan.key)).await.unwrap();

    let from_url = ObjectIdentity::from_image_url(&image_url, "uploads").unwrap();
    assert_eq!(written[0].id, from_url);
    assert_eq!(written[0].image_url, image_url);
    assert_eq!(written[0].status, HealthStatus::Healthy);
}
