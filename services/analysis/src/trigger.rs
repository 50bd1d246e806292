use crate::classifier::{Classifier, DetectionError, ImageRef};
use crate::identity::{decode_notification_key, public_object_url, IdentityError, ObjectIdentity};
use crate::result_store::{ResultRecord, ResultStore, StoreError};
use chrono::Utc;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

/// S3 event notification document; one document is one batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3EventNotification {
    /// Absent in `s3:TestEvent` messages
    #[serde(rename = "Records", default)]
    pub records: Vec<S3EventRecord>,
}

/// A single notification inside a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3EventRecord {
    /// Event name, e.g. `ObjectCreated:Post`
    #[serde(default)]
    pub event_name: String,
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3ObjectEntity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3ObjectEntity {
    /// Form-encoded object key
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl S3EventRecord {
    pub fn is_object_created(&self) -> bool {
        self.event_name.starts_with("ObjectCreated")
    }
}

/// Errors that fail an ingestion batch
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid object key '{key}': {source}")]
    InvalidKey {
        key: String,
        #[source]
        source: IdentityError,
    },

    #[error("Classification failed for '{key}': {source}")]
    Detection {
        key: String,
        #[source]
        source: DetectionError,
    },

    #[error("Failed to store result for '{id}': {source}")]
    Store {
        id: ObjectIdentity,
        #[source]
        source: StoreError,
    },
}

/// Classifies newly created uploads and records the verdicts
pub struct IngestionTrigger {
    classifier: Arc<Classifier>,
    store: Arc<dyn ResultStore>,
    region: String,
    upload_prefix: String,
}

impl IngestionTrigger {
    pub fn new(
        classifier: Arc<Classifier>,
        store: Arc<dyn ResultStore>,
        region: impl Into<String>,
        upload_prefix: impl Into<String>,
    ) -> Self {
        Self {
            classifier,
            store,
            region: region.into(),
            upload_prefix: upload_prefix.into(),
        }
    }

    /// Process every object-created record of a batch concurrently
    ///
    /// The batch fails as a whole if any record fails; redelivery is left
    /// to whoever handed the batch over.
    #[instrument(skip(self, event), fields(records = event.records.len()))]
    pub async fn process_batch(
        &self,
        event: &S3EventNotification,
    ) -> Result<Vec<ResultRecord>, IngestError> {
        let tasks = event
            .records
            .iter()
            .filter(|record| {
                if !record.is_object_created() {
                    debug!(
                        event_name = %record.event_name,
                        key = %record.s3.object.key,
                        "Skipping non-create notification"
                    );
                }
                record.is_object_created()
            })
            .map(|record| self.process_record(record));

        match try_join_all(tasks).await {
            Ok(results) => {
                info!(processed = results.len(), "Notification batch processed");
                Ok(results)
            }
            Err(e) => {
                error!(error = %e, "Notification batch failed");
                metrics::counter!("analysis.batches.failed").increment(1);
                Err(e)
            }
        }
    }

    /// Classify one uploaded object and upsert its result
    #[instrument(skip(self, record), fields(bucket = %record.s3.bucket.name, key = %record.s3.object.key))]
    pub async fn process_record(&self, record: &S3EventRecord) -> Result<ResultRecord, IngestError> {
        let raw_key = &record.s3.object.key;
        let invalid_key = |source| IngestError::InvalidKey {
            key: raw_key.clone(),
            source,
        };

        let key = decode_notification_key(raw_key).map_err(invalid_key)?;
        let id = ObjectIdentity::from_key(&key, &self.upload_prefix).map_err(invalid_key)?;
        let bucket = &record.s3.bucket.name;

        let image = ImageRef {
            bucket: bucket.clone(),
            key: key.clone(),
        };

        let started = Instant::now();
        let verdict = self
            .classifier
            .classify(&image)
            .await
            .map_err(|source| IngestError::Detection {
                key: key.clone(),
                source,
            })?;
        metrics::histogram!("analysis.classify.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let result = ResultRecord::from_verdict(
            id,
            &verdict,
            public_object_url(bucket, &self.region, &key),
            Utc::now(),
        );

        self.store
            .upsert(&result)
            .await
            .map_err(|source| IngestError::Store {
                id: result.id.clone(),
                source,
            })?;

        metrics::counter!("analysis.records.written").increment(1);
        info!(
            id = %result.id,
            status = result.status.as_str(),
            confidence = result.confidence_score,
            "Analysis result stored"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{
        ClassifierBuilder, HealthStatus, Label, LabelDetector, MockLabelDetector,
    };
    use crate::result_store::{InMemoryResultStore, NO_DISEASE};
    use async_trait::async_trait;
    use mockall::predicate::always;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Takes a second per image and records peak in-flight detections
    #[derive(Default)]
    struct SlowDetector {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl LabelDetector for SlowDetector {
        async fn detect_labels(
            &self,
            _image: &ImageRef,
            _min_confidence: f32,
        ) -> Result<Vec<Label>, DetectionError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![Label::new("healthy", 90.0)])
        }
    }

    const EVENT_JSON: &str = r#"{
        "Records": [
            {
                "eventVersion": "2.1",
                "eventSource": "aws:s3",
                "awsRegion": "eu-west-1",
                "eventName": "ObjectCreated:Post",
                "s3": {
                    "bucket": { "name": "agrovision-image-app" },
                    "object": { "key": "uploads/healthy-leaf.jpg", "size": 48213 }
                }
            },
            {
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": "agrovision-image-app" },
                    "object": { "key": "uploads/spotted+leaf.png" }
                }
            }
        ]
    }"#;

    fn detector_by_key() -> MockLabelDetector {
        let mut detector = MockLabelDetector::new();
        detector
            .expect_detect_labels()
            .with(always(), always())
            .returning(|image, _| match image.key.as_str() {
                "uploads/healthy-leaf.jpg" => Ok(vec![
                    Label::new("healthy", 92.0),
                    Label::new("brown-spot", 10.0),
                ]),
                "uploads/spotted leaf.png" => Ok(vec![
                    Label::new("brown-spot", 81.0),
                    Label::new("healthy", 20.0),
                ]),
                "uploads/overconfident.jpg" => Ok(vec![Label::new("leaf-smut", 180.0)]),
                other => Err(DetectionError::RequestFailed(format!("no image at {}", other))),
            });
        detector
    }

    fn trigger(store: Arc<InMemoryResultStore>) -> IngestionTrigger {
        let classifier = ClassifierBuilder::new(Arc::new(detector_by_key())).build();
        IngestionTrigger::new(Arc::new(classifier), store, "eu-west-1", "uploads")
    }

    fn record(event_name: &str, key: &str) -> S3EventRecord {
        S3EventRecord {
            event_name: event_name.to_string(),
            s3: S3Entity {
                bucket: S3Bucket {
                    name: "agrovision-image-app".to_string(),
                },
                object: S3ObjectEntity {
                    key: key.to_string(),
                    size: None,
                },
            },
        }
    }

    #[test]
    fn test_deserialize_notification() {
        let event: S3EventNotification = serde_json::from_str(EVENT_JSON).unwrap();
        assert_eq!(event.records.len(), 2);
        assert_eq!(event.records[0].s3.object.size, Some(48213));
        assert!(event.records[1].is_object_created());
    }

    #[test]
    fn test_test_event_is_empty_batch() {
        let json = r#"{"Service":"Amazon S3","Event":"s3:TestEvent","Bucket":"agrovision-image-app"}"#;
        let event: S3EventNotification = serde_json::from_str(json).unwrap();
        assert!(event.records.is_empty());
    }

    #[tokio::test]
    async fn test_batch_writes_one_record_per_object() {
        let store = Arc::new(InMemoryResultStore::new());
        let event: S3EventNotification = serde_json::from_str(EVENT_JSON).unwrap();

        let results = trigger(store.clone()).process_batch(&event).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(store.len().await, 2);

        let healthy = store
            .get(&ObjectIdentity::from_key("uploads/healthy-leaf.jpg", "uploads").unwrap())
            .await
            .unwrap()
            .unwrap()
            .normalize();
        assert_eq!(healthy.status, HealthStatus::Healthy);
        assert_eq!(healthy.detected_disease, NO_DISEASE);
        assert_eq!(healthy.confidence_score, 92.0);
        assert_eq!(
            healthy.image_url,
            "https://agrovision-image-app.s3.eu-west-1.amazonaws.com/uploads/healthy-leaf.jpg"
        );

        let spotted = results
            .iter()
            .find(|r| r.id.as_str() == "spotted leaf")
            .unwrap();
        assert_eq!(spotted.status, HealthStatus::Diseased);
        assert_eq!(spotted.detected_disease, "brown-spot");
        assert_eq!(spotted.recommendations.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_records_classified_concurrently() {
        let detector = Arc::new(SlowDetector::default());
        let classifier = ClassifierBuilder::new(detector.clone()).build();
        let store = Arc::new(InMemoryResultStore::new());
        let trigger =
            IngestionTrigger::new(Arc::new(classifier), store.clone(), "eu-west-1", "uploads");
        let event = S3EventNotification {
            records: vec![
                record("ObjectCreated:Put", "uploads/a.jpg"),
                record("ObjectCreated:Put", "uploads/b.jpg"),
                record("ObjectCreated:Put", "uploads/c.jpg"),
            ],
        };

        let start = tokio::time::Instant::now();
        let results = trigger.process_batch(&event).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(results.len(), 3);
        assert_eq!(store.len().await, 3);
        assert!(
            elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2),
            "batch of three took {:?}",
            elapsed
        );
        assert_eq!(detector.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_failure_fails_batch() {
        let store = Arc::new(InMemoryResultStore::new());
        let event = S3EventNotification {
            records: vec![
                record("ObjectCreated:Put", "uploads/healthy-leaf.jpg"),
                record("ObjectCreated:Put", "uploads/missing.jpg"),
            ],
        };

        let result = trigger(store).process_batch(&event).await;
        assert!(matches!(result, Err(IngestError::Detection { .. })));
    }

    #[tokio::test]
    async fn test_key_outside_prefix_fails_batch() {
        let store = Arc::new(InMemoryResultStore::new());
        let event = S3EventNotification {
            records: vec![record("ObjectCreated:Put", "thumbnails/healthy-leaf.jpg")],
        };

        let result = trigger(store.clone()).process_batch(&event).await;
        assert!(matches!(result, Err(IngestError::InvalidKey { .. })));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_non_create_events_skipped() {
        let store = Arc::new(InMemoryResultStore::new());
        let event = S3EventNotification {
            records: vec![record("ObjectRemoved:Delete", "uploads/missing.jpg")],
        };

        let results = trigger(store.clone()).process_batch(&event).await.unwrap();
        assert!(results.is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_stored_confidence_is_clamped() {
        let store = Arc::new(InMemoryResultStore::new());
        let result = trigger(store)
            .process_record(&record("ObjectCreated:Put", "uploads/overconfident.jpg"))
            .await
            .unwrap();

        assert_eq!(result.confidence_score, 100.0);
        assert_eq!(result.detected_disease, "leaf-smut");
    }

    #[tokio::test]
    async fn test_reprocessing_is_idempotent() {
        let store = Arc::new(InMemoryResultStore::new());
        let trigger = trigger(store.clone());
        let notification = record("ObjectCreated:Put", "uploads/healthy-leaf.jpg");

        let first = trigger.process_record(&notification).await.unwrap();
        let mut second = trigger.process_record(&notification).await.unwrap();

        assert_eq!(store.len().await, 1);
        second.created_at = first.created_at;
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }
}
