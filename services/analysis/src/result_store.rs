use crate::classifier::{HealthStatus, Verdict};
use crate::config::DynamoDbConfig;
use crate::identity::ObjectIdentity;
use async_trait::async_trait;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Stored in place of a missing disease name
pub const NO_DISEASE: &str = "none";

/// Substituted when a stored recommendation list cannot be read back
pub const FALLBACK_RECOMMENDATIONS: [&str; 3] = [
    "Monitor plant health regularly",
    "Ensure proper irrigation",
    "Maintain good air circulation",
];

/// Errors from the result store backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Result store request failed: {0}")]
    Backend(String),

    #[error("Stored result for '{id}' is unreadable: {reason}")]
    InvalidItem { id: String, reason: String },
}

/// Analysis result in its wire shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub id: ObjectIdentity,
    pub status: HealthStatus,
    /// Confidence in percent, always within 0..=100
    pub confidence_score: f32,
    /// Disease name, or `"none"`
    pub detected_disease: String,
    pub recommendations: Vec<String>,
    pub image_url: String,
    #[serde(with = "iso8601")]
    pub created_at: DateTime<Utc>,
}

impl ResultRecord {
    /// Build the record persisted for a verdict
    pub fn from_verdict(
        id: ObjectIdentity,
        verdict: &Verdict,
        image_url: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status: verdict.status(),
            confidence_score: clamp_confidence(verdict.confidence()),
            detected_disease: verdict.disease().unwrap_or(NO_DISEASE).to_string(),
            recommendations: verdict.recommendations(),
            image_url,
            created_at,
        }
    }
}

/// Clamp a confidence into 0..=100, mapping NaN to 0
pub fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 100.0)
    }
}

/// Recommendation list as found in storage
#[derive(Debug, Clone, PartialEq)]
pub enum StoredRecommendations {
    List(Vec<String>),
    /// Anything other than an ordered list of strings
    Malformed,
}

/// Result as read back from the store, before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub id: ObjectIdentity,
    pub status: HealthStatus,
    pub confidence_score: f32,
    pub detected_disease: String,
    pub recommendations: StoredRecommendations,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

impl StoredResult {
    /// Turn a stored result into its wire shape
    ///
    /// An unreadable recommendation list is replaced by the fixed fallback
    /// list, whatever the stored status is.
    pub fn normalize(self) -> ResultRecord {
        let recommendations = match self.recommendations {
            StoredRecommendations::List(list) => list,
            StoredRecommendations::Malformed => {
                debug!(id = %self.id, "Stored recommendations malformed, using fallback");
                FALLBACK_RECOMMENDATIONS.iter().map(|s| s.to_string()).collect()
            }
        };

        ResultRecord {
            id: self.id,
            status: self.status,
            confidence_score: self.confidence_score,
            detected_disease: self.detected_disease,
            recommendations,
            image_url: self.image_url,
            created_at: self.created_at,
        }
    }
}

impl From<ResultRecord> for StoredResult {
    fn from(record: ResultRecord) -> Self {
        Self {
            id: record.id,
            status: record.status,
            confidence_score: record.confidence_score,
            detected_disease: record.detected_disease,
            recommendations: StoredRecommendations::List(record.recommendations),
            image_url: record.image_url,
            created_at: record.created_at,
        }
    }
}

/// Key-value store of results, keyed by object identity
///
/// Writes are unconditional: the last upsert for an id wins.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create or fully replace the record for `record.id`
    async fn upsert(&self, record: &ResultRecord) -> Result<(), StoreError>;

    /// Point lookup; `None` while no record exists yet
    async fn get(&self, id: &ObjectIdentity) -> Result<Option<StoredResult>, StoreError>;
}

/// DynamoDB-backed result store
pub struct DynamoResultStore {
    client: DynamoDbClient,
    table_name: String,
}

impl DynamoResultStore {
    pub fn new(client: DynamoDbClient, config: &DynamoDbConfig) -> Self {
        Self {
            client,
            table_name: config.table_name.clone(),
        }
    }
}

#[async_trait]
impl ResultStore for DynamoResultStore {
    #[instrument(skip(self, record), fields(id = %record.id, table = %self.table_name))]
    async fn upsert(&self, record: &ResultRecord) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_item(record)))
            .send()
            .await
            .map_err(|e| StoreError::Backend(DisplayErrorContext(&e).to_string()))?;

        debug!("Result written");
        Ok(())
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn get(&self, id: &ObjectIdentity) -> Result<Option<StoredResult>, StoreError> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("id", AttributeValue::S(id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| StoreError::Backend(DisplayErrorContext(&e).to_string()))?;

        response.item().map(|item| from_item(id, item)).transpose()
    }
}

/// Encode a record as a DynamoDB item
pub fn to_item(record: &ResultRecord) -> HashMap<String, AttributeValue> {
    let recommendations = record
        .recommendations
        .iter()
        .map(|r| AttributeValue::S(r.clone()))
        .collect();

    HashMap::from([
        ("id".to_string(), AttributeValue::S(record.id.to_string())),
        (
            "status".to_string(),
            AttributeValue::S(record.status.as_str().to_string()),
        ),
        (
            "confidenceScore".to_string(),
            AttributeValue::N(clamp_confidence(record.confidence_score).to_string()),
        ),
        (
            "detectedDisease".to_string(),
            AttributeValue::S(record.detected_disease.clone()),
        ),
        ("recommendations".to_string(), AttributeValue::L(recommendations)),
        ("imageUrl".to_string(), AttributeValue::S(record.image_url.clone())),
        (
            "createdAt".to_string(),
            AttributeValue::S(iso8601::format(&record.created_at)),
        ),
    ])
}

/// Decode a DynamoDB item, validating its shape
pub fn from_item(
    id: &ObjectIdentity,
    item: &HashMap<String, AttributeValue>,
) -> Result<StoredResult, StoreError> {
    let invalid = |reason: String| StoreError::InvalidItem {
        id: id.to_string(),
        reason,
    };

    let string_attr = |name: &str| -> Result<String, StoreError> {
        item.get(name)
            .and_then(|v| v.as_s().ok())
            .cloned()
            .ok_or_else(|| invalid(format!("missing string attribute '{}'", name)))
    };

    let status = string_attr("status")?;
    let status = HealthStatus::parse(&status)
        .ok_or_else(|| invalid(format!("unknown status '{}'", status)))?;

    let confidence_score = item
        .get("confidenceScore")
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse::<f32>().ok())
        .ok_or_else(|| invalid("missing numeric attribute 'confidenceScore'".to_string()))?;

    let created_at = string_attr("createdAt")?;
    let created_at = iso8601::parse(&created_at)
        .map_err(|e| invalid(format!("bad createdAt '{}': {}", created_at, e)))?;

    let recommendations = match item.get("recommendations") {
        Some(AttributeValue::L(values)) => values
            .iter()
            .map(|v| v.as_s().ok().cloned())
            .collect::<Option<Vec<_>>>()
            .map(StoredRecommendations::List)
            .unwrap_or(StoredRecommendations::Malformed),
        _ => StoredRecommendations::Malformed,
    };

    Ok(StoredResult {
        id: id.clone(),
        status,
        confidence_score,
        detected_disease: string_attr("detectedDisease")?,
        recommendations,
        image_url: string_attr("imageUrl")?,
        created_at,
    })
}

/// Process-local result store
#[derive(Default)]
pub struct InMemoryResultStore {
    records: RwLock<HashMap<ObjectIdentity, StoredResult>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a result exactly as given, bypassing record encoding
    pub async fn insert_raw(&self, stored: StoredResult) {
        self.records.write().await.insert(stored.id.clone(), stored);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn upsert(&self, record: &ResultRecord) -> Result<(), StoreError> {
        self.insert_raw(record.clone().into()).await;
        Ok(())
    }

    async fn get(&self, id: &ObjectIdentity) -> Result<Option<StoredResult>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }
}

/// ISO 8601 timestamps with millisecond precision and a `Z` suffix
mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(timestamp: &DateTime<Utc>) -> String {
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(value).map(|t| t.with_timezone(&Utc))
    }

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(timestamp))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn id(value: &str) -> ObjectIdentity {
        ObjectIdentity::from_key(&format!("uploads/{}.jpg", value), "uploads").unwrap()
    }

    fn created_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap()
    }

    fn diseased_record() -> ResultRecord {
        ResultRecord::from_verdict(
            id("abc"),
            &Verdict::Diseased {
                disease: "brown-spot".to_string(),
                confidence: 81.0,
            },
            "https://bucket.s3.eu-west-1.amazonaws.com/uploads/abc.jpg".to_string(),
            created_at(),
        )
    }

    #[test]
    fn test_record_from_healthy_verdict() {
        let record = ResultRecord::from_verdict(
            id("abc"),
            &Verdict::Healthy { confidence: 92.0 },
            "https://example/uploads/abc.jpg".to_string(),
            created_at(),
        );

        assert_eq!(record.status, HealthStatus::Healthy);
        assert_eq!(record.detected_disease, NO_DISEASE);
        assert_eq!(record.recommendations.len(), 3);
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(clamp_confidence(150.0), 100.0);
        assert_eq!(clamp_confidence(-3.0), 0.0);
        assert_eq!(clamp_confidence(f32::NAN), 0.0);
        assert_eq!(clamp_confidence(64.5), 64.5);

        let record = ResultRecord::from_verdict(
            id("abc"),
            &Verdict::Healthy { confidence: 250.0 },
            String::new(),
            created_at(),
        );
        assert_eq!(record.confidence_score, 100.0);
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(diseased_record()).unwrap();

        assert_eq!(json["id"], "abc");
        assert_eq!(json["status"], "diseased");
        assert_eq!(json["confidenceScore"], 81.0);
        assert_eq!(json["detectedDisease"], "brown-spot");
        assert_eq!(json["recommendations"].as_array().unwrap().len(), 4);
        assert_eq!(json["createdAt"], "2024-01-15T10:30:45.000Z");
    }

    #[test]
    fn test_item_encoding_reads_back() {
        let record = diseased_record();
        let item = to_item(&record);

        assert_eq!(item["confidenceScore"], AttributeValue::N("81".to_string()));

        let stored = from_item(&record.id, &item).unwrap();
        assert_eq!(stored.normalize(), record);
    }

    #[test]
    fn test_string_set_recommendations_are_malformed() {
        let record = diseased_record();
        let mut item = to_item(&record);
        item.insert(
            "recommendations".to_string(),
            AttributeValue::Ss(vec!["Isolate affected plants to prevent spread".to_string()]),
        );

        let stored = from_item(&record.id, &item).unwrap();
        assert_eq!(stored.recommendations, StoredRecommendations::Malformed);

        // Fallback is the healthy-style list even for a diseased record
        let normalized = stored.normalize();
        assert_eq!(normalized.status, HealthStatus::Diseased);
        assert_eq!(normalized.recommendations, FALLBACK_RECOMMENDATIONS.to_vec());
    }

    #[test]
    fn test_missing_or_mixed_recommendations_are_malformed() {
        let record = diseased_record();

        let mut item = to_item(&record);
        item.remove("recommendations");
        assert_eq!(
            from_item(&record.id, &item).unwrap().recommendations,
            StoredRecommendations::Malformed
        );

        let mut item = to_item(&record);
        item.insert(
            "recommendations".to_string(),
            AttributeValue::L(vec![
                AttributeValue::S("ok".to_string()),
                AttributeValue::N("1".to_string()),
            ]),
        );
        assert_eq!(
            from_item(&record.id, &item).unwrap().recommendations,
            StoredRecommendations::Malformed
        );
    }

    #[test]
    fn test_missing_scalar_is_invalid_item() {
        let record = diseased_record();
        let mut item = to_item(&record);
        item.remove("imageUrl");

        assert!(matches!(
            from_item(&record.id, &item),
            Err(StoreError::InvalidItem { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_memory_upsert_replaces() {
        let store = InMemoryResultStore::new();
        let first = diseased_record();
        store.upsert(&first).await.unwrap();

        let mut second = first.clone();
        second.status = HealthStatus::Healthy;
        second.detected_disease = NO_DISEASE.to_string();
        second.recommendations = HealthStatus::Healthy.recommendations();
        store.upsert(&second).await.unwrap();

        assert_eq!(store.len().await, 1);
        let stored = store.get(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.normalize(), second);
    }

    #[tokio::test]
    async fn test_in_memory_get_missing() {
        let store = InMemoryResultStore::new();
        assert!(store.get(&id("nothing")).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }
}
