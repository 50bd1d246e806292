use crate::config::{ClassifierConfig, RekognitionConfig};
use async_trait::async_trait;
use aws_sdk_rekognition::error::DisplayErrorContext;
use aws_sdk_rekognition::types::{Image, S3Object};
use aws_sdk_rekognition::Client as RekognitionClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Guidance returned with every healthy verdict
pub const HEALTHY_RECOMMENDATIONS: [&str; 3] = [
    "Continue current maintenance practices",
    "Regular monitoring for early disease detection",
    "Maintain proper irrigation schedule",
];

/// Guidance returned with every diseased verdict, whatever the disease
pub const DISEASED_RECOMMENDATIONS: [&str; 4] = [
    "Isolate affected plants to prevent spread",
    "Apply appropriate fungicide treatment",
    "Improve air circulation around plants",
    "Adjust watering practices to avoid leaf wetness",
];

/// Minimum label confidence sent to the detector
pub const DEFAULT_MIN_CONFIDENCE: f32 = 50.0;

/// Errors from the external label detector
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Label detection request failed: {0}")]
    RequestFailed(String),
}

/// A stored image the detector can read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub bucket: String,
    pub key: String,
}

/// A (name, confidence) pair reported by the detector
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub name: String,
    /// Confidence in percent (0 - 100)
    pub confidence: f32,
}

impl Label {
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into(),
            confidence,
        }
    }
}

/// Health status persisted with a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Diseased,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Diseased => "diseased",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "healthy" => Some(HealthStatus::Healthy),
            "diseased" => Some(HealthStatus::Diseased),
            _ => None,
        }
    }

    /// Fixed, ordered guidance for this status
    pub fn recommendations(&self) -> Vec<String> {
        let fixed: &[&str] = match self {
            HealthStatus::Healthy => &HEALTHY_RECOMMENDATIONS,
            HealthStatus::Diseased => &DISEASED_RECOMMENDATIONS,
        };
        fixed.iter().map(|s| s.to_string()).collect()
    }
}

/// Health determination reduced from a label set
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Healthy { confidence: f32 },
    Diseased { disease: String, confidence: f32 },
}

impl Verdict {
    pub fn status(&self) -> HealthStatus {
        match self {
            Verdict::Healthy { .. } => HealthStatus::Healthy,
            Verdict::Diseased { .. } => HealthStatus::Diseased,
        }
    }

    pub fn disease(&self) -> Option<&str> {
        match self {
            Verdict::Healthy { .. } => None,
            Verdict::Diseased { disease, .. } => Some(disease),
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            Verdict::Healthy { confidence } | Verdict::Diseased { confidence, .. } => *confidence,
        }
    }

    pub fn recommendations(&self) -> Vec<String> {
        self.status().recommendations()
    }
}

/// External label detection capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LabelDetector: Send + Sync {
    /// Detect labels at or above `min_confidence` in a stored image
    async fn detect_labels(
        &self,
        image: &ImageRef,
        min_confidence: f32,
    ) -> Result<Vec<Label>, DetectionError>;
}

/// Rekognition Custom Labels detector
pub struct RekognitionDetector {
    client: RekognitionClient,
    model_arn: String,
}

impl RekognitionDetector {
    pub fn new(client: RekognitionClient, config: &RekognitionConfig) -> Self {
        Self {
            client,
            model_arn: config.model_arn.clone(),
        }
    }
}

#[async_trait]
impl LabelDetector for RekognitionDetector {
    #[instrument(skip(self), fields(bucket = %image.bucket, key = %image.key))]
    async fn detect_labels(
        &self,
        image: &ImageRef,
        min_confidence: f32,
    ) -> Result<Vec<Label>, DetectionError> {
        let source = Image::builder()
            .s3_object(
                S3Object::builder()
                    .bucket(&image.bucket)
                    .name(&image.key)
                    .build(),
            )
            .build();

        let response = self
            .client
            .detect_custom_labels()
            .project_version_arn(&self.model_arn)
            .image(source)
            .min_confidence(min_confidence)
            .send()
            .await
            .map_err(|e| DetectionError::RequestFailed(DisplayErrorContext(&e).to_string()))?;

        let labels = response
            .custom_labels()
            .iter()
            .map(|label| Label {
                name: label.name().unwrap_or_default().to_string(),
                confidence: label.confidence().unwrap_or_default(),
            })
            .collect();

        Ok(labels)
    }
}

/// Label vocabulary and the decision rule over it
#[derive(Debug, Clone)]
pub struct LabelRules {
    healthy_label: String,
    disease_labels: Vec<String>,
}

impl LabelRules {
    pub fn new(healthy_label: &str, disease_labels: &[String]) -> Self {
        Self {
            healthy_label: healthy_label.to_lowercase(),
            disease_labels: disease_labels.iter().map(|d| d.to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self::new(&config.healthy_label, &config.disease_labels)
    }

    /// Reduce labels to a verdict
    ///
    /// Only a label that strictly beats the running best confidence can
    /// change the disease, so among equal confidences the first one seen
    /// wins. An unknown label still raises the running best while leaving
    /// the tracked disease as it was.
    pub fn decide(&self, labels: &[Label]) -> Verdict {
        let mut best = 0.0_f32;
        let mut disease: Option<&str> = None;

        for label in labels {
            if label.confidence > best {
                best = label.confidence;
                let name = label.name.to_lowercase();
                if name == self.healthy_label {
                    disease = None;
                } else if let Some(known) = self.disease_labels.iter().find(|d| **d == name) {
                    disease = Some(known.as_str());
                }
            }
        }

        match disease {
            Some(disease) => Verdict::Diseased {
                disease: disease.to_string(),
                confidence: best,
            },
            None => Verdict::Healthy { confidence: best },
        }
    }
}

impl Default for LabelRules {
    fn default() -> Self {
        Self::from_config(&ClassifierConfig::default())
    }
}

/// Classifies stored images through an external detector
///
/// Every detection request carries [`DEFAULT_MIN_CONFIDENCE`].
pub struct Classifier {
    detector: Arc<dyn LabelDetector>,
    rules: LabelRules,
}

impl Classifier {
    pub fn new(detector: Arc<dyn LabelDetector>, rules: LabelRules) -> Self {
        Self { detector, rules }
    }

    /// Detect labels for an image and reduce them to a verdict
    #[instrument(skip(self), fields(bucket = %image.bucket, key = %image.key))]
    pub async fn classify(&self, image: &ImageRef) -> Result<Verdict, DetectionError> {
        let labels = self
            .detector
            .detect_labels(image, DEFAULT_MIN_CONFIDENCE)
            .await?;

        debug!(labels = ?labels, "Detected labels");
        metrics::histogram!("analysis.labels.detected").record(labels.len() as f64);

        let verdict = self.rules.decide(&labels);

        info!(
            label_count = labels.len(),
            status = verdict.status().as_str(),
            disease = verdict.disease().unwrap_or("none"),
            confidence = verdict.confidence(),
            "Image classified"
        );
        metrics::counter!("analysis.verdicts", "status" => verdict.status().as_str()).increment(1);

        Ok(verdict)
    }
}

/// Builder for creating a Classifier with custom settings
pub struct ClassifierBuilder {
    detector: Arc<dyn LabelDetector>,
    config: ClassifierConfig,
}

impl ClassifierBuilder {
    pub fn new(detector: Arc<dyn LabelDetector>) -> Self {
        Self {
            detector,
            config: ClassifierConfig::default(),
        }
    }

    pub fn healthy_label(mut self, label: &str) -> Self {
        self.config.healthy_label = label.to_string();
        self
    }

    pub fn disease_labels(mut self, labels: Vec<String>) -> Self {
        self.config.disease_labels = labels;
        self
    }

    pub fn build(self) -> Classifier {
        Classifier::new(self.detector, LabelRules::from_config(&self.config))
    }
}
