use crate::config::{AwsConfig, S3Config};
use crate::identity::public_object_url;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

/// Errors raised while authorizing an upload
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("Filename and content type are required")]
    MissingFields,

    #[error("Content length is required")]
    MissingContentLength,

    #[error("Content type '{0}' is not an image type")]
    InvalidContentType(String),

    #[error("Filename '{0}' has no usable extension")]
    MissingExtension(String),

    #[error("Upload of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    #[error("Failed to presign upload: {0}")]
    Presign(String),
}

/// Body of `POST /upload`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    /// Declared object size, signed into the grant
    pub content_length: Option<u64>,
}

/// A direct-to-bucket upload grant
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadGrant {
    /// Presigned PUT URL
    pub url: String,
    pub method: String,
    /// Headers the client must send with the PUT
    pub fields: BTreeMap<String, String>,
    /// Full object key
    pub id: String,
    /// Public URL the image will be reachable at, to hand to `/analyze`
    pub image_url: String,
    pub expires_at: DateTime<Utc>,
}

/// A validated upload, ready to be signed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    pub key: String,
    pub content_type: String,
    pub content_length: u64,
}

/// Validate an upload request and pick its object key
pub fn plan_upload(
    request: &UploadRequest,
    prefix: &str,
    max_bytes: u64,
    object_id: Uuid,
) -> Result<UploadPlan, UploadError> {
    let filename = request.filename.as_deref().map(str::trim).unwrap_or_default();
    let content_type = request
        .content_type
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();

    if filename.is_empty() || content_type.is_empty() {
        return Err(UploadError::MissingFields);
    }

    if !content_type.to_ascii_lowercase().starts_with("image/") {
        return Err(UploadError::InvalidContentType(content_type.to_string()));
    }

    let size = request
        .content_length
        .ok_or(UploadError::MissingContentLength)?;
    if size > max_bytes {
        return Err(UploadError::TooLarge {
            size,
            max: max_bytes,
        });
    }

    let extension = file_extension(filename)
        .ok_or_else(|| UploadError::MissingExtension(filename.to_string()))?;

    Ok(UploadPlan {
        key: format!("{}/{}.{}", prefix, object_id, extension),
        content_type: content_type.to_string(),
        content_length: size,
    })
}

/// Lower-cased extension restricted to `[a-z0-9]`
fn file_extension(filename: &str) -> Option<String> {
    let (_, raw) = filename.rsplit_once('.')?;
    let extension: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();

    (!extension.is_empty()).then_some(extension)
}

/// Issues presigned upload grants into the upload bucket
pub struct UploadAuthorizer {
    client: S3Client,
    bucket: String,
    region: String,
    prefix: String,
    expiry: Duration,
    max_bytes: u64,
}

impl UploadAuthorizer {
    pub fn new(client: S3Client, aws: &AwsConfig, s3: &S3Config) -> Self {
        Self {
            client,
            bucket: s3.bucket.clone(),
            region: aws.region.clone(),
            prefix: s3.upload_prefix.clone(),
            expiry: Duration::from_secs(s3.upload_url_expiry_secs),
            max_bytes: s3.max_upload_bytes,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Validate the request and presign a PUT for a fresh object key
    #[instrument(skip(self, request), fields(filename = ?request.filename))]
    pub async fn authorize(&self, request: &UploadRequest) -> Result<UploadGrant, UploadError> {
        let plan = plan_upload(request, &self.prefix, self.max_bytes, Uuid::new_v4())?;

        let presigning_config = PresigningConfig::expires_in(self.expiry)
            .map_err(|e| UploadError::Presign(e.to_string()))?;

        let size =
            i64::try_from(plan.content_length).map_err(|e| UploadError::Presign(e.to_string()))?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&plan.key)
            .content_type(&plan.content_type)
            .content_length(size)
            .presigned(presigning_config)
            .await
            .map_err(|e| UploadError::Presign(DisplayErrorContext(&e).to_string()))?;

        let mut fields: BTreeMap<String, String> = presigned
            .headers()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        if !fields.keys().any(|name| name.eq_ignore_ascii_case("content-type")) {
            fields.insert("Content-Type".to_string(), plan.content_type.clone());
        }
        if !fields.keys().any(|name| name.eq_ignore_ascii_case("content-length")) {
            fields.insert("Content-Length".to_string(), plan.content_length.to_string());
        }

        let expires_at = Utc::now() + chrono::Duration::seconds(self.expiry.as_secs() as i64);

        metrics::counter!("analysis.uploads.authorized").increment(1);
        info!(key = %plan.key, "Upload authorized");

        Ok(UploadGrant {
            url: presigned.uri().to_string(),
            method: presigned.method().to_string(),
            fields,
            image_url: public_object_url(&self.bucket, &self.region, &plan.key),
            id: plan.key,
            expires_at,
        })
    }
}
