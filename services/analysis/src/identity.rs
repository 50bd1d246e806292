//! Object identity: the key correlating an uploaded image with its result.
//!
//! Uploaded images live at `{prefix}/{id}.{extension}`. The same identity is
//! recovered from the S3 key in a notification and from the public image URL
//! a client hands back to `/analyze`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while deriving an object identity
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("'{input}' is not under the '{prefix}/' upload prefix")]
    OutsidePrefix { input: String, prefix: String },

    #[error("'{0}' does not contain an object identity")]
    Empty(String),

    #[error("Object key is not valid UTF-8 after decoding: {0}")]
    InvalidEncoding(String),
}

/// Stable identity of one upload, used as the result store key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectIdentity(String);

impl ObjectIdentity {
    /// Derive the identity from an object key such as `uploads/abc.jpg`
    pub fn from_key(key: &str, prefix: &str) -> Result<Self, IdentityError> {
        let rest = key
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| IdentityError::OutsidePrefix {
                input: key.to_string(),
                prefix: prefix.to_string(),
            })?;

        let segment = rest.split('/').next().unwrap_or_default();
        Self::from_file_name(segment, key)
    }

    /// Derive the identity from a public image URL
    ///
    /// The last `/{prefix}/` marker wins, so bucket names or hosts that
    /// happen to contain the prefix do not confuse the lookup.
    pub fn from_image_url(url: &str, prefix: &str) -> Result<Self, IdentityError> {
        let marker = format!("/{}/", prefix);
        let (_, file_name) = url
            .rsplit_once(&marker)
            .ok_or_else(|| IdentityError::OutsidePrefix {
                input: url.to_string(),
                prefix: prefix.to_string(),
            })?;

        Self::from_file_name(file_name, url)
    }

    fn from_file_name(file_name: &str, input: &str) -> Result<Self, IdentityError> {
        let stem = file_name.split('.').next().unwrap_or_default();
        if stem.is_empty() {
            return Err(IdentityError::Empty(input.to_string()));
        }
        Ok(Self(stem.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Decode an object key as delivered in S3 event notifications
///
/// Notification keys are form-encoded: spaces arrive as `+` and everything
/// else percent-escaped.
pub fn decode_notification_key(raw: &str) -> Result<String, IdentityError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| IdentityError::InvalidEncoding(e.to_string()))
}

/// Public virtual-hosted style URL of an object
pub fn public_object_url(bucket: &str, region: &str, key: &str) -> String {
    format!("https://{}.s3.{}.amazonaws.com/{}", bucket, region, key)
}
