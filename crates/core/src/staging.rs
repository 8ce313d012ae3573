//! Remote staging objects and local manifest fingerprints.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Location of an object in remote storage (`gs://bucket/name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPath {
    pub bucket: String,
    pub name: String,
}

impl ObjectPath {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
        }
    }

    pub fn uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.name)
    }
}

impl core::fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.name)
    }
}

impl FromStr for ObjectPath {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("gs://")
            .ok_or_else(|| ModelError::validation(format!("not a gs:// uri: {s}")))?;
        let (bucket, name) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ModelError::validation(format!("missing bucket in {s}")));
        }
        Ok(Self::new(bucket, name))
    }
}

/// Size and content digest of a local manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
}

impl Fingerprint {
    /// Short content tag used in content-addressed object names.
    pub fn short(&self) -> &str {
        &self.sha256[..self.sha256.len().min(16)]
    }
}

/// A manifest once durably copied to remote storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingObject {
    pub remote_path: ObjectPath,
    pub size_bytes: u64,
    /// SHA-256 recorded in object metadata, when the object carries one.
    pub fingerprint: Option<String>,
}

/// Result of comparing a remote object against a local fingerprint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FingerprintMatch {
    /// Sizes match and digests match.
    Identical,
    /// Sizes match but the remote has no digest to compare.
    SizeOnly,
    SizeMismatch,
    DigestMismatch,
}

impl FingerprintMatch {
    pub fn is_equivalent(self) -> bool {
        matches!(self, FingerprintMatch::Identical | FingerprintMatch::SizeOnly)
    }
}

impl StagingObject {
    pub fn uri(&self) -> String {
        self.remote_path.uri()
    }

    pub fn compare(&self, local: &Fingerprint) -> FingerprintMatch {
        if self.size_bytes != local.size_bytes {
            return FingerprintMatch::SizeMismatch;
        }
        match &self.fingerprint {
            Some(remote) if remote.eq_ignore_ascii_case(&local.sha256) => {
                FingerprintMatch::Identical
            }
            Some(_) => FingerprintMatch::DigestMismatch,
            None => FingerprintMatch::SizeOnly,
        }
    }
}
