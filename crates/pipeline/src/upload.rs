//! Upload phase: local manifest → remote staging object, at most once per
//! distinct content.

use std::fmt;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use batchflow_core::{Fingerprint, FingerprintMatch, ObjectPath, StagingObject};

use crate::error::{PipelineError, PipelineResult};
use crate::retry::{retry, RetryPolicy};
use crate::storage::ObjectStore;

const READ_CHUNK: usize = 64 * 1024;

/// Size and SHA-256 of a local file, read in fixed-size chunks.
pub async fn fingerprint(path: &Path) -> std::io::Result<Fingerprint> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut size_bytes = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size_bytes += n as u64;
    }
    Ok(Fingerprint {
        size_bytes,
        sha256: format!("{:x}", hasher.finalize()),
    })
}

/// What an upload would do, without doing it.
#[derive(Debug, Clone, Serialize)]
pub struct UploadPlan {
    pub target: ObjectPath,
    pub fingerprint: Fingerprint,
    /// Object already at the target path, if any.
    pub existing: Option<StagingObject>,
    pub transfer_needed: bool,
}

impl fmt::Display for UploadPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = if self.transfer_needed {
            "would transfer"
        } else {
            "already staged"
        };
        write!(
            f,
            "upload: {action} {} ({} bytes, sha256 {})",
            self.target.uri(),
            self.fingerprint.size_bytes,
            self.fingerprint.short()
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub object: StagingObject,
    pub fingerprint: Fingerprint,
    /// `false` when an equivalent object was already present.
    pub transferred: bool,
}

impl fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = if self.transferred { "transferred" } else { "skipped, already staged" };
        write!(
            f,
            "upload: {} ({} bytes) {action}",
            self.object.uri(),
            self.object.size_bytes
        )
    }
}

pub struct StagingUploader<O> {
    objects: O,
    bucket: String,
    prefix: String,
    /// Fixed object name instead of the content-addressed default.
    object_name: Option<String>,
    retry: RetryPolicy,
}

impl<O: ObjectStore> StagingUploader<O> {
    pub fn new(objects: O, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            objects,
            bucket: bucket.into(),
            prefix: prefix.into().trim_end_matches('/').to_string(),
            object_name: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_object_name(mut self, name: impl Into<String>) -> Self {
        self.object_name = Some(name.into());
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn objects(&self) -> &O {
        &self.objects
    }

    /// `<prefix>/manifest-<sha256[..16]>.jsonl` unless a fixed name is set.
    pub fn target_path(&self, fingerprint: &Fingerprint) -> ObjectPath {
        let name = match &self.object_name {
            Some(name) => name.clone(),
            None => {
                let file = format!("manifest-{}.jsonl", fingerprint.short());
                if self.prefix.is_empty() {
                    file
                } else {
                    format!("{}/{file}", self.prefix)
                }
            }
        };
        ObjectPath::new(self.bucket.clone(), name)
    }

    /// Fingerprint the manifest and look at the target path. Creates nothing.
    pub async fn plan(&self, local: &Path) -> PipelineResult<UploadPlan> {
        let fingerprint = fingerprint(local).await?;
        if fingerprint.size_bytes == 0 {
            return Err(PipelineError::EmptyInput(format!(
                "{} is empty; nothing to upload",
                local.display()
            )));
        }

        let target = self.target_path(&fingerprint);
        let existing = retry(&self.retry, "stat", || self.objects.stat(&target))
            .await?
            .map(|meta| meta.into_staging());

        let transfer_needed = match &existing {
            None => true,
            Some(object) => match object.compare(&fingerprint) {
                found if found.is_equivalent() => false,
                FingerprintMatch::DigestMismatch => {
                    return Err(PipelineError::invariant(format!(
                        "{} has the same size as {} but a different sha256",
                        object.uri(),
                        local.display()
                    )));
                }
                _ => {
                    warn!(
                        object = %object.uri(),
                        remote_bytes = object.size_bytes,
                        local_bytes = fingerprint.size_bytes,
                        "staged object differs in size; it will be replaced"
                    );
                    true
                }
            },
        };

        Ok(UploadPlan {
            target,
            fingerprint,
            existing,
            transfer_needed,
        })
    }

    /// Make sure the manifest is staged, transferring it only if needed. The
    /// bucket is created only when a transfer is about to happen.
    pub async fn upload(&self, local: &Path) -> PipelineResult<UploadOutcome> {
        let plan = self.plan(local).await?;
        if !plan.transfer_needed {
            if let Some(object) = plan.existing {
                info!(object = %object.uri(), "manifest already staged; skipping transfer");
                return Ok(UploadOutcome {
                    object,
                    fingerprint: plan.fingerprint,
                    transferred: false,
                });
            }
        }

        retry(&self.retry, "ensure_bucket", || {
            self.objects.ensure_bucket(&self.bucket)
        })
        .await?;

        let target = plan.target;
        let fingerprint = plan.fingerprint;
        let meta = retry(&self.retry, "upload", || {
            self.objects.upload(local, &target, &fingerprint)
        })
        .await?;
        let object = meta.into_staging();

        match object.compare(&fingerprint) {
            found if found.is_equivalent() => {}
            FingerprintMatch::SizeMismatch => {
                return Err(PipelineError::invariant(format!(
                    "{} holds {} bytes after upload, expected {}",
                    object.uri(),
                    object.size_bytes,
                    fingerprint.size_bytes
                )));
            }
            _ => {
                return Err(PipelineError::invariant(format!(
                    "{} reports a different sha256 after upload",
                    object.uri()
                )));
            }
        }

        info!(
            object = %object.uri(),
            bytes = object.size_bytes,
            "manifest staged"
        );
        Ok(UploadOutcome {
            object,
            fingerprint,
            transferred: true,
        })
    }
}
