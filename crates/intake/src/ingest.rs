//! Upload registration: fingerprint, dedup, store, record.

use std::sync::Arc;

use tracing::{debug, info};

use crate::dedup::ContentDeduplicator;
use crate::error::{IntakeError, RepositoryError};
use crate::manifest::{Manifest, NewManifest};
use crate::ports::{ManifestRepository, StoragePort};
use crate::sanitize::redact_path;

#[derive(Debug, Clone)]
pub struct NewUpload {
    pub group_id: i64,
    pub project_id: i64,
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Overrides the type guessed from the file name.
    pub file_type: Option<String>,
    pub text_extractor_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Created(Manifest),
    /// The group already holds this content; nothing was stored.
    Duplicate(Manifest),
}

impl UploadOutcome {
    pub fn manifest(&self) -> &Manifest {
        match self {
            UploadOutcome::Created(m) | UploadOutcome::Duplicate(m) => m,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, UploadOutcome::Duplicate(_))
    }
}

pub struct Ingestor {
    storage: Arc<dyn StoragePort>,
    manifests: Arc<dyn ManifestRepository>,
    dedup: ContentDeduplicator,
}

impl Ingestor {
    pub fn new(storage: Arc<dyn StoragePort>, manifests: Arc<dyn ManifestRepository>) -> Self {
        let dedup = ContentDeduplicator::new(Arc::clone(&manifests));
        Self {
            storage,
            manifests,
            dedup,
        }
    }

    pub async fn register_upload(&self, upload: NewUpload) -> Result<UploadOutcome, IntakeError> {
        let digest = ContentDeduplicator::fingerprint(&upload.bytes);

        if let Some(existing) = self.dedup.is_duplicate(upload.group_id, &digest).await? {
            info!(
                group_id = upload.group_id,
                manifest_id = existing.id,
                file = %redact_path(&upload.filename),
                "Duplicate upload, reusing existing manifest"
            );
            return Ok(UploadOutcome::Duplicate(existing));
        }

        let file_type = upload.file_type.clone().unwrap_or_else(|| {
            mime_guess::from_path(&upload.filename)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });

        let stored = self
            .storage
            .save_file(upload.group_id, &upload.filename, &upload.bytes)
            .await?;
        debug!(path = %redact_path(&stored.storage_path), size = stored.file_size, "Stored upload");

        let draft = NewManifest {
            group_id: upload.group_id,
            project_id: upload.project_id,
            filename: upload.filename,
            storage_path: stored.storage_path,
            public_path: stored.public_path,
            file_type,
            file_size: stored.file_size,
            content_sha256: Some(digest.as_str().to_string()),
            page_count: None,
            text_extractor_id: upload.text_extractor_id,
        };

        match self.manifests.insert(&draft).await {
            Ok(manifest) => {
                info!(manifest_id = manifest.id, group_id = manifest.group_id, "Registered upload");
                Ok(UploadOutcome::Created(manifest))
            }
            // A concurrent upload of the same bytes won the insert.
            Err(RepositoryError::DuplicateContent { group_id, .. }) => {
                let existing = self
                    .dedup
                    .is_duplicate(group_id, &digest)
                    .await?
                    .ok_or_else(|| RepositoryError::NotFound {
                        entity: "manifest",
                        id: digest.to_string(),
                    })?;
                Ok(UploadOutcome::Duplicate(existing))
            }
            Err(e) => Err(e.into()),
        }
    }
}
