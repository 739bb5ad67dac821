//! Content fingerprinting and duplicate lookup.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::RepositoryError;
use crate::manifest::Manifest;
use crate::ports::ManifestRepository;

/// Lowercase hex SHA-256 of a document's raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read-only duplicate detection; holds no state of its own.
#[derive(Clone)]
pub struct ContentDeduplicator {
    manifests: Arc<dyn ManifestRepository>,
}

impl ContentDeduplicator {
    pub fn new(manifests: Arc<dyn ManifestRepository>) -> Self {
        Self { manifests }
    }

    pub fn fingerprint(bytes: &[u8]) -> ContentDigest {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        ContentDigest(format!("{:x}", hasher.finalize()))
    }

    /// The manifest in `group_id` that already carries `digest`, if any.
    pub async fn is_duplicate(
        &self,
        group_id: i64,
        digest: &ContentDigest,
    ) -> Result<Option<Manifest>, RepositoryError> {
        self.manifests
            .find_by_content_hash(group_id, digest.as_str())
            .await
    }
}
