//! Blob store interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::error::StorageError;

/// Identity of a stored blob. The bytes stay in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub id: Uuid,
    /// Hex SHA-256 of the content.
    pub hash: String,
    pub size: u64,
    /// Original file name or artifact path, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An opened blob.
pub struct BlobReader {
    pub size: u64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobReader").field("size", &self.size).finish()
    }
}

/// Save/open/delete access to stored bytes, addressed by id.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Consume `data` to the end and store it under a fresh id.
    async fn save(
        &self,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<BlobRef, StorageError>;

    async fn open(&self, id: Uuid) -> Result<BlobReader, StorageError>;

    async fn delete(&self, id: Uuid) -> Result<(), StorageError>;
}
