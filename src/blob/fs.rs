//! Filesystem blob store.
//!
//! Layout: `<root>/blobs/<first two hex chars of id>/<id>`. The path is a pure
//! function of the id, so lookups never scan directories. Writes land in
//! `<root>/tmp` first and are renamed into place once fully hashed, so readers
//! never observe a partial blob.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::traits::{BlobReader, BlobRef, BlobStore};
use crate::error::StorageError;

const CHUNK_SIZE: usize = 64 * 1024;

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open a store rooted at `root`, creating its directories.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        for dir in [root.join("blobs"), root.join("tmp")] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|source| StorageError::Write { path: dir, source })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, id: Uuid) -> PathBuf {
        let name = id.simple().to_string();
        self.root.join("blobs").join(&name[..2]).join(name)
    }

    async fn write_tmp(
        &self,
        tmp: &Path,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(String, u64), StorageError> {
        let write_err = |source| StorageError::Write {
            path: tmp.to_path_buf(),
            source,
        };
        let mut file = fs::File::create(tmp).await.map_err(write_err)?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = data.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await.map_err(write_err)?;
            size += n as u64;
        }
        file.flush().await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        Ok((hex::encode(hasher.finalize()), size))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn save(
        &self,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<BlobRef, StorageError> {
        let id = Uuid::new_v4();
        let tmp = self.root.join("tmp").join(format!("{}.part", id.simple()));

        let (hash, size) = match self.write_tmp(&tmp, data).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&tmp).await {
                    warn!(path = %tmp.display(), error = %cleanup, "Failed to remove partial blob");
                }
                return Err(e);
            }
        };

        let dest = self.blob_path(id);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        fs::rename(&tmp, &dest)
            .await
            .map_err(|source| StorageError::Write { path: dest, source })?;

        debug!(blob_id = %id, size, "Blob saved");
        Ok(BlobRef {
            id,
            hash,
            size,
            name: None,
        })
    }

    async fn open(&self, id: Uuid) -> Result<BlobReader, StorageError> {
        let path = self.blob_path(id);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::BlobNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok(BlobReader {
            size,
            reader: Box::new(file),
        })
    }

    async fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        match fs::remove_file(self.blob_path(id)).await {
            Ok(()) => {
                debug!(blob_id = %id, "Blob deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::BlobNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(store: &FsBlobStore, id: Uuid) -> Vec<u8> {
        let mut blob = store.open(id).await.unwrap();
        let mut out = Vec::new();
        blob.reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(blob.size, out.len() as u64);
        out
    }

    #[tokio::test]
    async fn saved_bytes_round_trip_with_matching_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();

        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let blob = store.save(&mut content.as_slice()).await.unwrap();
        assert_eq!(blob.size, content.len() as u64);

        let bytes = read_all(&store, blob.id).await;
        assert_eq!(bytes, content);
        assert_eq!(blob.hash, hex::encode(Sha256::digest(&bytes)));
    }

    #[tokio::test]
    async fn path_is_derived_from_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        let blob = store.save(&mut &b"abc"[..]).await.unwrap();

        let path = store.blob_path(blob.id);
        assert!(path.starts_with(dir.path().join("blobs")));
        assert!(path.exists());
        // Nothing left behind in tmp.
        let mut tmp = fs::read_dir(dir.path().join("tmp")).await.unwrap();
        assert!(tmp.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_and_deleted_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();

        assert!(matches!(
            store.open(Uuid::new_v4()).await,
            Err(StorageError::BlobNotFound(_))
        ));

        let blob = store.save(&mut &b"gone soon"[..]).await.unwrap();
        store.delete(blob.id).await.unwrap();
        assert!(matches!(
            store.open(blob.id).await,
            Err(StorageError::BlobNotFound(_))
        ));
        assert!(matches!(
            store.delete(blob.id).await,
            Err(StorageError::BlobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_blob_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();
        let blob = store.save(&mut &b""[..]).await.unwrap();
        assert_eq!(blob.size, 0);
        assert!(read_all(&store, blob.id).await.is_empty());
    }
}
