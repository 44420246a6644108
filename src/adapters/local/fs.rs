use crate::ports::storage::{ObjectStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};

/// Object store backed by a local directory: objects land at
/// `root/<bucket>/<key>`.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the on-disk location of an object.
    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let invalid = || StorageError::InvalidKey {
            key: format!("{bucket}/{key}"),
        };

        // Keys are usually local file paths; strip any root so they nest
        // under the bucket directory.
        let mut relative = PathBuf::new();
        for component in Path::new(key).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
                Component::ParentDir => return Err(invalid()),
            }
        }

        if bucket.is_empty() || bucket.contains('/') || bucket.contains('\\') || bucket == ".." {
            return Err(invalid());
        }
        if relative.as_os_str().is_empty() {
            return Err(invalid());
        }

        Ok(self.root.join(bucket).join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write beside the target and rename so readers never see a partial object.
        let mut staging = path.clone().into_os_string();
        staging.push(".part");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, &body).await?;
        tokio::fs::rename(&staging, &path).await?;

        tracing::debug!(bucket, key, bytes = body.len(), "stored object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_writes_under_bucket() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store
            .put("videos", "/tmp/out/job-1/clip/0/data00.ts", Bytes::from_static(b"segment"))
            .await
            .unwrap();

        let stored = dir.path().join("videos/tmp/out/job-1/clip/0/data00.ts");
        assert_eq!(std::fs::read(stored).unwrap(), b"segment");
    }

    #[tokio::test]
    async fn test_put_overwrites_existing_object() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store.put("b", "a.m3u8", Bytes::from_static(b"one")).await.unwrap();
        store.put("b", "a.m3u8", Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("b/a.m3u8")).unwrap(), b"two");
        assert!(!dir.path().join("b/a.m3u8.part").exists());
    }

    #[test]
    fn test_rejects_traversal() {
        let store = FsObjectStore::new("/data");
        assert!(matches!(
            store.object_path("b", "../../etc/passwd"),
            Err(StorageError::InvalidKey { .. })
        ));
        assert!(store.object_path("../b", "key").is_err());
        assert!(store.object_path("b", "/").is_err());
    }
}
