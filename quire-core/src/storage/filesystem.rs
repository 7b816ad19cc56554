use super::Storage;
use crate::address::Address;
use crate::error::{QuireError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use ulid::Ulid;

/// One file per block under `{root}/blocks/{prefix}/{address}`.
pub struct FilesystemStorage {
    root: PathBuf,
    capacity: Option<u64>,
    usage: AtomicI64,
    // Serializes check-then-write sequences on the same store.
    write_lock: Mutex<()>,
}

impl FilesystemStorage {
    pub async fn new(root: PathBuf, capacity: Option<u64>) -> Result<Self> {
        fs::create_dir_all(root.join("blocks")).await?;
        let storage = Self {
            root,
            capacity,
            usage: AtomicI64::new(0),
            write_lock: Mutex::new(()),
        };

        let mut usage = 0i64;
        for key in storage.list().await? {
            usage += fs::metadata(storage.block_path(&key)).await?.len() as i64;
        }
        storage.usage.store(usage, Ordering::SeqCst);
        tracing::debug!(
            "opened filesystem storage at {:?} with {} bytes in use",
            storage.root,
            usage
        );
        Ok(storage)
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn usage(&self) -> i64 {
        self.usage.load(Ordering::SeqCst)
    }

    fn block_path(&self, key: &Address) -> PathBuf {
        let name = key.to_string();
        // First 2 hex chars as subdirectory to keep directories small
        self.root.join("blocks").join(&name[..2]).join(name)
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    async fn get(&self, key: &Address) -> Result<Bytes> {
        match fs::read(self.block_path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(QuireError::MissingBlock(*key))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn set(&self, key: &Address, value: Bytes, insert: bool, update: bool) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let path = self.block_path(key);

        let old_len = match fs::metadata(&path).await {
            Ok(meta) => Some(meta.len() as i64),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => return Err(error.into()),
        };

        match old_len {
            Some(_) if !update => return Err(QuireError::Collision(*key)),
            None if !insert => return Err(QuireError::MissingBlock(*key)),
            _ => {}
        }

        let delta = value.len() as i64 - old_len.unwrap_or(0);
        if let Some(capacity) = self.capacity {
            if self.usage() + delta > capacity as i64 {
                return Err(QuireError::Internal(format!(
                    "storage capacity of {} bytes exceeded",
                    capacity
                )));
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to temporary file first, then rename for atomicity
        let temp_path = path.with_extension(format!("{}.tmp", Ulid::new()));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&value).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &path).await?;

        self.usage.fetch_add(delta, Ordering::SeqCst);
        tracing::trace!("stored block {} ({} bytes)", key.fmt_short(), value.len());
        Ok(delta)
    }

    async fn erase(&self, key: &Address) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let path = self.block_path(key);
        let len = match fs::metadata(&path).await {
            Ok(meta) => meta.len() as i64,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(QuireError::MissingBlock(*key));
            }
            Err(error) => return Err(error.into()),
        };
        fs::remove_file(&path).await?;
        self.usage.fetch_sub(len, Ordering::SeqCst);
        Ok(-len)
    }

    async fn list(&self) -> Result<Vec<Address>> {
        let mut keys = Vec::new();
        let mut prefixes = fs::read_dir(self.root.join("blocks")).await?;

        while let Some(prefix) = prefixes.next_entry().await? {
            if !prefix.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(prefix.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    // Skips leftover temporary files.
                    if let Ok(key) = name.parse::<Address>() {
                        keys.push(key);
                    }
                }
            }
        }

        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filesystem_storage() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path().to_path_buf(), None)
            .await
            .unwrap();

        let key = Address::hash(b"block");
        let data = Bytes::from("test data content");

        storage.set(&key, data.clone(), true, false).await.unwrap();
        assert_eq!(storage.get(&key).await.unwrap(), data);
        assert_eq!(storage.list().await.unwrap(), vec![key]);
        assert_eq!(storage.usage(), data.len() as i64);

        assert!(matches!(
            storage.set(&key, data.clone(), true, false).await,
            Err(QuireError::Collision(_))
        ));

        storage.erase(&key).await.unwrap();
        assert!(matches!(
            storage.get(&key).await,
            Err(QuireError::MissingBlock(_))
        ));
        assert_eq!(storage.usage(), 0);
    }

    #[tokio::test]
    async fn test_reopen_lists_existing_blocks() {
        let temp_dir = tempfile::tempdir().unwrap();
        let key = Address::hash(b"persisted");
        {
            let storage = FilesystemStorage::new(temp_dir.path().to_path_buf(), None)
                .await
                .unwrap();
            storage
                .set(&key, Bytes::from_static(b"abc"), true, true)
                .await
                .unwrap();
        }

        let reopened = FilesystemStorage::new(temp_dir.path().to_path_buf(), None)
            .await
            .unwrap();
        assert_eq!(reopened.list().await.unwrap(), vec![key]);
        assert_eq!(reopened.usage(), 3);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path().to_path_buf(), Some(4))
            .await
            .unwrap();
        let result = storage
            .set(&Address::hash(b"big"), Bytes::from_static(b"too large"), true, true)
            .await;
        assert!(result.is_err());
    }
}
