use super::Storage;
use crate::address::Address;
use crate::error::{QuireError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStorage {
    blocks: RwLock<HashMap<Address, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &Address) -> Result<Bytes> {
        self.blocks
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or(QuireError::MissingBlock(*key))
    }

    async fn set(&self, key: &Address, value: Bytes, insert: bool, update: bool) -> Result<i64> {
        let mut blocks = self.blocks.write().await;
        let new_len = value.len() as i64;
        match blocks.get(key) {
            Some(_) if !update => Err(QuireError::Collision(*key)),
            None if !insert => Err(QuireError::MissingBlock(*key)),
            existing => {
                let old_len = existing.map(|bytes| bytes.len() as i64).unwrap_or(0);
                blocks.insert(*key, value);
                Ok(new_len - old_len)
            }
        }
    }

    async fn erase(&self, key: &Address) -> Result<i64> {
        self.blocks
            .write()
            .await
            .remove(key)
            .map(|bytes| -(bytes.len() as i64))
            .ok_or(QuireError::MissingBlock(*key))
    }

    async fn list(&self) -> Result<Vec<Address>> {
        Ok(self.blocks.read().await.keys().copied().collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[tokio::test]
    async fn test_insert_update_semantics() {
        let storage = MemoryStorage::new();
        let key = Address::hash(b"key");

        assert_err!(storage.set(&key, Bytes::from_static(b"a"), false, true).await);
        assert_eq!(
            storage.set(&key, Bytes::from_static(b"abc"), true, false).await.unwrap(),
            3
        );
        assert!(matches!(
            storage.set(&key, Bytes::from_static(b"x"), true, false).await,
            Err(QuireError::Collision(_))
        ));
        assert_eq!(
            storage.set(&key, Bytes::from_static(b"a"), false, true).await.unwrap(),
            -2
        );
        assert_eq!(storage.get(&key).await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(storage.list().await.unwrap(), vec![key]);
        assert_eq!(storage.erase(&key).await.unwrap(), -1);
        assert!(matches!(
            storage.get(&key).await,
            Err(QuireError::MissingBlock(_))
        ));
    }
}
