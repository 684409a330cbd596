use crate::db::Store;
use crate::error::StoreError;
use crate::models::KeyPackage;

/// Thin policy layer over the Store's key-package and group-state tables.
/// Never touches plaintext; every blob here is opaque to the server.
pub struct MlsService {
    store: Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    Accepted { new_epoch: i64 },
    EpochMismatch { current_epoch: i64 },
}

impl MlsService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn upload_key_package(&self, user_id: &str, blob: &[u8]) -> Result<KeyPackage, StoreError> {
        self.store.upload_key_package(user_id, blob).await
    }

    pub async fn fetch_key_package(&self, user_id: &str) -> Result<Vec<u8>, StoreError> {
        self.store.fetch_key_package(user_id).await.map(|kp| kp.blob)
    }

    pub async fn count_key_packages(&self, user_id: &str) -> Result<i64, StoreError> {
        self.store.count_key_packages(user_id).await
    }

    /// Validates only structurally (non-empty, size-bounded); never
    /// verifies MLS signatures or decrypts. `expected_epoch` must match the
    /// conversation's current epoch or the commit is rejected without
    /// touching storage.
    pub async fn apply_commit(
        &self,
        conversation_id: &str,
        expected_epoch: i64,
        blob: &[u8],
        max_size: usize,
    ) -> Result<CommitResult, StoreError> {
        if blob.is_empty() || blob.len() > max_size {
            return Err(StoreError::InvalidInput("invalid commit blob".to_string()));
        }

        let group = self
            .store
            .get_group_state(conversation_id)
            .await?
            .ok_or(StoreError::NotFound)?;

        if expected_epoch != group.epoch {
            return Ok(CommitResult::EpochMismatch { current_epoch: group.epoch });
        }

        let accepted = self
            .store
            .advance_epoch(conversation_id, group.epoch, blob)
            .await?;

        if accepted {
            Ok(CommitResult::Accepted { new_epoch: group.epoch + 1 })
        } else {
            let current = self
                .store
                .get_group_state(conversation_id)
                .await?
                .map(|g| g.epoch)
                .unwrap_or(group.epoch);
            Ok(CommitResult::EpochMismatch { current_epoch: current })
        }
    }

    /// Welcome blobs carry no server-meaningful structure beyond a size
    /// bound; relaying is the Delivery Engine's job once this returns Ok.
    pub fn validate_welcome(&self, blob: &[u8], max_size: usize) -> Result<(), StoreError> {
        if blob.is_empty() || blob.len() > max_size {
            return Err(StoreError::InvalidInput("invalid welcome blob".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        let pool = crate::db::init_db(crate::db::DbConfig {
            database_path: ":memory:".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        Store::new(pool)
    }

    #[tokio::test]
    async fn fetch_key_package_never_returns_twice() {
        let store = test_store().await;
        let user = store.create_user("alice", "Alice").await.unwrap();
        let mls = MlsService::new(store.clone());
        mls.upload_key_package(&user.id, b"kp-1").await.unwrap();

        let first = mls.fetch_key_package(&user.id).await.unwrap();
        assert_eq!(first, b"kp-1");
        let second = mls.fetch_key_package(&user.id).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn commit_with_stale_epoch_is_rejected() {
        let store = test_store().await;
        let alice = store.create_user("alice", "Alice").await.unwrap();
        let convo = store.create_conversation(&alice.id, "room", &[]).await.unwrap();
        let mls = MlsService::new(store.clone());

        let result = mls.apply_commit(&convo.id, 5, b"commit", 65536).await.unwrap();
        assert_eq!(result, CommitResult::EpochMismatch { current_epoch: 0 });

        let result = mls.apply_commit(&convo.id, 0, b"commit", 65536).await.unwrap();
        assert_eq!(result, CommitResult::Accepted { new_epoch: 1 });
    }
}
