use thiserror::Error;

use crate::db::Store;
use crate::error::StoreError;
use crate::models::{Conversation, Message};

/// Routes application messages: membership check, size check, durable
/// insert-plus-receipts via the Store, then hands the inserted message back
/// to the gateway for online fan-out. Offline members simply keep a
/// `pending` receipt; `drain_pending` replays it to them on reconnect.
/// Also owns conversation/membership management, since both are thin policy
/// layers over the same Store tables.
pub struct DeliveryEngine {
    store: Store,
    max_message_size: usize,
    max_group_members: usize,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("not a conversation member")]
    NotMember,
    #[error("message too large")]
    MessageTooLarge,
    #[error("conversation not found")]
    GroupNotFound,
    #[error("not a group admin")]
    NotGroupAdmin,
    #[error("already a member")]
    AlreadyMember,
    #[error("cannot remove self")]
    CannotRemoveSelf,
    #[error("group full")]
    GroupFull,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DeliveryEngine {
    pub fn new(store: Store, max_message_size: usize, max_group_members: usize) -> Self {
        Self { store, max_message_size, max_group_members }
    }

    pub async fn create_conversation(
        &self,
        creator_id: &str,
        title: &str,
        member_ids: &[String],
    ) -> Result<Conversation, DeliveryError> {
        if member_ids.len() + 1 > self.max_group_members {
            return Err(DeliveryError::GroupFull);
        }
        Ok(self.store.create_conversation(creator_id, title, member_ids).await?)
    }

    /// Only the requester's own admin membership authorizes adding others.
    pub async fn add_member(
        &self,
        requester_id: &str,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<(), DeliveryError> {
        self.require_admin(requester_id, conversation_id).await?;

        let members = self.store.list_members(conversation_id).await?;
        if members.len() + 1 > self.max_group_members {
            return Err(DeliveryError::GroupFull);
        }

        match self.store.add_member(conversation_id, user_id).await {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict(_)) => Err(DeliveryError::AlreadyMember),
            Err(e) => Err(e.into()),
        }
    }

    /// Admins may remove anyone but themselves; leaving as the last member
    /// is refused rather than leaving an empty conversation. An admin who
    /// leaves a non-empty conversation hands off to the oldest remaining
    /// member first.
    pub async fn remove_member(
        &self,
        requester_id: &str,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<(), DeliveryError> {
        let members = self.store.list_members(conversation_id).await?;
        if members.is_empty() {
            return Err(DeliveryError::GroupNotFound);
        }

        let requester_is_admin = members.iter().any(|m| m.user_id == requester_id && m.role == "admin");
        if requester_id != user_id && !requester_is_admin {
            return Err(DeliveryError::NotGroupAdmin);
        }
        if requester_id == user_id && members.len() == 1 {
            return Err(DeliveryError::CannotRemoveSelf);
        }

        let target_was_admin = members.iter().any(|m| m.user_id == user_id && m.role == "admin");
        self.store.remove_member(conversation_id, user_id).await?;

        if target_was_admin && members.len() > 1 {
            self.store.transfer_admin(conversation_id).await?;
        }
        Ok(())
    }

    async fn require_admin(&self, user_id: &str, conversation_id: &str) -> Result<(), DeliveryError> {
        let members = self.store.list_members(conversation_id).await?;
        if members.is_empty() {
            return Err(DeliveryError::GroupNotFound);
        }
        if !members.iter().any(|m| m.user_id == user_id && m.role == "admin") {
            return Err(DeliveryError::NotGroupAdmin);
        }
        Ok(())
    }

    pub async fn send(
        &self,
        sender_id: &str,
        conversation_id: &str,
        payload: &[u8],
        message_type: &str,
        epoch: i64,
    ) -> Result<Message, DeliveryError> {
        if !self.store.is_member(conversation_id, sender_id).await? {
            return Err(DeliveryError::NotMember);
        }
        if payload.len() > self.max_message_size {
            return Err(DeliveryError::MessageTooLarge);
        }

        let message = self
            .store
            .insert_message(conversation_id, sender_id, payload, message_type, epoch)
            .await?;
        Ok(message)
    }

    /// Idempotent; tolerates out-of-order or duplicate acks.
    pub async fn ack(&self, recipient_id: &str, message_id: &str) -> Result<(), DeliveryError> {
        match self.store.advance_delivery(message_id, recipient_id, "delivered").await {
            Ok(()) => Ok(()),
            Err(StoreError::InvalidInput(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every message whose receipt for `recipient_id` is still `pending`,
    /// in ascending `server_timestamp` -- replayed on every reconnection
    /// until acknowledged (at-least-once delivery).
    pub async fn drain_pending(&self, recipient_id: &str) -> Result<Vec<Message>, DeliveryError> {
        Ok(self.store.pending_messages_for(recipient_id).await?)
    }

    pub async fn members_of(&self, conversation_id: &str) -> Result<Vec<String>, DeliveryError> {
        Ok(self
            .store
            .list_members(conversation_id)
            .await?
            .into_iter()
            .map(|m| m.user_id)
            .collect())
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
    async fn send_rejects_non_member() {
        let store = test_store().await;
        let alice = store.create_user("alice", "Alice").await.unwrap();
        let bob = store.create_user("bob", "Bob").await.unwrap();
        let convo = store.create_conversation(&alice.id, "room", &[]).await.unwrap();
        let engine = DeliveryEngine::new(store, 65536, 256);

        let err = engine.send(&bob.id, &convo.id, b"hi", "application", 0).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotMember));
    }

    #[tokio::test]
    async fn timestamps_strictly_increase_within_conversation() {
        let store = test_store().await;
        let alice = store.create_user("alice", "Alice").await.unwrap();
        let bob = store.create_user("bob", "Bob").await.unwrap();
        let convo = store
            .create_conversation(&alice.id, "room", std::slice::from_ref(&bob.id))
            .await
            .unwrap();
        let engine = DeliveryEngine::new(store, 65536, 256);

        let m1 = engine.send(&alice.id, &convo.id, b"one", "application", 0).await.unwrap();
        let m2 = engine.send(&alice.id, &convo.id, b"two", "application", 0).await.unwrap();
        assert!(m2.server_timestamp > m1.server_timestamp);
    }

    #[tokio::test]
    async fn drain_pending_returns_offline_messages_in_order() {
        let store = test_store().await;
        let alice = store.create_user("alice", "Alice").await.unwrap();
        let bob = store.create_user("bob", "Bob").await.unwrap();
        let convo = store
            .create_conversation(&alice.id, "room", std::slice::from_ref(&bob.id))
            .await
            .unwrap();
        let engine = DeliveryEngine::new(store, 65536, 256);

        engine.send(&alice.id, &convo.id, b"one", "application", 0).await.unwrap();
        engine.send(&alice.id, &convo.id, b"two", "application", 0).await.unwrap();

        let pending = engine.drain_pending(&bob.id).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].server_timestamp <= pending[1].server_timestamp);
    }

    #[tokio::test]
    async fn non_admin_cannot_add_members() {
        let store = test_store().await;
        let alice = store.create_user("alice", "Alice").await.unwrap();
        let bob = store.create_user("bob", "Bob").await.unwrap();
        let carol = store.create_user("carol", "Carol").await.unwrap();
        let convo = store
            .create_conversation(&alice.id, "room", std::slice::from_ref(&bob.id))
            .await
            .unwrap();
        let engine = DeliveryEngine::new(store, 65536, 256);

        let err = engine.add_member(&bob.id, &convo.id, &carol.id).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotGroupAdmin));
    }

    #[tokio::test]
    async fn adding_existing_member_is_rejected() {
        let store = test_store().await;
        let alice = store.create_user("alice", "Alice").await.unwrap();
        let bob = store.create_user("bob", "Bob").await.unwrap();
        let convo = store
            .create_conversation(&alice.id, "room", std::slice::from_ref(&bob.id))
            .await
            .unwrap();
        let engine = DeliveryEngine::new(store, 65536, 256);

        let err = engine.add_member(&alice.id, &convo.id, &bob.id).await.unwrap_err();
        assert!(matches!(err, DeliveryError::AlreadyMember));
    }

    #[tokio::test]
    async fn last_member_cannot_remove_self() {
        let store = test_store().await;
        let alice = store.create_user("alice", "Alice").await.unwrap();
        let convo = store.create_conversation(&alice.id, "room", &[]).await.unwrap();
        let engine = DeliveryEngine::new(store, 65536, 256);

        let err = engine.remove_member(&alice.id, &convo.id, &alice.id).await.unwrap_err();
        assert!(matches!(err, DeliveryError::CannotRemoveSelf));
    }

    #[tokio::test]
    async fn admin_leaving_promotes_oldest_remaining_member() {
        let store = test_store().await;
        let alice = store.create_user("alice", "Alice").await.unwrap();
        let bob = store.create_user("bob", "Bob").await.unwrap();
        let convo = store
            .create_conversation(&alice.id, "room", std::slice::from_ref(&bob.id))
            .await
            .unwrap();
        let engine = DeliveryEngine::new(store.clone(), 65536, 256);

        engine.remove_member(&alice.id, &convo.id, &alice.id).await.unwrap();

        let members = store.list_members(&convo.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, bob.id);
        assert_eq!(members[0].role, "admin");
    }
}
