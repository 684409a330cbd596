//! Cross-module scenarios that don't fit a single unit-test module: a
//! conversation's full lifecycle across Store, Delivery Engine, MLS Service,
//! and Hub wired together the way `main.rs` assembles them, minus the
//! WebSocket transport itself (no software authenticator is available to
//! complete a real WebAuthn ceremony in a test process).

use sovereign_server::db::{init_db, DbConfig};
use sovereign_server::delivery::{DeliveryEngine, DeliveryError};
use sovereign_server::gateway::hub::{outbound_channel, Hub, SessionHandle};
use sovereign_server::gateway::proto::{self, MessageType};
use sovereign_server::mls::{CommitResult, MlsService};
use sovereign_server::Store;

async fn fresh_store() -> Store {
    let pool = init_db(DbConfig { database_path: ":memory:".to_string(), ..Default::default() })
        .await
        .expect("in-memory schema should migrate cleanly");
    Store::new(pool)
}

/// E2: a message sent while the recipient is offline is queued as a pending
/// receipt and replayed, in order, once the recipient's session registers
/// with the Hub and drains it -- before any fresh traffic competes for the
/// same outbound channel.
#[tokio::test]
async fn offline_recipient_receives_queued_messages_on_reconnect() {
    let store = fresh_store().await;
    let alice = store.create_user("alice", "Alice").await.unwrap();
    let bob = store.create_user("bob", "Bob").await.unwrap();
    let convo = store
        .create_conversation(&alice.id, "room", std::slice::from_ref(&bob.id))
        .await
        .unwrap();
    let delivery = DeliveryEngine::new(store.clone(), 65536, 256);

    delivery.send(&alice.id, &convo.id, b"are you there", "application", 0).await.unwrap();
    delivery.send(&alice.id, &convo.id, b"still there?", "application", 0).await.unwrap();

    let hub = Hub::spawn();
    let (tx, mut rx) = outbound_channel(8);
    hub.register(SessionHandle { conn_id: "bob-conn".to_string(), user_id: None, outbound: tx, connected_seq: 0 });
    hub.set_authenticated("bob-conn", &bob.id, 5);

    let pending = delivery.drain_pending(&bob.id).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending[0].server_timestamp <= pending[1].server_timestamp);

    for message in &pending {
        let envelope = proto::server_envelope(
            MessageType::MessageReceive,
            proto::MessageReceive {
                conversation_id: message.conversation_id.clone(),
                message_id: message.id.clone(),
                sender_id: message.sender_id.clone(),
                server_timestamp_us: message.server_timestamp,
                encrypted_payload: message.payload.clone(),
                message_type: message.message_type.clone(),
            },
        );
        assert!(hub.send_to_user(&bob.id, envelope).await);
    }

    let first = rx.recv().await.unwrap();
    assert_eq!(first.r#type, MessageType::MessageReceive as i32);
    let second = rx.recv().await.unwrap();
    assert_eq!(second.r#type, MessageType::MessageReceive as i32);
}

/// E3: two members submit commits against the same epoch; exactly one wins
/// and advances the epoch, the other observes the conflict instead of
/// silently overwriting group state.
#[tokio::test]
async fn concurrent_commits_at_same_epoch_produce_one_winner() {
    let store = fresh_store().await;
    let alice = store.create_user("alice", "Alice").await.unwrap();
    let convo = store.create_conversation(&alice.id, "room", &[]).await.unwrap();
    let mls = MlsService::new(store.clone());

    let first = mls.apply_commit(&convo.id, 0, b"commit-a", 65536).await.unwrap();
    let second = mls.apply_commit(&convo.id, 0, b"commit-b", 65536).await.unwrap();

    assert_eq!(first, CommitResult::Accepted { new_epoch: 1 });
    assert!(matches!(second, CommitResult::EpochMismatch { current_epoch: 1 }));
}

/// Admin succession combined with membership enforcement: once the sole
/// admin leaves a populated conversation, the promoted successor -- and only
/// the promoted successor -- can add further members.
#[tokio::test]
async fn admin_succession_transfers_add_member_authority() {
    let store = fresh_store().await;
    let alice = store.create_user("alice", "Alice").await.unwrap();
    let bob = store.create_user("bob", "Bob").await.unwrap();
    let carol = store.create_user("carol", "Carol").await.unwrap();
    let convo = store
        .create_conversation(&alice.id, "room", std::slice::from_ref(&bob.id))
        .await
        .unwrap();
    let delivery = DeliveryEngine::new(store.clone(), 65536, 256);

    delivery.remove_member(&alice.id, &convo.id, &alice.id).await.unwrap();

    let err = delivery.add_member(&alice.id, &convo.id, &carol.id).await.unwrap_err();
    assert!(matches!(err, DeliveryError::NotGroupAdmin));

    delivery.add_member(&bob.id, &convo.id, &carol.id).await.unwrap();
    let members = delivery.members_of(&convo.id).await.unwrap();
    assert!(members.contains(&carol.id));
}

/// E1 final step: once the recipient acks a message, the sender's own
/// session is notified with MESSAGE_DELIVERED carrying the same message id.
#[tokio::test]
async fn ack_notifies_original_sender_of_delivery() {
    let store = fresh_store().await;
    let alice = store.create_user("alice", "Alice").await.unwrap();
    let bob = store.create_user("bob", "Bob").await.unwrap();
    let convo = store
        .create_conversation(&alice.id, "room", std::slice::from_ref(&bob.id))
        .await
        .unwrap();
    let delivery = DeliveryEngine::new(store.clone(), 65536, 256);
    let message = delivery.send(&alice.id, &convo.id, b"hi bob", "application", 0).await.unwrap();

    let hub = Hub::spawn();
    let (tx, mut rx) = outbound_channel(8);
    hub.register(SessionHandle { conn_id: "alice-conn".to_string(), user_id: None, outbound: tx, connected_seq: 0 });
    hub.set_authenticated("alice-conn", &alice.id, 5);

    delivery.ack(&bob.id, &message.id).await.unwrap();
    let stored = store.get_message(&message.id).await.unwrap().unwrap();
    let delivered = proto::server_envelope(
        MessageType::MessageDelivered,
        proto::MessageDelivered { message_id: stored.id.clone() },
    );
    assert!(hub.send_to_user(&stored.sender_id, delivered).await);

    let received = rx.recv().await.unwrap();
    assert_eq!(received.r#type, MessageType::MessageDelivered as i32);
    let payload: proto::MessageDelivered = prost::Message::decode(received.payload.as_slice()).unwrap();
    assert_eq!(payload.message_id, message.id);
}

/// A conversation at its member cap refuses a new join even from an admin.
#[tokio::test]
async fn group_full_rejects_additional_members() {
    let store = fresh_store().await;
    let alice = store.create_user("alice", "Alice").await.unwrap();
    let bob = store.create_user("bob", "Bob").await.unwrap();
    let convo = store.create_conversation(&alice.id, "room", &[]).await.unwrap();
    let delivery = DeliveryEngine::new(store.clone(), 65536, 1);

    let err = delivery.add_member(&alice.id, &convo.id, &bob.id).await.unwrap_err();
    assert!(matches!(err, DeliveryError::GroupFull));
}
