use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::time::Duration;
use ulid::Ulid;

use crate::error::StoreError;
use crate::models::{
    now_micros, Challenge, Conversation, Credential, DeliveryReceipt, KeyPackage, Membership,
    Message, MlsGroupState, Session, User,
};

pub type DbPool = SqlitePool;
pub type Result<T> = std::result::Result<T, StoreError>;

/// Database configuration: env-var defaults, no hidden surprises.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_path: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_path: std::env::var("DATABASE_PATH").unwrap_or_else(|_| "sovereign.db".to_string()),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Opens (and, if necessary, creates) the embedded database and runs
/// migrations. `:memory:` is accepted for tests.
pub async fn init_db(config: DbConfig) -> anyhow::Result<DbPool> {
    let url = if config.database_path == ":memory:" {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite://{}?mode=rwc", config.database_path)
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&url)
        .await?;

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await.ok();

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

pub async fn init_db_default() -> anyhow::Result<DbPool> {
    init_db(DbConfig::default()).await
}

/// A thin wrapper over the pool that every service depends on. Multi-
/// statement mutations go through `transaction`, which commits on `Ok` and
/// rolls back on any returned error, collapsing repeated `pool.begin()` /
/// `tx.commit()` call sites into one combinator.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn transaction<'a, F, T>(&'a self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(
            &'c mut Transaction<'a, Sqlite>,
        ) -> futures::future::BoxFuture<'c, Result<T>>,
    {
        let mut tx = self.pool.begin().await.map_err(StoreError::Internal)?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await.map_err(StoreError::Internal)?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback().await.ok();
                Err(err)
            }
        }
    }

    // ==========================================================================
    // Users
    // ==========================================================================

    pub async fn create_user(&self, username: &str, display_name: &str) -> Result<User> {
        let id = Ulid::new().to_string();
        let now = now_micros();
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM users WHERE username = ?1 COLLATE NOCASE")
                .bind(username)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::Internal)?;
        if existing.is_some() {
            return Err(StoreError::Conflict(format!("username {username} already taken")));
        }

        sqlx::query(
            "INSERT INTO users (id, username, display_name, role, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'member', 1, ?4, ?4)",
        )
        .bind(&id)
        .bind(username)
        .bind(display_name)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Internal)?;

        self.get_user(&id).await?.ok_or(StoreError::NotFound)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(
            "SELECT id, username, display_name, role, enabled, created_at, updated_at FROM users WHERE id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(
            "SELECT id, username, display_name, role, enabled, created_at, updated_at FROM users WHERE username = ?1 COLLATE NOCASE",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    /// Promotes the oldest remaining member of `conversation_id` to admin.
    /// Used when the sole admin leaves.
    pub async fn transfer_admin(&self, conversation_id: &str) -> Result<Membership> {
        let next: Option<Membership> = sqlx::query_as::<_, Membership>(
            "SELECT conversation_id, user_id, role, joined_at FROM memberships
             WHERE conversation_id = ?1 ORDER BY joined_at ASC LIMIT 1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Internal)?;

        let next = next.ok_or(StoreError::NotFound)?;
        sqlx::query("UPDATE memberships SET role = 'admin' WHERE conversation_id = ?1 AND user_id = ?2")
            .bind(conversation_id)
            .bind(&next.user_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Internal)?;

        Ok(Membership { role: "admin".to_string(), ..next })
    }

    // ==========================================================================
    // Credentials
    // ==========================================================================

    pub async fn create_credential(
        &self,
        user_id: &str,
        credential_id: &[u8],
        public_key: &[u8],
        sign_count: i64,
    ) -> Result<Credential> {
        let id = Ulid::new().to_string();
        sqlx::query(
            "INSERT INTO credentials (id, user_id, credential_id, public_key, sign_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(credential_id)
        .bind(public_key)
        .bind(sign_count)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Internal)?;

        sqlx::query_as::<_, Credential>(
            "SELECT id, user_id, credential_id, public_key, sign_count FROM credentials WHERE id = ?1",
        )
        .bind(&id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    pub async fn get_credential(&self, credential_id: &[u8]) -> Result<Option<Credential>> {
        sqlx::query_as::<_, Credential>(
            "SELECT id, user_id, credential_id, public_key, sign_count FROM credentials WHERE credential_id = ?1",
        )
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    pub async fn list_credentials_for_user(&self, user_id: &str) -> Result<Vec<Credential>> {
        sqlx::query_as::<_, Credential>(
            "SELECT id, user_id, credential_id, public_key, sign_count FROM credentials WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    /// Advances `sign_count`. Rejects (returns `false`) if the new count is
    /// not strictly greater than the stored one -- the clone-detection
    /// invariant.
    pub async fn advance_sign_count(&self, credential_id: &[u8], new_count: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE credentials SET sign_count = ?1 WHERE credential_id = ?2 AND sign_count < ?1",
        )
        .bind(new_count)
        .bind(credential_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Internal)?;
        Ok(result.rows_affected() == 1)
    }

    // ==========================================================================
    // Sessions
    // ==========================================================================

    pub async fn create_session(&self, user_id: &str, token_hash: &str, ttl_hours: i64) -> Result<Session> {
        let id = Ulid::new().to_string();
        let now = now_micros();
        let expires_at = now + ttl_hours * 3_600_000_000;

        sqlx::query(
            "INSERT INTO sessions (id, user_id, token_hash, created_at, expires_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?4)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(token_hash)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Internal)?;

        sqlx::query_as::<_, Session>(
            "SELECT id, user_id, token_hash, created_at, expires_at, last_seen_at FROM sessions WHERE id = ?1",
        )
        .bind(&id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    pub async fn get_session_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>> {
        sqlx::query_as::<_, Session>(
            "SELECT id, user_id, token_hash, created_at, expires_at, last_seen_at FROM sessions WHERE token_hash = ?1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    pub async fn touch_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_seen_at = ?1 WHERE id = ?2")
            .bind(now_micros())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Internal)?;
        Ok(())
    }

    pub async fn revoke_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Internal)?;
        Ok(())
    }

    pub async fn purge_expired_sessions(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < ?1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Internal)?;
        Ok(result.rows_affected())
    }

    // ==========================================================================
    // Challenges
    // ==========================================================================

    pub async fn create_challenge(
        &self,
        user_id: Option<&str>,
        kind: &str,
        state_blob: &[u8],
        ttl_secs: i64,
    ) -> Result<Challenge> {
        let id = Ulid::new().to_string();
        let now = now_micros();
        let expires_at = now + ttl_secs * 1_000_000;

        sqlx::query(
            "INSERT INTO challenges (id, user_id, kind, state_blob, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(kind)
        .bind(state_blob)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Internal)?;

        sqlx::query_as::<_, Challenge>(
            "SELECT id, user_id, kind, state_blob, created_at, expires_at FROM challenges WHERE id = ?1",
        )
        .bind(&id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    /// Consumes (deletes) the challenge, returning it if it existed and had
    /// not already expired. Single-use by construction.
    pub async fn take_challenge(&self, challenge_id: &str) -> Result<Option<Challenge>> {
        let challenge = sqlx::query_as::<_, Challenge>(
            "SELECT id, user_id, kind, state_blob, created_at, expires_at FROM challenges WHERE id = ?1",
        )
        .bind(challenge_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Internal)?;

        sqlx::query("DELETE FROM challenges WHERE id = ?1")
            .bind(challenge_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Internal)?;

        Ok(challenge)
    }

    // ==========================================================================
    // Conversations & Memberships
    // ==========================================================================

    pub async fn create_conversation(
        &self,
        creator_id: &str,
        title: &str,
        member_ids: &[String],
    ) -> Result<Conversation> {
        let id = Ulid::new().to_string();
        let now = now_micros();

        let mut tx = self.pool.begin().await.map_err(StoreError::Internal)?;

        sqlx::query("INSERT INTO conversations (id, title, created_by, created_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(&id)
            .bind(title)
            .bind(creator_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Internal)?;

        sqlx::query(
            "INSERT INTO memberships (conversation_id, user_id, role, joined_at) VALUES (?1, ?2, 'admin', ?3)",
        )
        .bind(&id)
        .bind(creator_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Internal)?;

        for member_id in member_ids {
            if member_id == creator_id {
                continue;
            }
            sqlx::query(
                "INSERT INTO memberships (conversation_id, user_id, role, joined_at) VALUES (?1, ?2, 'member', ?3)",
            )
            .bind(&id)
            .bind(member_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Internal)?;
        }

        sqlx::query(
            "INSERT INTO mls_group_state (conversation_id, group_id, epoch, state_blob, updated_at)
             VALUES (?1, ?2, 0, x'', ?3)",
        )
        .bind(&id)
        .bind(&id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Internal)?;

        tx.commit().await.map_err(StoreError::Internal)?;

        Ok(Conversation { id, title: title.to_string(), created_by: creator_id.to_string(), created_at: now })
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        sqlx::query_as::<_, Conversation>(
            "SELECT id, title, created_by, created_at FROM conversations WHERE id = ?1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    pub async fn add_member(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM memberships WHERE conversation_id = ?1 AND user_id = ?2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Internal)?;

        if exists.is_some() {
            return Err(StoreError::Conflict("already a member".to_string()));
        }

        sqlx::query(
            "INSERT INTO memberships (conversation_id, user_id, role, joined_at) VALUES (?1, ?2, 'member', ?3)",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(now_micros())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Internal)?;

        Ok(())
    }

    pub async fn remove_member(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM memberships WHERE conversation_id = ?1 AND user_id = ?2")
            .bind(conversation_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Internal)?;
        Ok(())
    }

    pub async fn is_member(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM memberships WHERE conversation_id = ?1 AND user_id = ?2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Internal)?;
        Ok(count > 0)
    }

    pub async fn list_members(&self, conversation_id: &str) -> Result<Vec<Membership>> {
        sqlx::query_as::<_, Membership>(
            "SELECT conversation_id, user_id, role, joined_at FROM memberships
             WHERE conversation_id = ?1 ORDER BY joined_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    // ==========================================================================
    // Messages & Delivery Receipts
    // ==========================================================================

    /// Appends a message, assigning a strictly-increasing `server_timestamp`
    /// within the conversation, and creates `pending` receipts for every
    /// other current member. Content stays opaque here; the MLS service is
    /// the only thing that ever sees it.
    pub async fn insert_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        payload: &[u8],
        message_type: &str,
        epoch: i64,
    ) -> Result<Message> {
        let id = Ulid::new().to_string();

        let mut tx = self.pool.begin().await.map_err(StoreError::Internal)?;

        let last_ts: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(server_timestamp) FROM messages WHERE conversation_id = ?1",
        )
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::Internal)?;

        let server_timestamp = std::cmp::max(now_micros(), last_ts.unwrap_or(0) + 1);

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, server_timestamp, payload, message_type, epoch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(sender_id)
        .bind(server_timestamp)
        .bind(payload)
        .bind(message_type)
        .bind(epoch)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Internal)?;

        let members: Vec<(String,)> = sqlx::query_as(
            "SELECT user_id FROM memberships WHERE conversation_id = ?1 AND user_id != ?2",
        )
        .bind(conversation_id)
        .bind(sender_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::Internal)?;

        for (recipient_id,) in &members {
            sqlx::query(
                "INSERT INTO delivery_receipts (message_id, recipient_id, status) VALUES (?1, ?2, 'pending')",
            )
            .bind(&id)
            .bind(recipient_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Internal)?;
        }

        tx.commit().await.map_err(StoreError::Internal)?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            server_timestamp,
            payload: payload.to_vec(),
            message_type: message_type.to_string(),
            epoch,
        })
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>(
            "SELECT id, conversation_id, sender_id, server_timestamp, payload, message_type, epoch
             FROM messages WHERE id = ?1",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    /// Every message with a still-`pending` receipt for `recipient_id`, in
    /// ascending delivery order -- the offline queue drained on reconnect.
    pub async fn pending_messages_for(&self, recipient_id: &str) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            "SELECT m.id, m.conversation_id, m.sender_id, m.server_timestamp, m.payload, m.message_type, m.epoch
             FROM messages m
             JOIN delivery_receipts r ON r.message_id = m.id
             WHERE r.recipient_id = ?1 AND r.status = 'pending'
             ORDER BY m.server_timestamp ASC",
        )
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    /// Forward-only status advance; attempting to move backward is rejected.
    pub async fn advance_delivery(
        &self,
        message_id: &str,
        recipient_id: &str,
        new_status: &str,
    ) -> Result<()> {
        let rank = |s: &str| match s {
            "pending" => 0,
            "delivered" => 1,
            "read" => 2,
            _ => -1,
        };
        let new_rank = rank(new_status);
        if new_rank < 0 {
            return Err(StoreError::InvalidInput(format!("unknown status {new_status}")));
        }

        let current: Option<String> = sqlx::query_scalar(
            "SELECT status FROM delivery_receipts WHERE message_id = ?1 AND recipient_id = ?2",
        )
        .bind(message_id)
        .bind(recipient_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Internal)?;

        let current = current.ok_or(StoreError::NotFound)?;
        if rank(&current) > new_rank {
            return Err(StoreError::InvalidInput("delivery status may only advance".to_string()));
        }

        let now = now_micros();
        let (delivered_at, read_at) = match new_status {
            "delivered" => (Some(now), None),
            "read" => (None, Some(now)),
            _ => (None, None),
        };

        sqlx::query(
            "UPDATE delivery_receipts SET status = ?1,
               delivered_at = COALESCE(?2, delivered_at),
               read_at = COALESCE(?3, read_at)
             WHERE message_id = ?4 AND recipient_id = ?5",
        )
        .bind(new_status)
        .bind(delivered_at)
        .bind(read_at)
        .bind(message_id)
        .bind(recipient_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Internal)?;

        Ok(())
    }

    pub async fn get_receipt(&self, message_id: &str, recipient_id: &str) -> Result<Option<DeliveryReceipt>> {
        sqlx::query_as::<_, DeliveryReceipt>(
            "SELECT message_id, recipient_id, status, delivered_at, read_at
             FROM delivery_receipts WHERE message_id = ?1 AND recipient_id = ?2",
        )
        .bind(message_id)
        .bind(recipient_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    // ==========================================================================
    // Key packages
    // ==========================================================================

    pub async fn upload_key_package(&self, user_id: &str, blob: &[u8]) -> Result<KeyPackage> {
        if blob.is_empty() {
            return Err(StoreError::InvalidInput("key package blob must not be empty".to_string()));
        }
        let id = Ulid::new().to_string();
        let now = now_micros();

        sqlx::query(
            "INSERT INTO key_packages (id, user_id, blob, uploaded_at, consumed) VALUES (?1, ?2, ?3, ?4, 0)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(blob)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Internal)?;

        Ok(KeyPackage { id, user_id: user_id.to_string(), blob: blob.to_vec(), uploaded_at: now, consumed: false })
    }

    /// Atomically claims the oldest unconsumed package for `user_id`. SQLite
    /// has no `FOR UPDATE SKIP LOCKED`; the single-writer transaction makes
    /// the select-then-claim atomic instead.
    pub async fn fetch_key_package(&self, user_id: &str) -> Result<KeyPackage> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Internal)?;

        let candidate = sqlx::query_as::<_, KeyPackage>(
            "SELECT id, user_id, blob, uploaded_at, consumed FROM key_packages
             WHERE user_id = ?1 AND consumed = 0 ORDER BY uploaded_at ASC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::Internal)?;

        let candidate = match candidate {
            Some(k) => k,
            None => {
                tx.rollback().await.ok();
                return Err(StoreError::NotFound);
            }
        };

        let result = sqlx::query("UPDATE key_packages SET consumed = 1 WHERE id = ?1 AND consumed = 0")
            .bind(&candidate.id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Internal)?;

        if result.rows_affected() != 1 {
            tx.rollback().await.ok();
            return Err(StoreError::NotFound);
        }

        tx.commit().await.map_err(StoreError::Internal)?;
        Ok(KeyPackage { consumed: true, ..candidate })
    }

    pub async fn count_key_packages(&self, user_id: &str) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM key_packages WHERE user_id = ?1 AND consumed = 0")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Internal)
    }

    /// Drops packages older than 30 days, consumed or not.
    pub async fn purge_expired_key_packages(&self, now: i64) -> Result<u64> {
        let cutoff = now - 30 * 24 * 3_600_000_000;
        let result = sqlx::query("DELETE FROM key_packages WHERE uploaded_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Internal)?;
        Ok(result.rows_affected())
    }

    // ==========================================================================
    // MLS group state
    // ==========================================================================

    pub async fn get_group_state(&self, conversation_id: &str) -> Result<Option<MlsGroupState>> {
        sqlx::query_as::<_, MlsGroupState>(
            "SELECT conversation_id, group_id, epoch, state_blob, updated_at
             FROM mls_group_state WHERE conversation_id = ?1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Internal)
    }

    /// Compare-and-swap epoch advance: `UPDATE ... WHERE epoch = current`
    /// succeeds for exactly one of two racing commits; the loser sees
    /// `Ok(false)` and re-reads the current epoch to report the conflict.
    pub async fn advance_epoch(
        &self,
        conversation_id: &str,
        current_epoch: i64,
        new_state_blob: &[u8],
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE mls_group_state SET epoch = epoch + 1, state_blob = ?1, updated_at = ?2
             WHERE conversation_id = ?3 AND epoch = ?4",
        )
        .bind(new_state_blob)
        .bind(now_micros())
        .bind(conversation_id)
        .bind(current_epoch)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Internal)?;

        Ok(result.rows_affected() == 1)
    }
}
