use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Role a user holds server-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Member,
    Admin,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Member => "member",
            UserRole::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "admin" => UserRole::Admin,
            _ => UserRole::Member,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: String,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Credential {
    pub id: String,
    pub user_id: String,
    pub credential_id: Vec<u8>,
    pub public_key: Vec<u8>,
    pub sign_count: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub token_hash: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Register,
    Login,
}

impl ChallengeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeKind::Register => "register",
            ChallengeKind::Login => "login",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Challenge {
    pub id: String,
    pub user_id: Option<String>,
    pub kind: String,
    pub state_blob: Vec<u8>,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_by: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Membership {
    pub conversation_id: String,
    pub user_id: String,
    pub role: String,
    pub joined_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Application,
    Commit,
    Welcome,
    Proposal,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Application => "application",
            MessageType::Commit => "commit",
            MessageType::Welcome => "welcome",
            MessageType::Proposal => "proposal",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "commit" => MessageType::Commit,
            "welcome" => MessageType::Welcome,
            "proposal" => MessageType::Proposal,
            _ => MessageType::Application,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub server_timestamp: i64,
    pub payload: Vec<u8>,
    pub message_type: String,
    pub epoch: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "delivered" => DeliveryStatus::Delivered,
            "read" => DeliveryStatus::Read,
            _ => DeliveryStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub recipient_id: String,
    pub status: String,
    pub delivered_at: Option<i64>,
    pub read_at: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct KeyPackage {
    pub id: String,
    pub user_id: String,
    pub blob: Vec<u8>,
    pub uploaded_at: i64,
    pub consumed: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct MlsGroupState {
    pub conversation_id: String,
    pub group_id: String,
    pub epoch: i64,
    pub state_blob: Vec<u8>,
    pub updated_at: i64,
}

/// Current wall-clock time in microseconds, the unit every timestamp in the
/// data model uses.
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
