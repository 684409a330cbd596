use thiserror::Error;

/// Closed error taxonomy surfaced on the wire, one variant per code in the
/// 1xxx-9xxx ranges. `fatal()` decides whether the gateway closes the
/// transport after sending the corresponding `ERROR` envelope.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("session expired")]
    ExpiredSession,
    #[error("challenge failed")]
    ChallengeFailed,
    #[error("session revoked")]
    SessionRevoked,

    #[error("not a group admin")]
    NotGroupAdmin,
    #[error("not a group member")]
    NotGroupMember,
    #[error("account disabled")]
    AccountDisabled,

    #[error("malformed message")]
    MalformedMessage,
    #[error("unknown message type")]
    UnknownMessageType,
    #[error("message too large")]
    MessageTooLarge,
    #[error("rate limited")]
    RateLimited,
    #[error("invalid envelope")]
    InvalidEnvelope,

    #[error("group not found")]
    GroupNotFound,
    #[error("already a member")]
    AlreadyMember,
    #[error("cannot remove self")]
    CannotRemoveSelf,
    #[error("group full")]
    GroupFull,

    #[error("invalid key package")]
    InvalidKeyPackage,
    #[error("epoch mismatch")]
    EpochMismatch,
    #[error("no key package available")]
    NoKeyPackageAvailable,

    #[error("internal error")]
    InternalError,
    #[error("database error")]
    DatabaseError,
    #[error("service unavailable")]
    ServiceUnavailable,
}

impl WireError {
    pub fn code(self) -> u32 {
        use WireError::*;
        match self {
            InvalidCredential => 1001,
            ExpiredSession => 1002,
            ChallengeFailed => 1004,
            SessionRevoked => 1005,
            NotGroupAdmin => 2001,
            NotGroupMember => 2002,
            AccountDisabled => 2004,
            MalformedMessage => 3001,
            UnknownMessageType => 3002,
            MessageTooLarge => 3003,
            RateLimited => 3004,
            InvalidEnvelope => 3005,
            GroupNotFound => 4001,
            AlreadyMember => 4002,
            CannotRemoveSelf => 4004,
            GroupFull => 4005,
            InvalidKeyPackage => 5001,
            EpochMismatch => 5004,
            NoKeyPackageAvailable => 5005,
            InternalError => 9001,
            DatabaseError => 9002,
            ServiceUnavailable => 9003,
        }
    }

    /// Fatal errors terminate the transport (after the `ERROR` envelope is
    /// flushed); everything else leaves the connection open.
    pub fn fatal(self) -> bool {
        use WireError::*;
        matches!(
            self,
            ExpiredSession | SessionRevoked | AccountDisabled | ServiceUnavailable
        )
    }
}

/// Store-layer error taxonomy. Raw `sqlx::Error` never crosses this
/// boundary: it is captured with `#[from]`, logged with full context by the
/// caller, and degraded to `Internal` before reaching a service.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("internal store error")]
    Internal(#[from] sqlx::Error),
}

impl From<StoreError> for WireError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => WireError::GroupNotFound,
            StoreError::Conflict(_) => WireError::AlreadyMember,
            StoreError::InvalidInput(_) => WireError::MalformedMessage,
            StoreError::Internal(_) => WireError::DatabaseError,
        }
    }
}

/// Auth-service error taxonomy (§4.2). Classified to a `WireError` at a
/// single site in the gateway so fatal-vs-recoverable is decided in exactly
/// one place.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user not found")]
    UserNotFound,
    #[error("invalid credential")]
    InvalidCredential,
    #[error("challenge expired")]
    ChallengeExpired,
    #[error("challenge not found")]
    ChallengeNotFound,
    #[error("credential clone detected")]
    CloneDetected,
    #[error("account disabled")]
    AccountDisabled,
    #[error("session expired")]
    SessionExpired,
    #[error("registration failed: {0}")]
    RegistrationFailed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("webauthn error: {0}")]
    WebAuthn(String),
}

impl From<&AuthError> for WireError {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::UserNotFound => WireError::InvalidCredential,
            AuthError::InvalidCredential => WireError::InvalidCredential,
            AuthError::ChallengeExpired => WireError::ChallengeFailed,
            AuthError::ChallengeNotFound => WireError::ChallengeFailed,
            AuthError::CloneDetected => WireError::InvalidCredential,
            AuthError::AccountDisabled => WireError::AccountDisabled,
            AuthError::SessionExpired => WireError::ExpiredSession,
            AuthError::RegistrationFailed(_) => WireError::ChallengeFailed,
            AuthError::Store(_) => WireError::DatabaseError,
            AuthError::WebAuthn(_) => WireError::InvalidCredential,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_ranges() {
        assert_eq!(WireError::InvalidCredential.code(), 1001);
        assert_eq!(WireError::EpochMismatch.code(), 5004);
        assert_eq!(WireError::InternalError.code(), 9001);
    }

    #[test]
    fn fatal_errors_are_a_small_closed_set() {
        assert!(WireError::SessionRevoked.fatal());
        assert!(!WireError::RateLimited.fatal());
        assert!(!WireError::MessageTooLarge.fatal());
    }

    #[test]
    fn store_not_found_maps_to_group_not_found() {
        let wire: WireError = StoreError::NotFound.into();
        assert_eq!(wire, WireError::GroupNotFound);
    }
}
