use url::Url;
use webauthn_rs::prelude::*;

use crate::crypto::{generate_session_token, hash_token};
use crate::db::Store;
use crate::error::AuthError;
use crate::models::{Session, User};

pub struct RegistrationChallenge {
    pub challenge_id: String,
    pub options: CreationChallengeResponse,
}

pub struct LoginChallenge {
    pub challenge_id: String,
    pub options: RequestChallengeResponse,
}

pub struct IssuedSession {
    pub token: String,
    pub user: User,
    pub session: Session,
}

const CHALLENGE_TTL_SECS: i64 = 60;

/// Drives WebAuthn registration and login ceremonies: one `Webauthn`
/// instance per relying party, built once at startup. In-flight ceremony
/// state is serialized into the Store's `challenges` table so a ceremony
/// survives the server restarting mid-flow, and the single-use/TTL
/// invariant is enforced by the same `take_challenge` primitive used
/// everywhere else.
pub struct AuthService {
    webauthn: Webauthn,
    store: Store,
    session_ttl_hours: i64,
}

impl AuthService {
    pub fn new(rp_id: &str, rp_origin: &str, store: Store, session_ttl_hours: i64) -> anyhow::Result<Self> {
        let origin = Url::parse(rp_origin)?;
        let webauthn = WebauthnBuilder::new(rp_id, &origin)?
            .rp_name("sovereign")
            .build()?;
        Ok(Self { webauthn, store, session_ttl_hours })
    }

    pub async fn begin_registration(
        &self,
        username: &str,
        display_name: &str,
    ) -> Result<RegistrationChallenge, AuthError> {
        if self
            .store
            .get_user_by_username(username)
            .await?
            .is_some()
        {
            return Err(AuthError::RegistrationFailed(format!("username {username} taken")));
        }

        let user_id = Uuid::new_v4();
        let (ccr, reg_state) = self
            .webauthn
            .start_passkey_registration(user_id, username, display_name, None)
            .map_err(|e| AuthError::WebAuthn(e.to_string()))?;

        let state_blob = serde_json::to_vec(&(username, display_name, reg_state))
            .map_err(|e| AuthError::WebAuthn(e.to_string()))?;
        let challenge = self
            .store
            .create_challenge(None, "register", &state_blob, CHALLENGE_TTL_SECS)
            .await?;

        Ok(RegistrationChallenge { challenge_id: challenge.id, options: ccr })
    }

    pub async fn finish_registration(
        &self,
        challenge_id: &str,
        response: &RegisterPublicKeyCredential,
    ) -> Result<IssuedSession, AuthError> {
        let challenge = self
            .store
            .take_challenge(challenge_id)
            .await?
            .ok_or(AuthError::ChallengeNotFound)?;
        if challenge.expires_at < crate::models::now_micros() {
            return Err(AuthError::ChallengeExpired);
        }

        let (username, display_name, reg_state): (String, String, PasskeyRegistration) =
            serde_json::from_slice(&challenge.state_blob)
                .map_err(|e| AuthError::WebAuthn(e.to_string()))?;

        let passkey = self
            .webauthn
            .finish_passkey_registration(response, &reg_state)
            .map_err(|e| AuthError::WebAuthn(e.to_string()))?;

        let user = self.store.create_user(&username, &display_name).await?;
        self.store
            .create_credential(
                &user.id,
                passkey.cred_id().as_slice(),
                &serde_json::to_vec(&passkey).map_err(|e| AuthError::WebAuthn(e.to_string()))?,
                0,
            )
            .await?;

        self.issue_session(user).await
    }

    pub async fn begin_login(&self, username: &str) -> Result<LoginChallenge, AuthError> {
        let user = self
            .store
            .get_user_by_username(username)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        if !user.enabled {
            return Err(AuthError::AccountDisabled);
        }

        let creds = self.store.list_credentials_for_user(&user.id).await?;
        if creds.is_empty() {
            return Err(AuthError::InvalidCredential);
        }
        let passkeys: Vec<Passkey> = creds
            .iter()
            .filter_map(|c| serde_json::from_slice(&c.public_key).ok())
            .collect();

        let (rcr, auth_state) = self
            .webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|e| AuthError::WebAuthn(e.to_string()))?;

        let state_blob = serde_json::to_vec(&(user.id.clone(), auth_state))
            .map_err(|e| AuthError::WebAuthn(e.to_string()))?;
        let challenge = self
            .store
            .create_challenge(Some(&user.id), "login", &state_blob, CHALLENGE_TTL_SECS)
            .await?;

        Ok(LoginChallenge { challenge_id: challenge.id, options: rcr })
    }

    pub async fn finish_login(
        &self,
        challenge_id: &str,
        response: &PublicKeyCredential,
    ) -> Result<IssuedSession, AuthError> {
        let challenge = self
            .store
            .take_challenge(challenge_id)
            .await?
            .ok_or(AuthError::ChallengeNotFound)?;
        if challenge.expires_at < crate::models::now_micros() {
            return Err(AuthError::ChallengeExpired);
        }

        let (user_id, auth_state): (String, PasskeyAuthentication) =
            serde_json::from_slice(&challenge.state_blob)
                .map_err(|e| AuthError::WebAuthn(e.to_string()))?;

        let result = self
            .webauthn
            .finish_passkey_authentication(response, &auth_state)
            .map_err(|_| AuthError::InvalidCredential)?;

        let credential_id = result.cred_id().as_slice();
        let advanced = self
            .store
            .advance_sign_count(credential_id, result.counter() as i64)
            .await?;
        if !advanced {
            return Err(AuthError::CloneDetected);
        }

        let user = self.store.get_user(&user_id).await?.ok_or(AuthError::UserNotFound)?;
        if !user.enabled {
            return Err(AuthError::AccountDisabled);
        }

        self.issue_session(user).await
    }

    async fn issue_session(&self, user: User) -> Result<IssuedSession, AuthError> {
        let token = generate_session_token();
        let session = self
            .store
            .create_session(&user.id, &hash_token(&token), self.session_ttl_hours)
            .await?;
        Ok(IssuedSession { token, user, session })
    }

    pub async fn validate_session(&self, token: &str) -> Result<(User, Session), AuthError> {
        let session = self
            .store
            .get_session_by_token_hash(&hash_token(token))
            .await?
            .ok_or(AuthError::SessionExpired)?;
        if session.expires_at < crate::models::now_micros() {
            return Err(AuthError::SessionExpired);
        }
        let user = self
            .store
            .get_user(&session.user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        if !user.enabled {
            return Err(AuthError::AccountDisabled);
        }
        self.store.touch_session(&session.id).await?;
        Ok((user, session))
    }

    pub async fn revoke_session(&self, session_id: &str) -> Result<(), AuthError> {
        self.store.revoke_session(session_id).await?;
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
    async fn begin_registration_rejects_taken_username() {
        let store = test_store().await;
        store.create_user("alice", "Alice").await.unwrap();
        let auth = AuthService::new("localhost", "https://localhost", store, 720).unwrap();
        let err = auth.begin_registration("alice", "Alice Again").await.unwrap_err();
        assert!(matches!(err, AuthError::RegistrationFailed(_)));
    }

    #[tokio::test]
    async fn begin_login_rejects_disabled_account_path_is_user_not_found_when_absent() {
        let store = test_store().await;
        let auth = AuthService::new("localhost", "https://localhost", store, 720).unwrap();
        let err = auth.begin_login("ghost").await.unwrap_err();
        assert!(matches!(err, AuthError::UserNotFound));
    }
}
