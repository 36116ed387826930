// User sessions on the control plane: verify-token consumption marks the
// user verified, logins mint HS256 session JWTs.

use std::sync::Arc;

use chrono::Duration;

use crate::auth::{self, SessionClaims};
use crate::error::{PlatformError, Result};
use crate::registry::MetadataStore;

const SESSION_TTL_HOURS: i64 = 24;

pub struct SessionManager {
    store: Arc<MetadataStore>,
    jwt_secret: String,
}

impl SessionManager {
    pub fn new(store: Arc<MetadataStore>, jwt_secret: impl Into<String>) -> Self {
        Self {
            store,
            jwt_secret: jwt_secret.into(),
        }
    }

    /// Consume a verification token (atomically) and mark its user
    /// verified.
    pub async fn verify_email(&self, token: &str) -> Result<()> {
        let record = self.store.use_verification_token(token).await?;
        let mut user = self.store.get_user(&record.user_id)?;
        if !user.verified {
            user.verified = true;
            self.store.update_user(user).await?;
        }
        Ok(())
    }

    /// Mint a session for a verified user.
    pub async fn create_session(&self, user_id: &str) -> Result<String> {
        if self.jwt_secret.is_empty() {
            return Err(PlatformError::Configuration("jwt secret not set".into()));
        }
        let user = self.store.get_user(&user_id.to_string())?;
        if !user.verified {
            return Err(PlatformError::Auth(format!(
                "user {} is not verified",
                user_id
            )));
        }
        auth::issue_session(
            &user.id,
            &user.email,
            &self.jwt_secret,
            Duration::hours(SESSION_TTL_HOURS),
        )
    }

    pub fn verify_session(&self, token: &str) -> Result<SessionClaims> {
        auth::verify_session(token, &self.jwt_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::DirectCommandLog;
    use crate::registry::fsm::RegistryFsm;
    use crate::registry::kv::KvEngine;
    use crate::registry::types::{ClusterUser, VerificationToken};

    fn manager() -> (SessionManager, Arc<MetadataStore>) {
        let kv = Arc::new(KvEngine::new("/tmp/hivedb-session-test"));
        let fsm = Arc::new(RegistryFsm::new(kv.clone(), "cp-1"));
        let log = Arc::new(DirectCommandLog::new(fsm, "127.0.0.1:8090"));
        let store = Arc::new(MetadataStore::new(kv, log, "cp-1"));
        (SessionManager::new(store.clone(), "secret"), store)
    }

    #[tokio::test]
    async fn test_verify_email_then_login() {
        let (sessions, store) = manager();
        store
            .create_user(ClusterUser::new("u_1", "a@b.c", "hash"))
            .await
            .unwrap();
        store
            .save_token(VerificationToken::new(
                "tok",
                "u_1",
                "a@b.c",
                Duration::hours(24),
            ))
            .await
            .unwrap();

        // Unverified users cannot log in.
        assert!(sessions.create_session("u_1").await.is_err());

        sessions.verify_email("tok").await.unwrap();
        assert!(store.get_user(&"u_1".to_string()).unwrap().verified);

        let token = sessions.create_session("u_1").await.unwrap();
        let claims = sessions.verify_session(&token).unwrap();
        assert_eq!(claims.sub, "u_1");

        // The token is spent.
        assert!(sessions.verify_email("tok").await.is_err());
    }
}
