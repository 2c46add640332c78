//! Persisted credentials.
//!
//! Tokens live in the `session` namespace of the shell's key-value store so a
//! reload (or a new tab) keeps the user signed in.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::capabilities::{KeyNamespace, KeyValueStore, KvError, KvKey, KvResult};

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// An opaque bearer credential. Redacted in `Debug`, wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Returns `None` for an empty or whitespace-only value; an empty stored
    /// token is treated as no token.
    pub fn parse(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token([REDACTED])")
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: Option<Token>,
    pub refresh_token: Option<Token>,
}

impl Credentials {
    /// Both tokens are required; an access token alone cannot be renewed.
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some() && self.refresh_token.is_some()
    }
}

#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    access_key: KvKey,
    refresh_key: KvKey,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Result<Self, KvError> {
        Ok(Self {
            store,
            access_key: KvKey::new(KeyNamespace::Session, ACCESS_TOKEN_KEY)?,
            refresh_key: KvKey::new(KeyNamespace::Session, REFRESH_TOKEN_KEY)?,
        })
    }

    pub async fn load(&self) -> KvResult<Credentials> {
        Ok(Credentials {
            access_token: self.access_token().await?,
            refresh_token: self.refresh_token().await?,
        })
    }

    pub async fn access_token(&self) -> KvResult<Option<Token>> {
        self.read(&self.access_key).await
    }

    pub async fn refresh_token(&self) -> KvResult<Option<Token>> {
        self.read(&self.refresh_key).await
    }

    /// Stores a new access token. The refresh token is only replaced when a
    /// new one is supplied.
    pub async fn save(&self, access: &Token, refresh: Option<&Token>) -> KvResult<()> {
        self.store
            .set(&self.access_key, access.expose().as_bytes().to_vec())
            .await?;
        if let Some(refresh) = refresh {
            self.store
                .set(&self.refresh_key, refresh.expose().as_bytes().to_vec())
                .await?;
        }
        debug!(refresh_rotated = refresh.is_some(), "session tokens stored");
        Ok(())
    }

    /// Stores a fresh sign-in. Unlike [`SessionStore::save`], a missing
    /// refresh token removes the stored one so no token outlives its session.
    pub async fn replace(&self, access: &Token, refresh: Option<&Token>) -> KvResult<()> {
        if refresh.is_none() {
            self.store.delete(&self.refresh_key).await?;
        }
        self.save(access, refresh).await
    }

    pub async fn clear_tokens(&self) -> KvResult<()> {
        self.store.delete(&self.access_key).await?;
        self.store.delete(&self.refresh_key).await?;
        debug!("session tokens cleared");
        Ok(())
    }

    /// Drops everything in the session namespace, not only the tokens.
    pub async fn clear_all(&self) -> KvResult<usize> {
        let removed = self.store.clear_namespace(&KeyNamespace::Session).await?;
        info!(removed, "session storage cleared");
        Ok(removed)
    }

    async fn read(&self, key: &KvKey) -> KvResult<Option<Token>> {
        Ok(self.store.get_string(key).await?.and_then(Token::parse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryKvStore;

    fn store() -> (Arc<MemoryKvStore>, SessionStore) {
        let kv = Arc::new(MemoryKvStore::new());
        let session = SessionStore::new(kv.clone()).unwrap();
        (kv, session)
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = Token::parse("secret-value").unwrap();
        assert!(!format!("{token:?}").contains("secret-value"));
        assert_eq!(token.bearer_header(), "Bearer secret-value");
    }

    #[test]
    fn blank_token_is_absent() {
        assert!(Token::parse("").is_none());
        assert!(Token::parse("   ").is_none());
    }

    #[tokio::test]
    async fn save_keeps_refresh_token_when_not_rotated() {
        let (_, session) = store();
        let at1 = Token::parse("at-1").unwrap();
        let rt1 = Token::parse("rt-1").unwrap();
        session.save(&at1, Some(&rt1)).await.unwrap();

        let at2 = Token::parse("at-2").unwrap();
        session.save(&at2, None).await.unwrap();

        let creds = session.load().await.unwrap();
        assert_eq!(creds.access_token, Some(at2));
        assert_eq!(creds.refresh_token, Some(rt1));
        assert!(creds.is_authenticated());
    }

    #[tokio::test]
    async fn replace_drops_refresh_token_from_previous_session() {
        let (_, session) = store();
        session
            .save(&Token::parse("old-at").unwrap(), Token::parse("old-rt").as_ref())
            .await
            .unwrap();

        session
            .replace(&Token::parse("new-at").unwrap(), None)
            .await
            .unwrap();

        let creds = session.load().await.unwrap();
        assert_eq!(creds.access_token, Token::parse("new-at"));
        assert_eq!(creds.refresh_token, None);
        assert!(!creds.is_authenticated());
    }

    #[tokio::test]
    async fn clear_tokens_leaves_other_session_data() {
        let (kv, session) = store();
        let other = KvKey::new(KeyNamespace::Session, "lastScreen").unwrap();
        kv.set(&other, b"location".to_vec()).await.unwrap();
        session
            .save(&Token::parse("at").unwrap(), Token::parse("rt").as_ref())
            .await
            .unwrap();

        session.clear_tokens().await.unwrap();

        assert_eq!(session.load().await.unwrap(), Credentials::default());
        assert!(kv.get(&other).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_all_empties_session_namespace_only() {
        let (kv, session) = store();
        let other = KvKey::new(KeyNamespace::Session, "lastScreen").unwrap();
        let setting = KvKey::new(KeyNamespace::Settings, "theme").unwrap();
        kv.set(&other, b"x".to_vec()).await.unwrap();
        kv.set(&setting, b"dark".to_vec()).await.unwrap();
        session
            .save(&Token::parse("at").unwrap(), Token::parse("rt").as_ref())
            .await
            .unwrap();

        let removed = session.clear_all().await.unwrap();

        assert_eq!(removed, 3);
        assert!(kv.get(&other).await.unwrap().is_none());
        assert!(kv.get(&setting).await.unwrap().is_some());
    }
}
