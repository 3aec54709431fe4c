//! The single storage boundary for session state.
//!
//! Tokens and the cached user live only in the shell's key-value store; every
//! read goes back to storage so a rotation by one flow is seen by all others.
//!
//! Writes are serialized and tagged with a session generation. Signing in
//! and signing out start a new generation; a refresh or rotation that began
//! under an older one is discarded instead of resurrecting the session.

use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::capabilities::{KeyNamespace, KeyValueStore, KvError, KvKey, TypedKvStore};
use crate::model::{SessionTokens, UnixTimeMs, User};

const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const EXPIRES_AT_KEY: &str = "expires_at";
const USER_KEY: &str = "user";

#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
    generation: Arc<AtomicU64>,
    writes: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            generation: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// Current session generation. Capture it before a network call and
    /// hand it back to the guarded writes afterwards.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn key(name: &str) -> Result<KvKey, KvError> {
        KvKey::new(KeyNamespace::Session, name)
    }

    async fn read_secret(&self, name: &str) -> Result<Option<SecretString>, KvError> {
        let key = Self::key(name)?;
        match self.kv.get(&key).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(|s| Some(SecretString::new(s)))
                .map_err(|e| KvError::Serialization {
                    key: key.raw(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn write_secret(&self, name: &str, secret: &SecretString) -> Result<(), KvError> {
        self.kv
            .set(&Self::key(name)?, secret.expose_secret().as_bytes().to_vec())
            .await
    }

    pub async fn access_token(&self) -> Result<Option<SecretString>, KvError> {
        self.read_secret(ACCESS_TOKEN_KEY).await
    }

    pub async fn refresh_token(&self) -> Result<Option<SecretString>, KvError> {
        self.read_secret(REFRESH_TOKEN_KEY).await
    }

    pub async fn expires_at(&self) -> Result<Option<UnixTimeMs>, KvError> {
        TypedKvStore::<UnixTimeMs>::new(KeyNamespace::Session)
            .load(&*self.kv, EXPIRES_AT_KEY)
            .await
    }

    /// The stored token set, or `None` when no access token is stored.
    pub async fn tokens(&self) -> Result<Option<SessionTokens>, KvError> {
        let Some(access_token) = self.access_token().await? else {
            return Ok(None);
        };
        Ok(Some(SessionTokens {
            access_token,
            refresh_token: self.refresh_token().await?,
            expires_at: self.expires_at().await?,
        }))
    }

    pub async fn is_authenticated(&self) -> Result<bool, KvError> {
        Ok(self.access_token().await?.is_some())
    }

    /// Starts a new session with a full token set and, when known, its user.
    /// A missing refresh token keeps the stored one.
    #[instrument(skip_all)]
    pub async fn start_session(
        &self,
        tokens: &SessionTokens,
        user: Option<&User>,
    ) -> Result<(), KvError> {
        let _writes = self.writes.lock().await;
        let generation = self.bump();
        self.write_tokens(tokens).await?;
        if let Some(user) = user {
            self.write_user(user).await?;
        }
        debug!(generation, "session started");
        Ok(())
    }

    /// Starts a new session without touching the cached user.
    pub async fn store_tokens(&self, tokens: &SessionTokens) -> Result<(), KvError> {
        self.start_session(tokens, None).await
    }

    /// Persists refreshed tokens if no sign-in or sign-out happened since
    /// `generation` was read. Returns `false` when the write was discarded.
    #[instrument(skip(self, tokens, user))]
    pub async fn update_tokens(
        &self,
        tokens: &SessionTokens,
        user: Option<&User>,
        generation: u64,
    ) -> Result<bool, KvError> {
        let _writes = self.writes.lock().await;
        if !self.is_current(generation) {
            debug!(current = self.generation(), "discarding stale token update");
            return Ok(false);
        }
        self.write_tokens(tokens).await?;
        if let Some(user) = user {
            self.write_user(user).await?;
        }
        Ok(true)
    }

    /// Replaces only the access token after a server-side rotation, under
    /// the same generation rule as [`SessionStore::update_tokens`].
    pub async fn store_access_token(
        &self,
        token: &SecretString,
        generation: u64,
    ) -> Result<bool, KvError> {
        let _writes = self.writes.lock().await;
        if !self.is_current(generation) {
            return Ok(false);
        }
        self.write_secret(ACCESS_TOKEN_KEY, token).await?;
        Ok(true)
    }

    async fn write_tokens(&self, tokens: &SessionTokens) -> Result<(), KvError> {
        self.write_secret(ACCESS_TOKEN_KEY, &tokens.access_token)
            .await?;
        if let Some(refresh) = &tokens.refresh_token {
            self.write_secret(REFRESH_TOKEN_KEY, refresh).await?;
        }
        let expires = TypedKvStore::<UnixTimeMs>::new(KeyNamespace::Session);
        match tokens.expires_at {
            Some(at) => expires.save(&*self.kv, EXPIRES_AT_KEY, &at).await?,
            None => {
                expires.remove(&*self.kv, EXPIRES_AT_KEY).await?;
            }
        }
        debug!(
            refresh_rotated = tokens.refresh_token.is_some(),
            "session tokens stored"
        );
        Ok(())
    }

    pub async fn user(&self) -> Result<Option<User>, KvError> {
        TypedKvStore::<User>::new(KeyNamespace::Session)
            .load(&*self.kv, USER_KEY)
            .await
    }

    pub async fn store_user(&self, user: &User) -> Result<(), KvError> {
        let _writes = self.writes.lock().await;
        self.write_user(user).await
    }

    /// Caches a freshly fetched profile unless the session changed meanwhile.
    pub async fn update_user(&self, user: &User, generation: u64) -> Result<bool, KvError> {
        let _writes = self.writes.lock().await;
        if !self.is_current(generation) {
            return Ok(false);
        }
        self.write_user(user).await?;
        Ok(true)
    }

    async fn write_user(&self, user: &User) -> Result<(), KvError> {
        TypedKvStore::<User>::new(KeyNamespace::Session)
            .save(&*self.kv, USER_KEY, user)
            .await
    }

    /// Ends the session: starts a new generation, then removes every session
    /// key. Keeps going past individual failures and reports the first one.
    #[instrument(skip_all)]
    pub async fn clear(&self) -> Result<(), KvError> {
        let _writes = self.writes.lock().await;
        self.bump();
        self.remove_all().await
    }

    /// Clears only if the session is still the one `generation` was read from.
    pub async fn clear_if_current(&self, generation: u64) -> Result<bool, KvError> {
        let _writes = self.writes.lock().await;
        if !self.is_current(generation) {
            return Ok(false);
        }
        self.bump();
        self.remove_all().await?;
        Ok(true)
    }

    async fn remove_all(&self) -> Result<(), KvError> {
        let mut first_error = None;
        for name in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, EXPIRES_AT_KEY, USER_KEY] {
            let result = match Self::key(name) {
                Ok(key) => self.kv.delete(&key).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(key = name, error = %e, "failed to clear session key");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("session cleared");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::MemoryKvStore;
    use crate::model::UserId;

    fn store() -> (Arc<MemoryKvStore>, SessionStore) {
        let kv = Arc::new(MemoryKvStore::new());
        (kv.clone(), SessionStore::new(kv))
    }

    fn tokens(access: &str, refresh: Option<&str>) -> SessionTokens {
        SessionTokens {
            access_token: SecretString::new(access.into()),
            refresh_token: refresh.map(|r| SecretString::new(r.into())),
            expires_at: Some(UnixTimeMs(5_000)),
        }
    }

    #[tokio::test]
    async fn tokens_roundtrip_under_fixed_keys() {
        let (kv, session) = store();
        session.store_tokens(&tokens("a1", Some("r1"))).await.unwrap();

        assert!(
            kv.contains(&KvKey::new(KeyNamespace::Session, "access_token").unwrap())
                .await
        );
        let loaded = session.tokens().await.unwrap().unwrap();
        assert_eq!(loaded.access_token.expose_secret(), "a1");
        assert_eq!(
            loaded.refresh_token.as_ref().map(|r| r.expose_secret().as_str()),
            Some("r1")
        );
        assert_eq!(loaded.expires_at, Some(UnixTimeMs(5_000)));
    }

    #[tokio::test]
    async fn missing_refresh_token_keeps_stored_one() {
        let (_, session) = store();
        session.store_tokens(&tokens("a1", Some("r1"))).await.unwrap();
        session.store_tokens(&tokens("a2", None)).await.unwrap();

        assert_eq!(
            session.access_token().await.unwrap().unwrap().expose_secret(),
            "a2"
        );
        assert_eq!(
            session.refresh_token().await.unwrap().unwrap().expose_secret(),
            "r1"
        );
    }

    #[tokio::test]
    async fn clear_removes_tokens_and_user() {
        let (kv, session) = store();
        session.store_tokens(&tokens("a1", Some("r1"))).await.unwrap();
        session
            .store_user(&User {
                id: UserId::new("u1"),
                email: None,
                name: Some("Ada".into()),
                avatar_url: None,
                extra: serde_json::Map::new(),
            })
            .await
            .unwrap();
        assert!(session.user().await.unwrap().is_some());

        session.clear().await.unwrap();

        assert!(kv.is_empty().await);
        assert!(session.tokens().await.unwrap().is_none());
        assert!(session.user().await.unwrap().is_none());
        assert!(!session.is_authenticated().await.unwrap());
    }

    #[tokio::test]
    async fn stale_generation_writes_are_discarded() {
        let (_, session) = store();
        session.store_tokens(&tokens("a1", Some("r1"))).await.unwrap();
        let before_logout = session.generation();

        session.clear().await.unwrap();

        assert!(!session
            .update_tokens(&tokens("a2", Some("r2")), None, before_logout)
            .await
            .unwrap());
        assert!(!session
            .store_access_token(&SecretString::new("a3".into()), before_logout)
            .await
            .unwrap());
        assert!(!session.clear_if_current(before_logout).await.unwrap());
        assert!(session.tokens().await.unwrap().is_none());
        assert!(session.refresh_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn current_generation_updates_keep_the_session() {
        let (_, session) = store();
        session.store_tokens(&tokens("a1", Some("r1"))).await.unwrap();
        let generation = session.generation();

        assert!(session
            .update_tokens(&tokens("a2", None), None, generation)
            .await
            .unwrap());

        assert_eq!(session.generation(), generation);
        assert_eq!(
            session.access_token().await.unwrap().unwrap().expose_secret(),
            "a2"
        );
        assert_eq!(
            session.refresh_token().await.unwrap().unwrap().expose_secret(),
            "r1"
        );
    }
}
