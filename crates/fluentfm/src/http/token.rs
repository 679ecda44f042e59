//! Token pool management for Data API sessions
//!
//! Bearer tokens are short-lived server-side credentials. Instead of minting
//! one per caller, a small bounded pool is kept in a shared store and sampled
//! uniformly at random, so concurrent clients spread load over a handful of
//! sessions. Invalid tokens are discovered reactively (the server answers
//! 401 or code 952) and repaired by removal plus conditional re-minting; no
//! locking is used, and racing writers are tolerated because a lost update
//! only means another trip through the same repair path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Client;
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::http::url as endpoint;

/// Store key under which the pool lives
pub const TOKEN_POOL_KEY: &str = "fm_token";

/// Response header carrying a freshly minted token
const TOKEN_HEADER: &str = "X-FM-Data-Access-Token";

/// Process-wide cache capability holding the shared token pool.
///
/// Implementations may be in-memory, file-backed or distributed; the pool
/// manager only ever reads and writes the ordered token list under
/// [`TOKEN_POOL_KEY`].
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<String>>;
    fn put(&self, key: &str, tokens: Vec<String>, ttl: Option<Duration>);
    fn forget(&self, key: &str);
}

/// Mutex-guarded in-process token store.
///
/// TTLs are ignored: entries live for the life of the process, matching the
/// reactive-repair model (stale tokens are evicted on first failed use).
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    inner: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Option<Vec<String>> {
        self.inner.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, tokens: Vec<String>, _ttl: Option<Duration>) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(key.to_string(), tokens);
        }
    }

    fn forget(&self, key: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(key);
        }
    }
}

/// Backoff policy for token acquisition
#[derive(Debug, Clone)]
pub struct TokenRetryPolicy {
    /// Maximum number of retries after the initial attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_wait: Duration,
    /// Multiplier applied per attempt
    pub exponent: u32,
}

impl Default for TokenRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_wait: Duration::from_millis(100),
            exponent: 2,
        }
    }
}

impl TokenRetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = wait;
        self
    }

    pub fn with_exponent(mut self, exponent: u32) -> Self {
        self.exponent = exponent;
        self
    }

    /// Delay before retry number `attempt` (0-based):
    /// `initial_wait * exponent^attempt`. Pure, so tests can assert the
    /// schedule without sleeping.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_wait * self.exponent.saturating_pow(attempt)
    }
}

/// Owns creation, random selection, eviction and replacement of session
/// tokens against the shared store.
#[derive(Clone)]
pub struct TokenManager {
    client: Client,
    base: Url,
    config: Config,
    store: Arc<dyn TokenStore>,
}

impl TokenManager {
    pub fn new(config: Config, client: Client, base: Url, store: Arc<dyn TokenStore>) -> Self {
        Self {
            client,
            base,
            config,
            store,
        }
    }

    /// Current pool contents (empty when nothing is cached)
    pub fn pool(&self) -> Vec<String> {
        self.store.get(TOKEN_POOL_KEY).unwrap_or_default()
    }

    fn persist(&self, tokens: Vec<String>) {
        self.store.put(TOKEN_POOL_KEY, tokens, None);
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base.join(path).map_err(|e| Error::Http {
            message: format!("invalid endpoint path {}: {}", path, e),
            status: None,
            source: Some(anyhow::anyhow!(e)),
        })
    }

    /// Mint a new session token with Basic auth and append it to the pool,
    /// evicting the oldest entry when the pool is over capacity.
    pub async fn create_token(&self) -> Result<String> {
        let response = self
            .client
            .post(self.join(&endpoint::sessions())?)
            .basic_auth(&self.config.user, Some(&self.config.pass))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body("{}")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized);
        }

        let token = response
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or(Error::TokenCreation)?;

        let mut tokens = self.pool();
        tokens.push(token.clone());
        while tokens.len() > self.config.token_limit {
            tokens.remove(0);
        }
        self.persist(tokens);

        Ok(token)
    }

    /// Fetch a usable token.
    ///
    /// With `force == false` an existing pool entry is picked uniformly at
    /// random, minting only when the pool is empty; the sampling is what
    /// keeps concurrent clients from all opening fresh sessions. With
    /// `force == true` the pool is bypassed and a fresh token is minted.
    pub async fn get_token(&self, force: bool) -> Result<String> {
        if force {
            return self.create_token().await;
        }

        let tokens = self.pool();
        if tokens.is_empty() {
            return self.create_token().await;
        }

        let index = rand::Rng::gen_range(&mut rand::thread_rng(), 0..tokens.len());
        Ok(tokens[index].clone())
    }

    /// Drop a token reported invalid by the server and hand back a
    /// replacement: freshly minted when the pool has drained low, otherwise
    /// re-sampled from the survivors.
    pub async fn replace_token(&self, token: &str) -> Result<String> {
        let mut tokens = self.pool();
        if let Some(pos) = tokens.iter().position(|t| t == token) {
            tokens.remove(pos);
        }
        let remaining = tokens.len();
        self.persist(tokens);

        let floor = self.config.token_limit.saturating_sub(2).max(1);
        if remaining < floor {
            self.create_token().await
        } else {
            self.get_token(false).await
        }
    }

    /// `get_token` wrapped in bounded exponential backoff.
    ///
    /// Only token-kind and Data-API-kind errors are retried; anything else
    /// propagates immediately without a delay.
    pub async fn get_token_with_retries(&self, policy: &TokenRetryPolicy) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.get_token(false).await {
                Ok(token) => return Ok(token),
                Err(e) if e.is_token_retryable() => {
                    if attempt >= policy.max_retries {
                        log::error!(
                            "token acquisition failed after {} retries: {}",
                            policy.max_retries,
                            e
                        );
                        return Err(Error::TokenRetryExhausted {
                            retries: policy.max_retries,
                        });
                    }
                    let delay = policy.delay_for(attempt);
                    log::warn!(
                        "token acquisition failed (attempt {}), retrying after {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close one session server-side and drop it from the pool. Best-effort:
    /// failures are logged, never surfaced.
    pub async fn logout(&self, token: &str) {
        let path = match self.join(&endpoint::session(token)) {
            Ok(url) => url,
            Err(e) => {
                log::debug!("logout skipped: {}", e);
                return;
            }
        };

        if let Err(e) = self.client.delete(path).send().await {
            log::debug!("logout request failed: {}", e);
        }

        let mut tokens = self.pool();
        tokens.retain(|t| t != token);
        self.persist(tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager_for(server_uri: &str, limit: usize, store: Arc<dyn TokenStore>) -> TokenManager {
        let config = Config::new(server_uri, "db", "u", "p").with_token_limit(limit);
        let base = Url::parse(&config.base_url()).unwrap();
        TokenManager::new(config, Client::new(), base, store)
    }

    fn mount_sessions(template: ResponseTemplate) -> Mock {
        Mock::given(method("POST"))
            .and(path_regex(r"^/fmi/data/v1/databases/db/sessions$"))
            .respond_with(template)
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryTokenStore::new();
        assert_eq!(store.get(TOKEN_POOL_KEY), None);

        store.put(TOKEN_POOL_KEY, vec!["a".to_string()], None);
        assert_eq!(store.get(TOKEN_POOL_KEY), Some(vec!["a".to_string()]));

        store.forget(TOKEN_POOL_KEY);
        assert_eq!(store.get(TOKEN_POOL_KEY), None);
    }

    #[test]
    fn test_retry_policy_schedule() {
        let policy = TokenRetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));

        let slow = TokenRetryPolicy::new(3)
            .with_initial_wait(Duration::from_millis(10))
            .with_exponent(3);
        assert_eq!(slow.delay_for(2), Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_limit() {
        let server = MockServer::start().await;
        mount_sessions(
            ResponseTemplate::new(200)
                .insert_header("X-FM-Data-Access-Token", "tok")
                .set_body_json(serde_json::json!({"messages": [{"code": "0"}]})),
        )
        .mount(&server)
        .await;

        let store: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
        let manager = manager_for(&server.uri(), 4, store);

        for _ in 0..10 {
            manager.create_token().await.unwrap();
        }
        assert_eq!(manager.pool().len(), 4);
    }

    #[tokio::test]
    async fn test_get_token_samples_pool_without_minting() {
        let server = MockServer::start().await;
        // no sessions mock mounted: any mint attempt would error

        let store = Arc::new(MemoryTokenStore::new());
        store.put(
            TOKEN_POOL_KEY,
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            None,
        );
        let manager = manager_for(&server.uri(), 10, store);

        for _ in 0..20 {
            let token = manager.get_token(false).await.unwrap();
            assert!(["a", "b", "c"].contains(&token.as_str()));
        }
    }

    #[tokio::test]
    async fn test_force_bypasses_pool() {
        let server = MockServer::start().await;
        mount_sessions(
            ResponseTemplate::new(200).insert_header("X-FM-Data-Access-Token", "fresh"),
        )
        .expect(1)
        .mount(&server)
        .await;

        let store = Arc::new(MemoryTokenStore::new());
        store.put(TOKEN_POOL_KEY, vec!["stale".to_string()], None);
        let manager = manager_for(&server.uri(), 10, store);

        assert_eq!(manager.get_token(true).await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_create_token_without_header_fails() {
        let server = MockServer::start().await;
        mount_sessions(ResponseTemplate::new(200)).mount(&server).await;

        let manager = manager_for(&server.uri(), 10, Arc::new(MemoryTokenStore::new()));
        assert!(matches!(
            manager.create_token().await,
            Err(Error::TokenCreation)
        ));
    }

    #[tokio::test]
    async fn test_create_token_unauthorized() {
        let server = MockServer::start().await;
        mount_sessions(ResponseTemplate::new(401)).mount(&server).await;

        let manager = manager_for(&server.uri(), 10, Arc::new(MemoryTokenStore::new()));
        assert!(matches!(
            manager.create_token().await,
            Err(Error::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_replace_token_mints_when_pool_drained() {
        let server = MockServer::start().await;
        mount_sessions(
            ResponseTemplate::new(200).insert_header("X-FM-Data-Access-Token", "minted"),
        )
        .expect(1)
        .mount(&server)
        .await;

        // limit 4 -> floor is max(4 - 2, 1) = 2; removing from a 2-entry
        // pool leaves 1, which is below the floor, so a mint happens
        let store = Arc::new(MemoryTokenStore::new());
        store.put(
            TOKEN_POOL_KEY,
            vec!["bad".to_string(), "ok".to_string()],
            None,
        );
        let manager = manager_for(&server.uri(), 4, store.clone());

        let replacement = manager.replace_token("bad").await.unwrap();
        assert_eq!(replacement, "minted");

        let pool = manager.pool();
        assert!(!pool.contains(&"bad".to_string()));
        assert_eq!(pool, vec!["ok".to_string(), "minted".to_string()]);
    }

    #[tokio::test]
    async fn test_replace_token_reuses_when_pool_healthy() {
        let server = MockServer::start().await;
        // any mint attempt would fail: no sessions mock

        let store = Arc::new(MemoryTokenStore::new());
        store.put(
            TOKEN_POOL_KEY,
            vec!["bad".to_string(), "a".to_string(), "b".to_string(), "c".to_string()],
            None,
        );
        // limit 4 -> floor 2; 3 survivors stay above it
        let manager = manager_for(&server.uri(), 4, store);

        let replacement = manager.replace_token("bad").await.unwrap();
        assert!(["a", "b", "c"].contains(&replacement.as_str()));
        assert_eq!(manager.pool().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhaust_with_typed_error() {
        let server = MockServer::start().await;
        // missing token header -> Error::TokenCreation, which is retryable
        mount_sessions(ResponseTemplate::new(200))
            .expect(4)
            .mount(&server)
            .await;

        let manager = manager_for(&server.uri(), 10, Arc::new(MemoryTokenStore::new()));
        let policy = TokenRetryPolicy::new(3).with_initial_wait(Duration::from_millis(1));

        match manager.get_token_with_retries(&policy).await {
            Err(Error::TokenRetryExhausted { retries }) => assert_eq!(retries, 3),
            other => panic!("expected TokenRetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_errors_skip_backoff() {
        let server = MockServer::start().await;
        // login rejection is not in the retry whitelist
        mount_sessions(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let manager = manager_for(&server.uri(), 10, Arc::new(MemoryTokenStore::new()));
        let policy = TokenRetryPolicy::default().with_initial_wait(Duration::from_millis(1));

        assert!(matches!(
            manager.get_token_with_retries(&policy).await,
            Err(Error::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_logout_drops_token_and_never_errors() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/fmi/data/v1/databases/db/sessions/abc$"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryTokenStore::new());
        store.put(
            TOKEN_POOL_KEY,
            vec!["abc".to_string(), "keep".to_string()],
            None,
        );
        let manager = manager_for(&server.uri(), 10, store);

        manager.logout("abc").await;
        assert_eq!(manager.pool(), vec!["keep".to_string()]);

        // a second logout of the same token is a no-op
        manager.logout("abc").await;
        assert_eq!(manager.pool(), vec!["keep".to_string()]);
    }
}
