//! Per-run context
//!
//! A [`Context`] is built for exactly one reconciliation run and handed to
//! every backend call. It owns the scopes to fan out over, the credentials
//! for each of them, the provider sessions opened during the run, the memo
//! cache and the run deadline. Nothing in it outlives the run.

use crate::cache::MemoCache;
use crate::entity::{Entity, Reality};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// A provider partition the engine fans out over, e.g. a region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub name: String,
    pub enabled: bool,
}

impl Scope {
    pub fn enabled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
        }
    }

    pub fn disabled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: false,
        }
    }
}

/// Provider credentials for one scope
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Read credentials from `CLOUDROW_ACCESS_KEY_ID`, `CLOUDROW_SECRET_ACCESS_KEY`
    /// and the optional `CLOUDROW_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("CLOUDROW_ACCESS_KEY_ID").map_err(|_| {
            EngineError::AuthenticationFailed("CLOUDROW_ACCESS_KEY_ID is not set".to_string())
        })?;
        let secret_access_key = std::env::var("CLOUDROW_SECRET_ACCESS_KEY").map_err(|_| {
            EngineError::AuthenticationFailed("CLOUDROW_SECRET_ACCESS_KEY is not set".to_string())
        })?;
        let session_token = std::env::var("CLOUDROW_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Something that opens authenticated, scope-qualified sessions.
#[async_trait]
pub trait Provider: Send + Sync {
    type Session: Send + Sync + 'static;

    async fn connect(&self, scope: &Scope, credentials: &Credentials) -> Result<Self::Session>;
}

type SessionSlot = Arc<dyn Any + Send + Sync>;

pub struct Context {
    account: String,
    scopes: Vec<Scope>,
    credentials: HashMap<String, Credentials>,
    default_credentials: Option<Credentials>,
    deadline: Option<Instant>,
    cache: MemoCache,
    sessions: Mutex<HashMap<(TypeId, String), SessionSlot>>,
}

impl Context {
    pub fn builder(account: impl Into<String>) -> ContextBuilder {
        ContextBuilder {
            account: account.into(),
            scopes: Vec::new(),
            credentials: HashMap::new(),
            default_credentials: None,
            deadline: None,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Every known scope, enabled or not
    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    pub fn enabled_scopes(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter().filter(|s| s.enabled)
    }

    pub fn is_enabled(&self, scope: &str) -> bool {
        self.enabled_scopes().any(|s| s.name == scope)
    }

    /// Look up an enabled scope by name
    pub fn scope(&self, name: &str) -> Result<&Scope> {
        match self.scopes.iter().find(|s| s.name == name) {
            Some(scope) if scope.enabled => Ok(scope),
            Some(_) => Err(EngineError::Validation(format!("scope '{}' is disabled", name))),
            None => Err(EngineError::Validation(format!("unknown scope '{}'", name))),
        }
    }

    pub fn credentials(&self, scope: &str) -> Result<&Credentials> {
        self.credentials
            .get(scope)
            .or(self.default_credentials.as_ref())
            .ok_or_else(|| {
                EngineError::AuthenticationFailed(format!("no credentials for scope '{}'", scope))
            })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
    }

    pub fn cache(&self) -> &MemoCache {
        &self.cache
    }

    /// Session for `scope`, opened once per run and session type.
    pub async fn session<P: Provider>(&self, provider: &P, scope: &str) -> Result<Arc<P::Session>> {
        let key = (TypeId::of::<P::Session>(), scope.to_string());
        let existing = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned();
        if let Some(slot) = existing {
            return downcast_session::<P::Session>(slot);
        }

        let scope_ref = self.scope(scope)?;
        let credentials = self.credentials(scope)?;
        tracing::debug!("Opening provider session for {} in {}", self.account, scope);
        let session: SessionSlot = Arc::new(provider.connect(scope_ref, credentials).await?);

        let slot = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_insert(session)
            .clone();
        downcast_session::<P::Session>(slot)
    }

    /// Run `f` once per enabled scope, concurrently, and concatenate the results.
    pub async fn fan_out<T, F, Fut>(&self, f: F) -> Result<Vec<T>>
    where
        F: Fn(Scope) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let parts = try_join_all(self.enabled_scopes().cloned().map(&f)).await?;
        Ok(parts.into_iter().flatten().collect())
    }

    /// Read one entity through the memo cache, calling `fetch` on a miss.
    pub async fn read_through<E, F, Fut>(
        &self,
        reality: Reality,
        kind: &'static str,
        id: &str,
        fetch: F,
    ) -> Result<Option<E>>
    where
        E: Entity,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<E>>>,
    {
        if let Some(entity) = self.cache.get::<E>(reality, kind, id) {
            return Ok(Some(entity));
        }
        let fetched = fetch().await?;
        if let Some(entity) = &fetched {
            self.cache.put(reality, kind, id, entity.clone());
        }
        Ok(fetched)
    }

    /// Drop everything tied to this run: cached entities and open sessions.
    pub fn teardown(&self) {
        let stats = self.cache.stats();
        tracing::debug!(
            "Tearing down context for {} (cache hits: {}, misses: {})",
            self.account,
            stats.hits,
            stats.misses
        );
        self.cache.clear();
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

fn downcast_session<S: Send + Sync + 'static>(slot: SessionSlot) -> Result<Arc<S>> {
    slot.downcast::<S>()
        .map_err(|_| EngineError::Provider("session type mismatch".to_string()))
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("account", &self.account)
            .field("scopes", &self.scopes)
            .field("deadline", &self.deadline)
            .field("cache", &self.cache)
            .finish()
    }
}

pub struct ContextBuilder {
    account: String,
    scopes: Vec<Scope>,
    credentials: HashMap<String, Credentials>,
    default_credentials: Option<Credentials>,
    deadline: Option<Instant>,
}

impl ContextBuilder {
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scopes.retain(|s| s.name != scope.name);
        self.scopes.push(scope);
        self
    }

    pub fn scopes(self, scopes: impl IntoIterator<Item = Scope>) -> Self {
        scopes.into_iter().fold(self, |b, s| b.scope(s))
    }

    /// Credentials used for any scope without its own
    pub fn default_credentials(mut self, credentials: Credentials) -> Self {
        self.default_credentials = Some(credentials);
        self
    }

    pub fn scope_credentials(mut self, scope: impl Into<String>, credentials: Credentials) -> Self {
        self.credentials.insert(scope.into(), credentials);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn build(self) -> Context {
        Context {
            account: self.account,
            scopes: self.scopes,
            credentials: self.credentials,
            default_credentials: self.default_credentials,
            deadline: self.deadline,
            cache: MemoCache::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }
}
