//! Credential cache and session authorizer.
//!
//! The authorizer owns the bearer credential attached to every outbound
//! request. Refreshes are single-flighted: callers that find the credential
//! expired while a refresh is already running await that same refresh and
//! observe its outcome instead of issuing their own exchange.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::summarize_error_body;

/// Password exchange endpoint for administrator accounts.
pub const ADMIN_PASSWORD_AUTH_PATH: &str = "/api/admins/auth-with-password";
/// Password exchange endpoint for regular user accounts.
pub const USER_PASSWORD_AUTH_PATH: &str = "/api/collections/users/auth-with-password";
/// Token renewal endpoint for administrator accounts.
pub const ADMIN_TOKEN_REFRESH_PATH: &str = "/api/admins/auth-refresh";
/// Token renewal endpoint for regular user accounts.
pub const USER_TOKEN_REFRESH_PATH: &str = "/api/collections/users/auth-refresh";

/// How a client obtains its bearer credential. Chosen once at construction.
#[derive(Clone, Debug)]
pub enum AuthMethod {
    /// No credential; every request is sent unauthenticated.
    Anonymous,
    /// Exchange an identity and secret for a token.
    PasswordExchange {
        /// Endpoint path relative to the client base url.
        path: String,
        /// Account identity, usually an email address.
        identity: String,
        /// Account password.
        secret: SecretString,
    },
    /// Renew a pre-obtained token.
    TokenRenewal {
        /// Endpoint path relative to the client base url.
        path: String,
        /// Seed token installed until the first renewal succeeds.
        token: SecretString,
    },
}

impl AuthMethod {
    /// Administrator password exchange.
    pub fn admin_password(identity: impl Into<String>, secret: SecretString) -> Self {
        Self::PasswordExchange {
            path: ADMIN_PASSWORD_AUTH_PATH.to_string(),
            identity: identity.into(),
            secret,
        }
    }

    /// User password exchange against the `users` auth collection.
    pub fn user_password(identity: impl Into<String>, secret: SecretString) -> Self {
        Self::PasswordExchange {
            path: USER_PASSWORD_AUTH_PATH.to_string(),
            identity: identity.into(),
            secret,
        }
    }

    /// Administrator token renewal.
    pub fn admin_token(token: SecretString) -> Self {
        Self::TokenRenewal {
            path: ADMIN_TOKEN_REFRESH_PATH.to_string(),
            token,
        }
    }

    /// User token renewal against the `users` auth collection.
    pub fn user_token(token: SecretString) -> Self {
        Self::TokenRenewal {
            path: USER_TOKEN_REFRESH_PATH.to_string(),
            token,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::PasswordExchange { .. } => "password",
            Self::TokenRenewal { .. } => "token",
        }
    }
}

/// Errors produced while obtaining or renewing a credential.
///
/// Cloneable so every caller sharing one refresh receives the same outcome.
#[derive(Clone, Debug, Error)]
pub enum AuthError {
    /// The auth endpoint could not be reached.
    #[error("auth request failed: {0}")]
    Transport(Arc<reqwest::Error>),

    /// The auth endpoint answered with a non-success status.
    #[error("auth rejected with http status {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    /// The auth endpoint answered 2xx with an unexpected body.
    #[error("failed to decode auth response: {0}")]
    Decode(String),

    /// The refresh task ended without an outcome.
    #[error("auth refresh interrupted: {0}")]
    Interrupted(String),
}

#[derive(Clone, Debug)]
struct Credential {
    token: SecretString,
    valid_until: Option<Instant>,
}

/// Shared cell holding the credential installed on the transport.
///
/// The token and its expiry are replaced together under one write lock, so a
/// reader never observes a token paired with another token's expiry.
#[derive(Clone, Debug, Default)]
pub struct CredentialStore {
    inner: Arc<RwLock<Option<Credential>>>,
}

impl CredentialStore {
    /// Returns the token currently installed, if any.
    pub fn token(&self) -> Option<SecretString> {
        self.read(|credential| credential.map(|credential| credential.token.clone()))
    }

    /// Returns whether the installed credential is still within its lifetime.
    pub fn is_valid(&self) -> bool {
        self.read(|credential| {
            credential
                .and_then(|credential| credential.valid_until)
                .is_some_and(|valid_until| Instant::now() < valid_until)
        })
    }

    /// Returns the instant the installed credential expires, if it has been
    /// validated by the server.
    pub fn valid_until(&self) -> Option<Instant> {
        self.read(|credential| credential.and_then(|credential| credential.valid_until))
    }

    fn seed(&self, token: SecretString) {
        *self.write() = Some(Credential {
            token,
            valid_until: None,
        });
    }

    fn install(&self, token: SecretString, lifetime: Duration) {
        *self.write() = Some(Credential {
            token,
            valid_until: Some(Instant::now() + lifetime),
        });
    }

    /// Marks `rejected` as expired if it is still the installed token.
    ///
    /// Returns `false` when another caller already replaced it.
    fn invalidate_if_current(&self, rejected: &SecretString) -> bool {
        let mut guard = self.write();
        match guard.as_mut() {
            Some(credential)
                if credential.token.expose_secret() == rejected.expose_secret() =>
            {
                credential.valid_until = None;
                true
            }
            _ => false,
        }
    }

    fn read<R>(&self, f: impl FnOnce(Option<&Credential>) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_ref())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Credential>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<(), AuthError>>>;

#[derive(Default)]
struct FlightSlot {
    generation: u64,
    pending: Option<RefreshFuture>,
}

struct AuthorizerInner {
    http: reqwest::Client,
    url: Option<String>,
    method: AuthMethod,
    credentials: CredentialStore,
    lifetime: Duration,
    request_timeout: Duration,
    flight: Mutex<FlightSlot>,
}

/// Keeps a valid credential installed for the owning client.
#[derive(Clone)]
pub struct SessionAuthorizer {
    inner: Arc<AuthorizerInner>,
}

impl SessionAuthorizer {
    pub(crate) fn new(
        http: reqwest::Client,
        base_url: &str,
        method: AuthMethod,
        lifetime: Duration,
        request_timeout: Duration,
    ) -> Self {
        let credentials = CredentialStore::default();
        let url = match &method {
            AuthMethod::Anonymous => None,
            AuthMethod::PasswordExchange { path, .. } => Some(format!("{base_url}{path}")),
            AuthMethod::TokenRenewal { path, token } => {
                credentials.seed(token.clone());
                Some(format!("{base_url}{path}"))
            }
        };

        Self {
            inner: Arc::new(AuthorizerInner {
                http,
                url,
                method,
                credentials,
                lifetime,
                request_timeout,
                flight: Mutex::new(FlightSlot::default()),
            }),
        }
    }

    /// Shared credential cell read by every request site.
    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    /// Returns whether this authorizer can obtain a credential at all.
    pub fn can_refresh(&self) -> bool {
        !matches!(self.inner.method, AuthMethod::Anonymous)
    }

    /// Ensures a valid credential is installed.
    ///
    /// Returns immediately while the cached credential is valid. Otherwise
    /// joins the in-flight refresh, starting one if none is running. The
    /// refresh runs on its own task and completes even if every caller stops
    /// waiting.
    pub async fn authorize(&self) -> Result<(), AuthError> {
        if !self.can_refresh() || self.inner.credentials.is_valid() {
            return Ok(());
        }

        self.join_flight().await
    }

    /// Expires `rejected` so the next [`authorize`](Self::authorize) refreshes.
    ///
    /// Used when the server refuses a credential the client still believes
    /// valid. A no-op if the token has already been replaced.
    pub fn invalidate(&self, rejected: &SecretString) {
        if self.inner.credentials.invalidate_if_current(rejected) {
            debug!(
                event = "credential_invalidated",
                method = self.inner.method.kind()
            );
        }
    }

    fn join_flight(&self) -> RefreshFuture {
        let mut slot = self.inner.flight_slot();
        if let Some(pending) = slot.pending.as_ref() {
            return pending.clone();
        }

        slot.generation = slot.generation.wrapping_add(1);
        let generation = slot.generation;
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let outcome = refresh(&inner).await;
            inner.finish_flight(generation);
            outcome
        });
        let inner = Arc::clone(&self.inner);
        let flight = async move {
            task.await.unwrap_or_else(|err| {
                inner.finish_flight(generation);
                Err(AuthError::Interrupted(err.to_string()))
            })
        }
        .boxed()
        .shared();
        slot.pending = Some(flight.clone());
        flight
    }
}

impl AuthorizerInner {
    fn flight_slot(&self) -> std::sync::MutexGuard<'_, FlightSlot> {
        self.flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears the slot once the refresh of `generation` has an outcome, so
    /// the next expiry starts a new exchange.
    fn finish_flight(&self, generation: u64) {
        let mut slot = self.flight_slot();
        if slot.generation == generation {
            slot.pending = None;
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
}

async fn refresh(inner: &AuthorizerInner) -> Result<(), AuthError> {
    if inner.credentials.is_valid() {
        return Ok(());
    }
    let Some(url) = inner.url.as_deref() else {
        return Ok(());
    };

    let request = match &inner.method {
        AuthMethod::Anonymous => return Ok(()),
        AuthMethod::PasswordExchange {
            identity, secret, ..
        } => inner.http.post(url).json(&json!({
            "identity": identity,
            "password": secret.expose_secret(),
        })),
        AuthMethod::TokenRenewal { token: seed, .. } => {
            let current = inner.credentials.token().unwrap_or_else(|| seed.clone());
            inner
                .http
                .post(url)
                .header(AUTHORIZATION, current.expose_secret().as_str())
        }
    };

    let response = request
        .timeout(inner.request_timeout)
        .send()
        .await
        .map_err(|err| {
            warn!(
                event = "auth_request_failed",
                method = inner.method.kind(),
                error = %err
            );
            AuthError::Transport(Arc::new(err))
        })?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| AuthError::Transport(Arc::new(err)))?;

    if !status.is_success() {
        warn!(
            event = "auth_rejected",
            method = inner.method.kind(),
            status = status.as_u16()
        );
        return Err(AuthError::Rejected {
            status,
            body: summarize_error_body(&body),
        });
    }

    let parsed: AuthResponse =
        serde_json::from_str(&body).map_err(|err| AuthError::Decode(err.to_string()))?;
    inner
        .credentials
        .install(SecretString::new(parsed.token), inner.lifetime);
    info!(
        event = "auth_refreshed",
        method = inner.method.kind(),
        lifetime_secs = inner.lifetime.as_secs()
    );
    Ok(())
}
