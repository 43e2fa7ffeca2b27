//! HTTP transport shared by record requests and realtime subscriptions.
//!
//! Every request is sent through one `reqwest` client and carries the
//! credential currently installed by the [`SessionAuthorizer`].

use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::auth::{AuthError, AuthMethod, SessionAuthorizer};
use crate::retry::RetryPolicy;

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientDefaults;

impl ClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    /// Client-side estimate of a token's lifetime; the server does not report
    /// it, so a 401 on a regular call still forces a refresh.
    pub const CREDENTIAL_LIFETIME: Duration = Duration::from_secs(60 * 60);
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    /// Per-attempt timeout for non-streaming requests.
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub credential_lifetime: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ClientDefaults::CONNECT_TIMEOUT,
            request_timeout: ClientDefaults::REQUEST_TIMEOUT,
            retry_policy: RetryPolicy::transport_default(),
            credential_lifetime: ClientDefaults::CREDENTIAL_LIFETIME,
        }
    }
}

/// Errors produced by plain request/response calls.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to decode response: {source}. body={body}")]
    Decode {
        #[source]
        source: serde_json::Error,
        body: String,
    },
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Auth(_) | Self::Decode { .. } => false,
        }
    }

    /// Returns the HTTP status for status errors.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Auth(AuthError::Rejected { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

/// Buffered response of a non-streaming call.
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub status: StatusCode,
    pub body: String,
}

impl RawResponse {
    /// Converts non-success statuses into [`ClientError::HttpStatus`].
    pub fn error_for_status(self) -> Result<Self, ClientError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ClientError::HttpStatus {
                status: self.status,
                body: summarize_error_body(&self.body),
            })
        }
    }
}

/// Entry point for talking to a backend instance.
///
/// Cloning is cheap; clones share the connection pool and the credential.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    authorizer: SessionAuthorizer,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl Client {
    /// Creates an anonymous client with default options.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_options(base_url, AuthMethod::Anonymous, ClientOptions::default())
    }

    /// Creates a client authenticating with `auth` and default options.
    pub fn with_auth(base_url: impl Into<String>, auth: AuthMethod) -> Result<Self, ClientError> {
        Self::with_options(base_url, auth, ClientOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        auth: AuthMethod,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ClientError::Transport)?;

        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        let authorizer = SessionAuthorizer::new(
            http.clone(),
            &base_url,
            auth,
            options.credential_lifetime,
            options.request_timeout,
        );

        Ok(Self {
            http,
            base_url,
            authorizer,
            request_timeout: options.request_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ensures a valid credential is installed, refreshing it if needed.
    pub async fn authorize(&self) -> Result<(), AuthError> {
        self.authorizer.authorize().await
    }

    /// Returns the token currently attached to outbound requests.
    pub fn auth_token(&self) -> Option<SecretString> {
        self.authorizer.credentials().token()
    }

    /// Returns whether the installed credential is within its lifetime.
    pub fn is_authorized(&self) -> bool {
        self.authorizer.credentials().is_valid()
    }

    pub(crate) fn authorizer(&self) -> &SessionAuthorizer {
        &self.authorizer
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attaches the installed credential, if any, to `request`.
    pub(crate) fn with_credential(&self, request: RequestBuilder) -> RequestBuilder {
        match self.auth_token() {
            Some(token) => request.header(AUTHORIZATION, token.expose_secret().as_str()),
            None => request,
        }
    }

    /// Sends one authorized request built by `build`.
    ///
    /// A 401 answer for a credential the client still considered valid expires
    /// it, refreshes once, and replays the request with the new token.
    pub(crate) async fn send_authorized<F>(&self, build: F) -> Result<RawResponse, ClientError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        self.authorizer.authorize().await?;
        let token = self.auth_token();
        let response = self.send_once(&build, token.as_ref()).await?;

        if response.status != StatusCode::UNAUTHORIZED || !self.authorizer.can_refresh() {
            return Ok(response);
        }
        let Some(rejected) = token else {
            return Ok(response);
        };

        debug!(event = "credential_rejected_by_server");
        self.authorizer.invalidate(&rejected);
        self.authorizer.authorize().await?;
        let token = self.auth_token();
        self.send_once(&build, token.as_ref()).await
    }

    async fn send_once<F>(
        &self,
        build: &F,
        token: Option<&SecretString>,
    ) -> Result<RawResponse, ClientError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut request = build(&self.http).timeout(self.request_timeout);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, token.expose_secret().as_str());
        }

        let response = request.send().await.map_err(ClientError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ClientError::Transport)?;
        Ok(RawResponse { status, body })
    }
}

/// Extracts the backend's `message` from an error body, or a prefix of the
/// raw body when it is not the usual error shape.
pub(crate) fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.error) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
