//! Async Rust client for PocketBase-style record backends.
//!
//! The crate is organized by transport surface:
//! - `client`: shared HTTP transport, options, and credential attachment.
//! - `auth`: credential cache and single-flight session authorizer.
//! - `records`: record CRUD calls and typed collections.
//! - `realtime`: SSE subscriptions with automatic reconnect.
//! - `retry`: request retry and reconnect backoff utilities.

/// Credential store, auth methods, and the session authorizer.
pub mod auth;
/// Client construction, options, and request plumbing.
pub mod client;
/// Realtime stream controller, event hub, and subscription handle.
pub mod realtime;
/// Record CRUD requests and typed collection views.
pub mod records;
/// Retry and backoff helpers used across the SDK.
pub mod retry;

pub use auth::{AuthError, AuthMethod};
pub use client::{Client, ClientError, ClientOptions};
pub use realtime::client::{RealtimeError, StreamState, SubscribeOptions};
pub use realtime::proto::{Event, EventAction};
pub use realtime::subscription::Subscription;
pub use records::{Collection, ParamsList, Record, ResponseCreate, ResponseList};
pub use retry::{ReconnectStrategy, RetryPolicy};
pub use secrecy::SecretString;
