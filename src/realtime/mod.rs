//! Realtime subscription modules.
//!
//! - `client`: SSE connection controller, registration, and reconnect loop.
//! - `hub`: in-process multicast of decoded events to listeners.
//! - `proto`: wire messages exchanged with the realtime endpoint.
//! - `sse`: incremental server-sent events decoder.
//! - `subscription`: caller-facing handle with cancellation.

/// Stream controller and subscribe entry points.
pub mod client;
/// Event multicast hub.
pub mod hub;
/// Realtime protocol messages.
pub mod proto;
/// Server-sent events framing.
pub mod sse;
/// Subscription handle returned to callers.
pub mod subscription;
