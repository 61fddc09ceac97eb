//! Rust SDK for controlling an OpenClaw gateway.
//!
//! The crate is organized by transport surface:
//! - `gateway`: request/response and event client over the gateway WebSocket.
//! - `rest_api`: stateless HTTP client for the gateway's `/api` routes.
//! - `models`: typed payloads shared by both surfaces.
//! - `config`: persisted server connection settings.
//! - `retry`: shared retry and timeout utilities.

/// Server connection settings and environment overrides.
pub mod config;
/// Gateway WebSocket client, protocol types, and typed session helpers.
pub mod gateway;
/// Typed request and response payloads.
pub mod models;
/// HTTP API client and error types.
pub mod rest_api;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
