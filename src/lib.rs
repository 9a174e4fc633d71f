//! rsdrm - DRM session manager and subsample decryption.
//!
//! This crate provides:
//! - DRM session management with license acquisition and key rotation.
//! - Device provisioning handshake.
//! - Inline encryption header parsing and subsample/pattern decryption
//!   (AES-128 and SM4, CTR and CBC).
//! - A W3C ClearKey content decryption module.
//!
//! Feature flags:
//! - `cli`: enable the CLI binary.
//! - `http`: enable the `reqwest` blocking HTTP transport.
//! - `log`: log through the `log` crate.
//! - `tracing`: log through `tracing` instead.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Block cipher providers.
pub mod cipher;
/// W3C ClearKey engine.
pub mod clearkey;
/// YAML configuration.
pub mod config;
/// Inline encryption header parsing.
pub mod crypto_info;
/// Subsample and pattern decryption.
pub mod decrypt;
/// Content decryption module interface.
pub mod engine;
/// Common error types and Result alias.
pub mod error;
/// Key material and key store.
pub mod key;
/// License acquisition.
pub mod license;
/// Session manager.
pub mod manager;
/// Provisioning handshake.
pub mod provision;
/// DRM scheme and cipher mode tags.
pub mod scheme;
/// DRM playback session state machine.
pub mod session;
/// HTTP transport abstraction.
pub mod transport;

pub use error::{Error, Result};
pub use manager::DrmSessionManager;
