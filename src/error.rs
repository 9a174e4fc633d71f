//! Error types for rsdrm.

use thiserror::Error;
use uuid::Uuid;

use crate::session::{SessionHandle, SessionState};

/// Message shown to end users for any license/provisioning failure.
///
/// Raw protocol codes stay in the logs.
pub const CONTENT_PROTECTION_ERROR: &str = "content protection error";

/// Main error type for rsdrm operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The DRM layer could not be initialised (or playback is blocked).
    #[error("DRM initialisation failed: {0}")]
    InitFailed(String),

    /// Too many sessions are open.
    #[error("Too many sessions open (max {max})")]
    TooManySessions { max: usize },

    /// No session is open with the specified handle.
    #[error("Session handle {0} is invalid")]
    InvalidSession(SessionHandle),

    /// The session is not in a state that allows the operation.
    #[error("Invalid session state: expected {expected}, session is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: SessionState,
    },

    /// The access unit's encryption header could not be decoded.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Key-rotation sentinel: the sample needs a key that is not installed.
    #[error("No key available for key id {0}")]
    NoKeyAvailable(Uuid),

    /// The license server did not answer with HTTP 200.
    #[error("License exchange failed (HTTP status {status:?})")]
    LicenseFailed { status: Option<u16> },

    /// The provisioning handshake did not complete.
    #[error("Provisioning failed: {0}")]
    ProvisioningFailed(ProvisioningFailure),

    /// The cipher rejected the key, IV or data.
    #[error("Cipher failure: {0}")]
    CipherFailure(String),

    /// The caller supplied output buffer cannot hold the sample.
    #[error("Output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// The license response is invalid or carries no usable key.
    #[error("Invalid license message: {0}")]
    InvalidLicenseMessage(String),

    /// The HTTP transport failed before a status was received.
    #[error("Transport error: {message}")]
    Transport { message: String, timeout: bool },

    /// Configuration is missing or inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML decode error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Reasons an access unit's inline encryption header is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Encryption is signalled but no IV is available.
    #[error("encrypted unit carries no IV")]
    MissingIv,

    /// The subsample table is inconsistent with the payload.
    #[error("malformed subsample table: {0}")]
    MalformedSubsampleTable(String),

    /// The unit ends inside the header.
    #[error("unit truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The cipher mode byte is not known.
    #[error("unknown cipher mode {0}")]
    UnknownCipherMode(u8),

    /// IVs are 8 or 16 bytes.
    #[error("invalid IV size {0}")]
    InvalidIvSize(u8),

    /// Header fields contradict each other.
    #[error("malformed header: {0}")]
    MalformedHeader(String),
}

/// Why a provisioning attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProvisioningFailure {
    /// The engine has nothing to provision (device already provisioned).
    #[error("no provisioning request (device already provisioned)")]
    NoRequest,

    /// The server answered with a non-2xx status, or not at all.
    #[error("HTTP status {0:?}")]
    Http(Option<u16>),
}

impl Error {
    /// Build a transport error from a message.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            timeout: false,
        }
    }

    /// Build a transport timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            timeout: true,
        }
    }

    /// True for the key-rotation sentinel, which callers retry after
    /// reinstalling key material.
    #[must_use]
    pub fn is_key_rotation(&self) -> bool {
        matches!(self, Error::NoKeyAvailable(_))
    }

    /// True for errors that block playback until retried at a higher level.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InitFailed(_) | Error::TooManySessions { .. } | Error::ProvisioningFailed(_)
        )
    }

    /// True for errors that only affect the sample being processed.
    #[must_use]
    pub fn is_per_sample(&self) -> bool {
        matches!(
            self,
            Error::Parse(_) | Error::CipherFailure(_) | Error::BufferTooSmall { .. }
        )
    }

    /// True for license/provisioning failures shown to users as one
    /// consolidated message.
    #[must_use]
    pub fn is_content_protection_error(&self) -> bool {
        matches!(
            self,
            Error::InitFailed(_)
                | Error::TooManySessions { .. }
                | Error::LicenseFailed { .. }
                | Error::ProvisioningFailed(_)
                | Error::InvalidLicenseMessage(_)
        )
    }

    /// Return the message to show to end users.
    #[must_use]
    pub fn user_message(&self) -> String {
        if self.is_content_protection_error() {
            CONTENT_PROTECTION_ERROR.to_string()
        } else {
            self.to_string()
        }
    }

    /// HTTP status attached to a license/provisioning failure, if any.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::LicenseFailed { status } => *status,
            Error::ProvisioningFailed(ProvisioningFailure::Http(status)) => *status,
            _ => None,
        }
    }
}

/// Result type alias for rsdrm operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_failures_share_one_user_message() {
        let license = Error::LicenseFailed { status: Some(403) };
        let provisioning = Error::ProvisioningFailed(ProvisioningFailure::Http(Some(500)));

        assert_eq!(license.user_message(), CONTENT_PROTECTION_ERROR);
        assert_eq!(provisioning.user_message(), CONTENT_PROTECTION_ERROR);
        assert_eq!(license.http_status(), Some(403));
        assert_eq!(provisioning.http_status(), Some(500));
    }

    #[test]
    fn per_sample_errors_keep_their_message() {
        let err = Error::from(ParseError::MissingIv);
        assert!(err.is_per_sample());
        assert!(!err.is_fatal());
        assert!(err.user_message().contains("IV"));
    }

    #[test]
    fn key_rotation_is_not_fatal() {
        let err = Error::NoKeyAvailable(Uuid::nil());
        assert!(err.is_key_rotation());
        assert!(!err.is_fatal());
        assert!(!err.is_content_protection_error());
    }
}
