//! Content decryption module interface.
//!
//! The engine owns the DRM-scheme specific message formats. The session
//! layer only moves its opaque payloads between the engine and the network.
use std::fmt;

use uuid::Uuid;

use crate::error::Result;
use crate::key::KeyMaterial;
use crate::scheme::DrmScheme;

/// What a license request is for.
#[derive(Debug, Clone, Copy)]
pub struct LicenseContext<'a> {
    pub scheme: DrmScheme,
    /// Key ids the request asks for. Empty means "whatever the content needs".
    pub key_ids: &'a [Uuid],
    /// Scheme specific init data (e.g. a PSSH payload).
    pub init_data: Option<&'a [u8]>,
}

/// Request/response surface of a content decryption module.
pub trait CdmEngine: Send + Sync + fmt::Debug {
    /// Provisioning payload to POST, or `None` when the device is already
    /// provisioned.
    fn provision_request(&self) -> Result<Option<Vec<u8>>>;

    /// Finalize provisioning with the server's answer.
    fn process_provision_response(&self, response: &[u8]) -> Result<()>;

    /// Build the license request body for `ctx`.
    fn license_request(&self, ctx: &LicenseContext<'_>) -> Result<Vec<u8>>;

    /// Turn a license response into content keys.
    fn process_license_response(
        &self,
        ctx: &LicenseContext<'_>,
        response: &[u8],
    ) -> Result<Vec<KeyMaterial>>;
}
