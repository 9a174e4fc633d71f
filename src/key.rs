//! Key material and the per-session key store.
//!
//! Key bytes are zeroized on drop and never printed.
use std::fmt;

use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::scheme::{CipherMode, DrmScheme, KeyType, Pattern};

/// An active symmetric content key.
///
/// `key_id` is `None` for offline keys supplied without one; such keys are
/// applied to every sample regardless of the key id it names.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    #[zeroize(skip)]
    pub key_id: Option<Uuid>,
    #[zeroize(skip)]
    pub key_type: KeyType,
    key: Vec<u8>,
    iv: Option<[u8; 16]>,
}

impl KeyMaterial {
    /// Create new key material.
    ///
    /// Length is not checked here; a key the cipher rejects surfaces as a
    /// per-sample `CipherFailure`.
    pub fn new(key_type: KeyType, key_id: Option<Uuid>, key: Vec<u8>, iv: Option<[u8; 16]>) -> Self {
        Self {
            key_id,
            key_type,
            key,
            iv,
        }
    }

    /// Raw key bytes.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Constant IV supplied with the key, if any.
    pub fn iv(&self) -> Option<[u8; 16]> {
        self.iv
    }

    /// Whether this key may decrypt a sample naming `key_id`.
    ///
    /// A nil key id on the sample matches any key.
    pub fn matches(&self, key_id: &Uuid) -> bool {
        match self.key_id {
            None => true,
            Some(ref own) => key_id.is_nil() || own == key_id,
        }
    }

    /// Convert raw key id bytes into a UUID.
    pub fn kid_to_uuid(kid: &[u8]) -> Result<Uuid> {
        Uuid::from_slice(kid).map_err(|_| {
            Error::InvalidLicenseMessage(format!("Key id must be 16 bytes, got {}", kid.len()))
        })
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("key_type", &self.key_type)
            .field("key", &"[REDACTED]")
            .field("iv", &self.iv.map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Key state of one session.
///
/// Holds exactly one active key at a time. Only `DrmSession` mutates it.
#[derive(Debug, Default)]
pub struct KeyStore {
    scheme: DrmScheme,
    active: Option<KeyMaterial>,
    mode: Option<CipherMode>,
    pattern: Option<Pattern>,
}

impl KeyStore {
    pub fn new(scheme: DrmScheme) -> Self {
        Self {
            scheme,
            ..Default::default()
        }
    }

    pub fn scheme(&self) -> DrmScheme {
        self.scheme
    }

    /// The active key, if one is installed.
    pub fn active(&self) -> Option<&KeyMaterial> {
        self.active.as_ref()
    }

    /// Cipher mode fixed by offline key material.
    pub fn mode(&self) -> Option<CipherMode> {
        self.mode
    }

    /// Pattern override configured for the session.
    pub fn pattern(&self) -> Option<Pattern> {
        self.pattern
    }

    /// IV to use for units that carry none.
    pub fn constant_iv(&self) -> Option<[u8; 16]> {
        self.active.as_ref().and_then(KeyMaterial::iv)
    }

    pub(crate) fn set_scheme(&mut self, scheme: DrmScheme) {
        self.scheme = scheme;
    }

    pub(crate) fn set_mode(&mut self, mode: Option<CipherMode>) {
        self.mode = mode;
    }

    pub(crate) fn set_pattern(&mut self, pattern: Option<Pattern>) {
        self.pattern = pattern;
    }

    /// Replace the active key. The retired key is zeroized when dropped here.
    pub(crate) fn install(&mut self, material: KeyMaterial) {
        drop(self.active.replace(material));
    }

    /// Drop all key state.
    pub(crate) fn clear(&mut self) {
        self.active = None;
        self.mode = None;
        self.pattern = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(byte: u8, kid: Option<Uuid>) -> KeyMaterial {
        KeyMaterial::new(KeyType::Aes128, kid, vec![byte; 16], Some([byte; 16]))
    }

    #[test]
    fn install_replaces_the_active_key() {
        let mut store = KeyStore::new(DrmScheme::ClearKey);
        store.install(material(1, None));
        store.install(material(2, None));

        assert_eq!(store.active().unwrap().key(), &[2u8; 16]);
        assert_eq!(store.constant_iv(), Some([2u8; 16]));
    }

    #[test]
    fn clear_removes_key_state() {
        let mut store = KeyStore::new(DrmScheme::Widevine);
        store.install(material(1, None));
        store.set_mode(Some(CipherMode::AesCtr));
        store.clear();

        assert!(store.active().is_none());
        assert!(store.mode().is_none());
        assert_eq!(store.scheme(), DrmScheme::Widevine);
    }

    #[test]
    fn key_id_matching() {
        let kid = Uuid::from_u128(7);
        let other = Uuid::from_u128(8);

        assert!(material(1, Some(kid)).matches(&kid));
        assert!(material(1, Some(kid)).matches(&Uuid::nil()));
        assert!(!material(1, Some(kid)).matches(&other));
        assert!(material(1, None).matches(&other));
    }

    #[test]
    fn debug_output_redacts_key_bytes() {
        let rendered = format!("{:?}", material(0xAB, None));
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("171"));
    }

    #[test]
    fn kid_must_be_sixteen_bytes() {
        assert!(KeyMaterial::kid_to_uuid(&[0u8; 16]).is_ok());
        assert!(KeyMaterial::kid_to_uuid(&[0u8; 4]).is_err());
    }
}
