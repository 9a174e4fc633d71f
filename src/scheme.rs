//! DRM scheme, cipher mode and pattern tags.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ParseError, Result};

/// AES and SM4 both use 16-byte blocks.
pub const BLOCK_SIZE: usize = 16;

/// Multi-DRM scheme a session is operating under.
///
/// The tag decides key/IV sizes, the CBC chaining boundary and the default
/// encryption pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrmScheme {
    #[default]
    ClearKey,
    Widevine,
    PlayReady,
    ChinaDrm,
}

impl DrmScheme {
    /// Protection system id registered for the scheme.
    pub fn system_id(self) -> Uuid {
        match self {
            DrmScheme::ClearKey => Uuid::from_u128(0xe2719d58a985b3c9781ab030af78d30e),
            DrmScheme::Widevine => Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed),
            DrmScheme::PlayReady => Uuid::from_u128(0x9a04f07998404286ab92e65be0885f95),
            DrmScheme::ChinaDrm => Uuid::from_u128(0x3d5e6d359b9a41e8b843dd3c6e72c42c),
        }
    }

    /// Look up a scheme by its protection system id.
    pub fn from_system_id(system_id: Uuid) -> Option<Self> {
        [
            DrmScheme::ClearKey,
            DrmScheme::Widevine,
            DrmScheme::PlayReady,
            DrmScheme::ChinaDrm,
        ]
        .into_iter()
        .find(|scheme| scheme.system_id() == system_id)
    }

    /// Content key size in bytes.
    pub fn key_size(self) -> usize {
        16
    }

    /// Per-sample IV size in bytes before padding to a full block.
    pub fn iv_size(self) -> usize {
        match self {
            DrmScheme::PlayReady => 8,
            _ => 16,
        }
    }

    /// Where CBC chaining restarts from the sample IV.
    pub fn cbc_boundary(self) -> CbcBoundary {
        match self {
            DrmScheme::ChinaDrm => CbcBoundary::Sample,
            _ => CbcBoundary::Subsample,
        }
    }

    /// Pattern applied when a unit does not signal one.
    pub fn default_pattern(self, mode: CipherMode) -> Option<Pattern> {
        match self {
            DrmScheme::ChinaDrm if mode.is_cbc() => Some(Pattern::new(1, 9)),
            _ => None,
        }
    }
}

impl fmt::Display for DrmScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DrmScheme::ClearKey => "clearkey",
            DrmScheme::Widevine => "widevine",
            DrmScheme::PlayReady => "playready",
            DrmScheme::ChinaDrm => "chinadrm",
        };
        f.write_str(name)
    }
}

impl FromStr for DrmScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "clearkey" => Ok(DrmScheme::ClearKey),
            "widevine" => Ok(DrmScheme::Widevine),
            "playready" => Ok(DrmScheme::PlayReady),
            "chinadrm" => Ok(DrmScheme::ChinaDrm),
            _ => Err(Error::InvalidConfig(format!("Unknown DRM scheme '{}'", s))),
        }
    }
}

/// Block cipher family of a content key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Aes128,
    Sm4,
}

/// Elementary-stream chaining mode of offline key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EsType {
    Ctr,
    Cbc,
}

/// Cipher mode signalled for a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CipherMode {
    #[default]
    Unencrypted = 0,
    AesCtr = 1,
    AesCbc = 2,
    Sm4Ctr = 3,
    Sm4Cbc = 4,
}

impl CipherMode {
    /// Combine a key type and stream chaining mode.
    pub fn from_parts(key_type: KeyType, es_type: EsType) -> Self {
        match (key_type, es_type) {
            (KeyType::Aes128, EsType::Ctr) => CipherMode::AesCtr,
            (KeyType::Aes128, EsType::Cbc) => CipherMode::AesCbc,
            (KeyType::Sm4, EsType::Ctr) => CipherMode::Sm4Ctr,
            (KeyType::Sm4, EsType::Cbc) => CipherMode::Sm4Cbc,
        }
    }

    pub fn is_encrypted(self) -> bool {
        self != CipherMode::Unencrypted
    }

    pub fn is_ctr(self) -> bool {
        matches!(self, CipherMode::AesCtr | CipherMode::Sm4Ctr)
    }

    pub fn is_cbc(self) -> bool {
        matches!(self, CipherMode::AesCbc | CipherMode::Sm4Cbc)
    }

    /// Cipher family needed to process this mode.
    pub fn key_type(self) -> Option<KeyType> {
        match self {
            CipherMode::Unencrypted => None,
            CipherMode::AesCtr | CipherMode::AesCbc => Some(KeyType::Aes128),
            CipherMode::Sm4Ctr | CipherMode::Sm4Cbc => Some(KeyType::Sm4),
        }
    }
}

impl TryFrom<u8> for CipherMode {
    type Error = ParseError;

    fn try_from(value: u8) -> std::result::Result<Self, ParseError> {
        match value {
            0 => Ok(CipherMode::Unencrypted),
            1 => Ok(CipherMode::AesCtr),
            2 => Ok(CipherMode::AesCbc),
            3 => Ok(CipherMode::Sm4Ctr),
            4 => Ok(CipherMode::Sm4Cbc),
            other => Err(ParseError::UnknownCipherMode(other)),
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherMode::Unencrypted => "unencrypted",
            CipherMode::AesCtr => "aes-ctr",
            CipherMode::AesCbc => "aes-cbc",
            CipherMode::Sm4Ctr => "sm4-ctr",
            CipherMode::Sm4Cbc => "sm4-cbc",
        };
        f.write_str(name)
    }
}

impl FromStr for CipherMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "none" | "unencrypted" => Ok(CipherMode::Unencrypted),
            "aes-ctr" | "cenc" => Ok(CipherMode::AesCtr),
            "aes-cbc" | "cbcs" => Ok(CipherMode::AesCbc),
            "sm4-ctr" => Ok(CipherMode::Sm4Ctr),
            "sm4-cbc" => Ok(CipherMode::Sm4Cbc),
            _ => Err(Error::InvalidConfig(format!("Unknown cipher mode '{}'", s))),
        }
    }
}

/// Where CBC chaining restarts from the sample IV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbcBoundary {
    /// Every encrypted run starts again from the sample IV.
    Subsample,
    /// Chaining continues across all encrypted runs of a sample.
    Sample,
}

/// Block pattern applied inside encrypted runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pattern {
    /// Number of 16-byte blocks processed by the cipher.
    pub encrypted_blocks: u8,
    /// Number of 16-byte blocks copied verbatim after them.
    pub clear_blocks: u8,
}

impl Pattern {
    pub fn new(encrypted_blocks: u8, clear_blocks: u8) -> Self {
        Self {
            encrypted_blocks,
            clear_blocks,
        }
    }

    /// Unpack the `crypt:skip` nibble pair used in the unit header.
    pub fn from_byte(value: u8) -> Self {
        Self::new(value >> 4, value & 0x0f)
    }

    /// Pack into the `crypt:skip` nibble pair used in the unit header.
    ///
    /// `None` when either count exceeds 15.
    pub fn to_byte(self) -> Option<u8> {
        if self.encrypted_blocks > 0x0f || self.clear_blocks > 0x0f {
            return None;
        }
        Some((self.encrypted_blocks << 4) | self.clear_blocks)
    }

    /// `(0, n)`: nothing in the run is encrypted.
    pub fn is_passthrough(self) -> bool {
        self.encrypted_blocks == 0 && self.clear_blocks > 0
    }

    /// `(n, 0)` or `(0, 0)`: the whole run is encrypted.
    pub fn is_full(self) -> bool {
        self.clear_blocks == 0
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.encrypted_blocks, self.clear_blocks)
    }
}
