//! DRM configuration loaded from YAML.
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::license::LicenseRequestType;
use crate::scheme::DrmScheme;

/// Top-level DRM configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DrmConfig {
    /// Scheme new sessions start with.
    #[serde(default)]
    pub scheme: DrmScheme,
    /// Provisioning server; `None` skips provisioning.
    #[serde(default)]
    pub provisioning_url: Option<String>,
    /// License server settings for online sessions.
    #[serde(default)]
    pub license: Option<LicenseConfig>,
    /// Maximum number of concurrently open sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// How often a caller retries a decrypt after a key rotation.
    #[serde(default = "default_max_key_rotation_retries")]
    pub max_key_rotation_retries: u32,
    #[serde(default)]
    pub http: HttpConfig,
}

/// License server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LicenseConfig {
    pub url: String,
    #[serde(default = "default_request_type")]
    pub request_type: LicenseRequestType,
    /// Bearer token for the `*-with-jwt` request types.
    #[serde(default)]
    pub token: Option<String>,
}

/// HTTP client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_max_sessions() -> usize {
    16
}

fn default_max_key_rotation_retries() -> u32 {
    3
}

fn default_request_type() -> LicenseRequestType {
    LicenseRequestType::Post
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("rsdrm/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for DrmConfig {
    fn default() -> Self {
        Self {
            scheme: DrmScheme::default(),
            provisioning_url: None,
            license: None,
            max_sessions: default_max_sessions(),
            max_key_rotation_retries: default_max_key_rotation_retries(),
            http: HttpConfig::default(),
        }
    }
}

impl DrmConfig {
    /// Load and validate a YAML configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: DrmConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the session manager cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(Error::InvalidConfig(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        if self.http.connect_timeout_secs == 0 || self.http.read_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "HTTP timeouts must be non-zero".to_string(),
            ));
        }
        if let Some(ref license) = self.license {
            if license.url.is_empty() {
                return Err(Error::InvalidConfig("license.url is empty".to_string()));
            }
            if license.request_type.with_bearer() && license.token.is_none() {
                return Err(Error::InvalidConfig(format!(
                    "license.request_type {} needs license.token",
                    license.request_type
                )));
            }
        }
        Ok(())
    }
}
