//! DRM playback sessions.
//!
//! A session owns one key store and walks the
//! `Closed -> Opened -> KeyPending -> KeyInstalled -> Decrypting` state
//! machine. Key rotation is detected while decrypting and answered with
//! [`Error::NoKeyAvailable`] plus a parked license request.
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto_info::{parse_unit, AccessUnit, CryptoInfo, ParseContext};
use crate::decrypt::{decrypt_sample, SampleKey};
use crate::engine::{CdmEngine, LicenseContext};
use crate::error::{Error, Result};
use crate::key::{KeyMaterial, KeyStore};
use crate::license::{LicenseRequest, LicenseRequestType};
use crate::scheme::{CipherMode, DrmScheme, EsType, KeyType, Pattern};

/// Opaque session handle, unique for the lifetime of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u32);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Closed,
    Opened,
    KeyPending,
    KeyInstalled,
    Decrypting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Closed => "Closed",
            SessionState::Opened => "Opened",
            SessionState::KeyPending => "KeyPending",
            SessionState::KeyInstalled => "KeyInstalled",
            SessionState::Decrypting => "Decrypting",
        };
        f.write_str(name)
    }
}

/// Online license parameters for a session.
#[derive(Clone)]
pub struct DrmInfo {
    pub license_url: String,
    pub request_type: LicenseRequestType,
    /// Bearer token for the `*-with-jwt` request types.
    pub token: Option<String>,
    /// Key ids to ask for up front.
    pub key_ids: Vec<Uuid>,
    /// Scheme specific init data handed to the engine.
    pub init_data: Option<Vec<u8>>,
    /// Pattern for units that signal none.
    pub pattern: Option<Pattern>,
}

impl DrmInfo {
    pub fn new(license_url: impl Into<String>, request_type: LicenseRequestType) -> Self {
        Self {
            license_url: license_url.into(),
            request_type,
            token: None,
            key_ids: Vec::new(),
            init_data: None,
            pattern: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_key_ids(mut self, key_ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.key_ids = key_ids.into_iter().collect();
        self
    }

    pub fn with_init_data(mut self, init_data: Vec<u8>) -> Self {
        self.init_data = Some(init_data);
        self
    }
}

impl fmt::Debug for DrmInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmInfo")
            .field("license_url", &self.license_url)
            .field("request_type", &self.request_type)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("key_ids", &self.key_ids)
            .field("init_data", &self.init_data.as_ref().map(Vec::len))
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// License parameters for one scheme of a multi-DRM stream.
#[derive(Debug, Clone)]
pub struct MultiDrmInfo {
    pub scheme: DrmScheme,
    pub drm: DrmInfo,
}

/// Key material supplied without a license exchange.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct OfflineDrmInfo {
    #[zeroize(skip)]
    pub key_type: KeyType,
    #[zeroize(skip)]
    pub es_type: EsType,
    pub key: Vec<u8>,
    pub iv: [u8; 16],
    #[zeroize(skip)]
    pub key_id: Option<Uuid>,
    #[zeroize(skip)]
    pub pattern: Option<Pattern>,
}

impl OfflineDrmInfo {
    pub fn new(key_type: KeyType, es_type: EsType, key: Vec<u8>, iv: [u8; 16]) -> Self {
        Self {
            key_type,
            es_type,
            key,
            iv,
            key_id: None,
            pattern: None,
        }
    }

    pub fn with_key_id(mut self, key_id: Uuid) -> Self {
        self.key_id = Some(key_id);
        self
    }

    pub fn with_pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = Some(pattern);
        self
    }
}

impl fmt::Debug for OfflineDrmInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineDrmInfo")
            .field("key_type", &self.key_type)
            .field("es_type", &self.es_type)
            .field("key", &"[REDACTED]")
            .field("key_id", &self.key_id)
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Result of feeding a license response to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseOutcome {
    /// A key was installed; carries its id when the license names one.
    Installed { key_id: Option<Uuid> },
    /// The response belongs to a closed session or a superseded request and
    /// was discarded.
    Stale,
}

/// A DRM playback session.
#[derive(Debug)]
pub struct DrmSession {
    handle: SessionHandle,
    state: SessionState,
    /// Bumped whenever outstanding license requests become obsolete.
    generation: u64,
    store: KeyStore,
    drm_info: Option<DrmInfo>,
    requested: Vec<Uuid>,
    pending: Option<LicenseRequest>,
    /// Key id that triggered an unfinished rotation.
    rotation: Option<Uuid>,
    last_license_status: Option<u16>,
    engine: Arc<dyn CdmEngine>,
}

impl DrmSession {
    /// Create an opened session.
    pub fn new(handle: SessionHandle, scheme: DrmScheme, engine: Arc<dyn CdmEngine>) -> Self {
        Self {
            handle,
            state: SessionState::Opened,
            generation: 0,
            store: KeyStore::new(scheme),
            drm_info: None,
            requested: Vec::new(),
            pending: None,
            rotation: None,
            last_license_status: None,
            engine,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn scheme(&self) -> DrmScheme {
        self.store.scheme()
    }

    /// Key id of the active key, if the key names one.
    pub fn active_key_id(&self) -> Option<Uuid> {
        self.store.active().and_then(|key| key.key_id)
    }

    /// Status of the last failed license exchange.
    pub fn last_license_status(&self) -> Option<u16> {
        self.last_license_status
    }

    /// Whether a key rotation is waiting for new key material.
    pub fn rotation_pending(&self) -> bool {
        self.rotation.is_some()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(Error::InvalidSession(self.handle));
        }
        Ok(())
    }

    /// Configure an online license exchange and return the request to send.
    ///
    /// Supersedes any outstanding request of this session. The session is
    /// left untouched when the request cannot be built.
    pub fn set_drm_info(&mut self, info: DrmInfo) -> Result<LicenseRequest> {
        self.configure(self.store.scheme(), info)
    }

    /// Select the scheme of a multi-DRM stream and configure its license.
    pub fn set_multi_drm_info(&mut self, info: MultiDrmInfo) -> Result<LicenseRequest> {
        self.configure(info.scheme, info.drm)
    }

    fn configure(&mut self, scheme: DrmScheme, info: DrmInfo) -> Result<LicenseRequest> {
        self.ensure_open()?;
        if info.request_type.with_bearer() && info.token.is_none() {
            return Err(Error::InvalidConfig(format!(
                "License request type {} needs a bearer token",
                info.request_type
            )));
        }
        let body = self.license_body(scheme, &info, &info.key_ids)?;
        debug!(
            "Session {}: license via {} ({})",
            self.handle, info.license_url, info.request_type
        );

        self.store.set_scheme(scheme);
        self.store.set_pattern(info.pattern);
        self.store.set_mode(None);
        self.requested = info.key_ids.clone();
        self.drm_info = Some(info);
        self.rotation = None;
        self.pending = None;
        self.next_request(body)
    }

    /// Install key material directly; no license exchange takes place.
    pub fn set_offline_drm_info(&mut self, info: &OfflineDrmInfo) -> Result<()> {
        self.ensure_open()?;
        self.generation += 1;
        self.drm_info = None;
        self.requested.clear();
        self.pending = None;
        self.rotation = None;
        self.store.set_mode(Some(CipherMode::from_parts(info.key_type, info.es_type)));
        self.store.set_pattern(info.pattern);
        self.store.install(KeyMaterial::new(
            info.key_type,
            info.key_id,
            info.key.clone(),
            Some(info.iv),
        ));
        self.state = SessionState::KeyInstalled;
        debug!(
            "Session {}: offline {:?}/{:?} key installed",
            self.handle, info.key_type, info.es_type
        );
        Ok(())
    }

    /// Re-run the license exchange for the configured DRM info.
    ///
    /// Returns `None` for offline sessions; they wait in `KeyPending` for
    /// new offline key material.
    pub fn update_drm_info(&mut self) -> Result<Option<LicenseRequest>> {
        self.ensure_open()?;
        let Some(info) = self.drm_info.as_ref() else {
            self.generation += 1;
            self.state = SessionState::KeyPending;
            return Ok(None);
        };
        let key_ids = match self.rotation.filter(|kid| !kid.is_nil()) {
            Some(kid) => vec![kid],
            None => self.requested.clone(),
        };
        let body = self.license_body(self.store.scheme(), info, &key_ids)?;
        self.requested = key_ids;
        self.next_request(body).map(Some)
    }

    fn license_body(&self, scheme: DrmScheme, info: &DrmInfo, key_ids: &[Uuid]) -> Result<Vec<u8>> {
        self.engine.license_request(&LicenseContext {
            scheme,
            key_ids,
            init_data: info.init_data.as_deref(),
        })
    }

    fn next_request(&mut self, body: Vec<u8>) -> Result<LicenseRequest> {
        let info = self
            .drm_info
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("No DRM info configured".to_string()))?;
        self.generation += 1;
        self.state = SessionState::KeyPending;
        Ok(LicenseRequest {
            handle: self.handle,
            generation: self.generation,
            request_type: info.request_type,
            url: info.license_url.clone(),
            body,
            token: info.token.clone(),
        })
    }

    /// Take the request parked by an automatic key rotation.
    pub fn take_pending_request(&mut self) -> Option<LicenseRequest> {
        self.pending.take()
    }

    /// Install the key carried by a license response for `generation`.
    pub fn process_license_response(
        &mut self,
        generation: u64,
        response: &[u8],
    ) -> Result<LicenseOutcome> {
        if self.state != SessionState::KeyPending || generation != self.generation {
            debug!(
                "Session {}: dropping stale license response (generation {}, current {})",
                self.handle, generation, self.generation
            );
            return Ok(LicenseOutcome::Stale);
        }

        let info = self
            .drm_info
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("No DRM info configured".to_string()))?;
        let keys = self.engine.process_license_response(
            &LicenseContext {
                scheme: self.store.scheme(),
                key_ids: &self.requested,
                init_data: info.init_data.as_deref(),
            },
            response,
        )?;

        let mut keys = keys;
        if keys.is_empty() {
            return Err(Error::InvalidLicenseMessage(
                "License carries no content key".to_string(),
            ));
        }
        let index = match self.rotation {
            Some(kid) => keys
                .iter()
                .position(|key| key.key_id == Some(kid))
                .ok_or_else(|| {
                    Error::InvalidLicenseMessage(format!("License lacks rotated key {}", kid))
                })?,
            None => self
                .requested
                .first()
                .and_then(|kid| keys.iter().position(|key| key.key_id == Some(*kid)))
                .unwrap_or(0),
        };
        let key = keys.swap_remove(index);

        let key_id = key.key_id;
        self.store.install(key);
        self.rotation = None;
        self.pending = None;
        self.last_license_status = None;
        self.state = SessionState::KeyInstalled;
        info!(
            "Session {}: license installed key {}",
            self.handle,
            key_id.map(|kid| kid.to_string()).unwrap_or_else(|| "-".to_string())
        );
        Ok(LicenseOutcome::Installed { key_id })
    }

    /// Record a failed license exchange for `generation`.
    pub fn record_license_failure(&mut self, generation: u64, status: Option<u16>) {
        if generation != self.generation {
            return;
        }
        warn!(
            "Session {}: license exchange failed with status {:?}",
            self.handle, status
        );
        self.last_license_status = status;
    }

    /// Decode the inline encryption header of an access unit.
    pub fn parse<'a>(&self, raw: &'a [u8]) -> Result<AccessUnit<'a>> {
        self.ensure_open()?;
        let ctx = ParseContext {
            scheme: self.store.scheme(),
            constant_iv: self.store.constant_iv(),
        };
        let mut unit = parse_unit(raw, &ctx)?;
        if unit.info.is_encrypted() && unit.info.pattern.is_none() {
            unit.info.pattern = self.store.pattern();
        }
        Ok(unit)
    }

    /// Decrypt one sample into `output`, returning the bytes written.
    ///
    /// Returns [`Error::NoKeyAvailable`] when the sample needs a key other
    /// than the active one. The session has then already started a new
    /// license exchange; retry the same call once it completes.
    pub fn decrypt(&mut self, info: &CryptoInfo, input: &[u8], output: &mut [u8]) -> Result<usize> {
        match self.state {
            SessionState::Closed => return Err(Error::InvalidSession(self.handle)),
            SessionState::KeyPending => {
                if let Some(kid) = self.rotation {
                    return Err(Error::NoKeyAvailable(kid));
                }
                return Err(self.not_ready());
            }
            SessionState::Opened => return Err(self.not_ready()),
            SessionState::KeyInstalled | SessionState::Decrypting => {}
        }

        let active = self.store.active().ok_or_else(|| self.not_ready())?;
        if info.is_encrypted() {
            if !active.matches(&info.key_id) {
                return Err(self.start_rotation(info.key_id));
            }
            if let Some(expected) = self.store.mode() {
                if expected != info.mode {
                    return Err(Error::CipherFailure(format!(
                        "sample signals {} but the session key is for {}",
                        info.mode, expected
                    )));
                }
            }
            if info.mode.key_type() != Some(active.key_type) {
                return Err(Error::CipherFailure(format!(
                    "sample signals {} but the session key is {:?}",
                    info.mode, active.key_type
                )));
            }
        }

        let key = SampleKey {
            key: active.key(),
            boundary: self.store.scheme().cbc_boundary(),
        };
        let written = decrypt_sample(info, key, input, output)?;
        self.state = SessionState::Decrypting;
        Ok(written)
    }

    fn not_ready(&self) -> Error {
        Error::InvalidState {
            expected: "KeyInstalled",
            actual: self.state,
        }
    }

    fn start_rotation(&mut self, kid: Uuid) -> Error {
        info!("Session {}: key rotation to {}", self.handle, kid);
        self.rotation = Some(kid);
        match self.update_drm_info() {
            Ok(request) => {
                self.pending = request;
                Error::NoKeyAvailable(kid)
            }
            Err(e) => {
                error!("Session {}: cannot request rotated key: {}", self.handle, e);
                self.state = SessionState::KeyPending;
                e
            }
        }
    }

    /// Release key material and invalidate outstanding requests.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.store.clear();
        self.drm_info = None;
        self.requested.clear();
        self.pending = None;
        self.rotation = None;
        self.generation += 1;
        self.state = SessionState::Closed;
        debug!("Session {} closed", self.handle);
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    use super::*;
    use crate::clearkey::ClearKeyEngine;
    use crate::decrypt::encrypt_sample;
    use crate::scheme::CbcBoundary;

    const KID_A: Uuid = Uuid::from_u128(0xa);
    const KID_B: Uuid = Uuid::from_u128(0xb);
    const IV: [u8; 16] = [0x42; 16];

    fn session() -> DrmSession {
        DrmSession::new(
            SessionHandle(1),
            DrmScheme::ClearKey,
            Arc::new(ClearKeyEngine::new()),
        )
    }

    fn license(kid: Uuid, key: [u8; 16]) -> Vec<u8> {
        serde_json::json!({
            "keys": [{
                "kty": "oct",
                "kid": URL_SAFE_NO_PAD.encode(kid.as_bytes()),
                "k": URL_SAFE_NO_PAD.encode(key),
            }]
        })
        .to_string()
        .into_bytes()
    }

    fn protect(kid: Uuid, key: &[u8; 16], plain: &[u8]) -> (CryptoInfo, Vec<u8>) {
        let info = CryptoInfo::encrypted(plain.len(), CipherMode::AesCtr, kid, IV);
        let mut out = vec![0u8; plain.len()];
        let sample_key = SampleKey {
            key,
            boundary: CbcBoundary::Subsample,
        };
        encrypt_sample(&info, sample_key, plain, &mut out).unwrap();
        (info, out)
    }

    fn online(session: &mut DrmSession, kid: Uuid, key: [u8; 16]) {
        let info = DrmInfo::new("https://license.example", LicenseRequestType::Post)
            .with_key_ids([kid]);
        let request = session.set_drm_info(info).unwrap();
        assert_eq!(session.state(), SessionState::KeyPending);
        let outcome = session
            .process_license_response(request.generation, &license(kid, key))
            .unwrap();
        assert_eq!(outcome, LicenseOutcome::Installed { key_id: Some(kid) });
    }

    #[test]
    fn decrypt_before_key_is_invalid_state() {
        let mut session = session();
        let info = CryptoInfo::unencrypted(4);
        let err = session.decrypt(&info, &[0; 4], &mut [0; 4]).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                actual: SessionState::Opened,
                ..
            }
        ));

        let drm = DrmInfo::new("https://license.example", LicenseRequestType::Post)
            .with_key_ids([KID_A]);
        session.set_drm_info(drm).unwrap();
        let err = session.decrypt(&info, &[0; 4], &mut [0; 4]).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn offline_key_decrypts_the_example_sample() {
        let key = [0x13u8; 16];
        let plain: Vec<u8> = (0..160u8).collect();
        let info = CryptoInfo::encrypted(160, CipherMode::AesCtr, Uuid::nil(), IV)
            .with_runs(&[4], &[156])
            .unwrap();
        let mut protected = vec![0u8; 160];
        let sample_key = SampleKey {
            key: &key,
            boundary: CbcBoundary::Subsample,
        };
        encrypt_sample(&info, sample_key, &plain, &mut protected).unwrap();

        let mut session = session();
        session
            .set_offline_drm_info(&OfflineDrmInfo::new(
                KeyType::Aes128,
                EsType::Ctr,
                key.to_vec(),
                IV,
            ))
            .unwrap();
        assert_eq!(session.state(), SessionState::KeyInstalled);

        let mut out = vec![0u8; 160];
        assert_eq!(session.decrypt(&info, &protected, &mut out).unwrap(), 160);
        assert_eq!(out, plain);
        assert_eq!(session.state(), SessionState::Decrypting);
    }

    #[test]
    fn rotation_parks_a_request_and_recovers() {
        let key_a = [1u8; 16];
        let key_b = [2u8; 16];
        let mut session = session();
        online(&mut session, KID_A, key_a);

        let plain = [9u8; 48];
        let (info, protected) = protect(KID_B, &key_b, &plain);
        let mut out = [0u8; 48];

        let err = session.decrypt(&info, &protected, &mut out).unwrap_err();
        assert!(matches!(err, Error::NoKeyAvailable(kid) if kid == KID_B));
        assert_eq!(session.state(), SessionState::KeyPending);

        // Still pending until the rotated key arrives.
        let err = session.decrypt(&info, &protected, &mut out).unwrap_err();
        assert!(err.is_key_rotation());

        let request = session.take_pending_request().unwrap();
        assert!(session.take_pending_request().is_none());
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["kids"][0], URL_SAFE_NO_PAD.encode(KID_B.as_bytes()));

        session
            .process_license_response(request.generation, &license(KID_B, key_b))
            .unwrap();
        assert_eq!(session.decrypt(&info, &protected, &mut out).unwrap(), 48);
        assert_eq!(out, plain);
        assert_eq!(session.active_key_id(), Some(KID_B));
    }

    #[test]
    fn rotation_rejects_license_without_the_rotated_key() {
        let mut session = session();
        online(&mut session, KID_A, [1; 16]);

        let (info, protected) = protect(KID_B, &[2; 16], &[4u8; 32]);
        let mut out = [0u8; 32];
        assert!(session.decrypt(&info, &protected, &mut out).is_err());
        let request = session.take_pending_request().unwrap();

        let err = session
            .process_license_response(request.generation, &license(Uuid::from_u128(0xc), [3; 16]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLicenseMessage(_)));
        assert_eq!(session.active_key_id(), Some(KID_A));
        assert_eq!(session.state(), SessionState::KeyPending);

        session
            .process_license_response(request.generation, &license(KID_B, [2; 16]))
            .unwrap();
        assert_eq!(session.active_key_id(), Some(KID_B));
    }

    #[test]
    fn rejected_drm_info_leaves_offline_key_untouched() {
        let mut session = session();
        session
            .set_offline_drm_info(&OfflineDrmInfo::new(
                KeyType::Aes128,
                EsType::Cbc,
                vec![3; 16],
                IV,
            ))
            .unwrap();
        let generation = session.generation();

        let mut drm = DrmInfo::new("https://license.example", LicenseRequestType::Post);
        drm.pattern = Some(Pattern::new(1, 9));
        assert!(matches!(session.set_drm_info(drm), Err(Error::InvalidConfig(_))));
        assert_eq!(session.state(), SessionState::KeyInstalled);
        assert_eq!(session.generation(), generation);

        let info = CryptoInfo::encrypted(16, CipherMode::AesCtr, Uuid::nil(), IV);
        let err = session.decrypt(&info, &[0; 16], &mut [0; 16]).unwrap_err();
        assert!(matches!(err, Error::CipherFailure(_)));
    }

    #[test]
    fn superseded_response_is_stale() {
        let mut session = session();
        let drm = DrmInfo::new("https://license.example", LicenseRequestType::Post)
            .with_key_ids([KID_A]);
        let first = session.set_drm_info(drm.clone()).unwrap();
        let second = session.set_drm_info(drm).unwrap();

        let outcome = session
            .process_license_response(first.generation, &license(KID_A, [1; 16]))
            .unwrap();
        assert_eq!(outcome, LicenseOutcome::Stale);
        assert_eq!(session.state(), SessionState::KeyPending);

        let outcome = session
            .process_license_response(second.generation, &license(KID_A, [1; 16]))
            .unwrap();
        assert!(matches!(outcome, LicenseOutcome::Installed { .. }));
    }

    #[test]
    fn bearer_request_type_needs_token() {
        let mut session = session();
        let drm = DrmInfo::new("https://license.example", LicenseRequestType::PostWithJwt)
            .with_key_ids([KID_A]);
        assert!(matches!(
            session.set_drm_info(drm.clone()),
            Err(Error::InvalidConfig(_))
        ));
        let request = session.set_drm_info(drm.with_token("jwt")).unwrap();
        assert_eq!(request.token.as_deref(), Some("jwt"));
    }

    #[test]
    fn offline_mode_mismatch_is_a_cipher_failure() {
        let mut session = session();
        session
            .set_offline_drm_info(&OfflineDrmInfo::new(
                KeyType::Sm4,
                EsType::Cbc,
                vec![3; 16],
                IV,
            ))
            .unwrap();
        let info = CryptoInfo::encrypted(16, CipherMode::AesCtr, Uuid::nil(), IV);
        let err = session.decrypt(&info, &[0; 16], &mut [0; 16]).unwrap_err();
        assert!(matches!(err, Error::CipherFailure(_)));
        assert_eq!(session.state(), SessionState::KeyInstalled);
    }

    #[test]
    fn close_clears_keys_and_rejects_calls() {
        let mut session = session();
        online(&mut session, KID_A, [5; 16]);
        let generation = session.generation();
        session.close();
        session.close();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.active_key_id().is_none());
        assert!(session.generation() > generation);
        let err = session
            .decrypt(&CryptoInfo::unencrypted(1), &[0], &mut [0])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSession(SessionHandle(1))));
        assert!(matches!(session.parse(&[0, 0]), Err(Error::InvalidSession(_))));
    }

    #[test]
    fn parse_uses_the_offline_constant_iv() {
        let mut session = session();
        session
            .set_offline_drm_info(&OfflineDrmInfo::new(
                KeyType::Aes128,
                EsType::Ctr,
                vec![3; 16],
                IV,
            ))
            .unwrap();
        let mut raw = vec![crate::crypto_info::FLAG_ENCRYPTED, CipherMode::AesCtr as u8];
        raw.extend_from_slice(KID_A.as_bytes());
        raw.extend_from_slice(&[7u8; 20]);

        let unit = session.parse(&raw).unwrap();
        assert_eq!(unit.info.iv, IV);
        assert_eq!(unit.payload.len(), 20);
    }
}
