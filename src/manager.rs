//! Session manager: handle allocation, provisioning state and dispatch.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::DrmConfig;
use crate::crypto_info::{AccessUnit, CryptoInfo};
use crate::engine::CdmEngine;
use crate::error::{Error, ProvisioningFailure, Result};
use crate::license::{LicenseRequest, LicenseResponse};
use crate::provision::ProvisioningClient;
use crate::session::{
    DrmInfo, DrmSession, LicenseOutcome, MultiDrmInfo, OfflineDrmInfo, SessionHandle,
    SessionState,
};

type SharedSession = Arc<Mutex<DrmSession>>;

/// Owns all DRM sessions of one player instance.
///
/// Sessions can be used from different threads at the same time; a single
/// session must not be decrypted on from two threads at once.
pub struct DrmSessionManager {
    engine: Arc<dyn CdmEngine>,
    config: DrmConfig,
    sessions: RwLock<HashMap<SessionHandle, SharedSession>>,
    next_handle: AtomicU32,
    provisioning_failed: AtomicBool,
}

impl fmt::Debug for DrmSessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrmSessionManager")
            .field("engine", &self.engine)
            .field("scheme", &self.config.scheme)
            .field("sessions", &self.session_count())
            .field("provisioning_failed", &self.provisioning_failed())
            .finish()
    }
}

impl DrmSessionManager {
    pub fn new(engine: Arc<dyn CdmEngine>, config: DrmConfig) -> Self {
        Self {
            engine,
            config,
            sessions: RwLock::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            provisioning_failed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DrmConfig {
        &self.config
    }

    /// True while the last provisioning attempt failed.
    pub fn provisioning_failed(&self) -> bool {
        self.provisioning_failed.load(Ordering::Acquire)
    }

    /// Open a new playback session.
    ///
    /// Fails with `InitFailed` while provisioning is failed and with
    /// `TooManySessions` once `max_sessions` sessions are open.
    pub fn open(&self) -> Result<SessionHandle> {
        if self.provisioning_failed() {
            return Err(Error::InitFailed(
                "device provisioning failed, playback is blocked".to_string(),
            ));
        }
        self.insert_session(true)
    }

    /// Open the short-lived session used by the provisioning handshake.
    ///
    /// It does not count toward `max_sessions`.
    pub(crate) fn open_transient_session(&self) -> Result<SessionHandle> {
        self.insert_session(false)
    }

    fn insert_session(&self, limited: bool) -> Result<SessionHandle> {
        let mut sessions = self.sessions.write();
        if limited && sessions.len() >= self.config.max_sessions {
            return Err(Error::TooManySessions {
                max: self.config.max_sessions,
            });
        }
        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let session = DrmSession::new(handle, self.config.scheme, self.engine.clone());
        sessions.insert(handle, Arc::new(Mutex::new(session)));
        debug!("Opened session {} ({} open)", handle, sessions.len());
        Ok(handle)
    }

    /// Close a session. Closing an unknown or closed handle does nothing.
    pub fn close(&self, handle: SessionHandle) {
        let removed = self.sessions.write().remove(&handle);
        if let Some(session) = removed {
            session.lock().close();
        }
    }

    pub fn is_open(&self, handle: SessionHandle) -> bool {
        self.sessions.read().contains_key(&handle)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn session(&self, handle: SessionHandle) -> Result<SharedSession> {
        self.sessions
            .read()
            .get(&handle)
            .cloned()
            .ok_or(Error::InvalidSession(handle))
    }

    pub fn state(&self, handle: SessionHandle) -> Result<SessionState> {
        Ok(self.session(handle)?.lock().state())
    }

    /// Run the provisioning handshake.
    ///
    /// An already provisioned device counts as success. Any other failure
    /// blocks [`open`](Self::open) until a later call succeeds.
    pub fn start_drm(&self, client: &ProvisioningClient) -> Result<()> {
        match client.provision(self) {
            Ok(()) => {
                info!("Device provisioned");
                self.provisioning_failed.store(false, Ordering::Release);
                Ok(())
            }
            Err(Error::ProvisioningFailed(ProvisioningFailure::NoRequest)) => {
                debug!("Device already provisioned");
                self.provisioning_failed.store(false, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                error!("Provisioning failed: {}", e);
                self.provisioning_failed.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Provisioning payload for `handle`'s device.
    pub fn provision_request(&self, handle: SessionHandle) -> Result<Vec<u8>> {
        self.session(handle)?;
        self.engine
            .provision_request()?
            .ok_or(Error::ProvisioningFailed(ProvisioningFailure::NoRequest))
    }

    /// Finalize provisioning. `status` is `None` when no response arrived.
    pub fn process_provision_response(
        &self,
        handle: SessionHandle,
        status: Option<u16>,
        response: &[u8],
    ) -> Result<()> {
        self.session(handle)?;
        match status {
            Some(code) if (200..300).contains(&code) => {}
            _ => {
                warn!("Provisioning server answered {:?}", status);
                return Err(Error::ProvisioningFailed(ProvisioningFailure::Http(status)));
            }
        }
        self.engine.process_provision_response(response)
    }

    pub fn set_drm_info(&self, handle: SessionHandle, info: DrmInfo) -> Result<LicenseRequest> {
        self.session(handle)?.lock().set_drm_info(info)
    }

    pub fn set_multi_drm_info(
        &self,
        handle: SessionHandle,
        info: MultiDrmInfo,
    ) -> Result<LicenseRequest> {
        self.session(handle)?.lock().set_multi_drm_info(info)
    }

    pub fn set_offline_drm_info(&self, handle: SessionHandle, info: &OfflineDrmInfo) -> Result<()> {
        self.session(handle)?.lock().set_offline_drm_info(info)
    }

    pub fn update_drm_info(&self, handle: SessionHandle) -> Result<Option<LicenseRequest>> {
        self.session(handle)?.lock().update_drm_info()
    }

    /// Take the license request parked by an automatic key rotation.
    pub fn take_license_request(&self, handle: SessionHandle) -> Result<Option<LicenseRequest>> {
        Ok(self.session(handle)?.lock().take_pending_request())
    }

    /// Apply a license response to the session that issued `request`.
    ///
    /// Responses for closed sessions or superseded requests are dropped and
    /// reported as [`LicenseOutcome::Stale`].
    pub fn process_license_response(
        &self,
        request: &LicenseRequest,
        response: &LicenseResponse,
    ) -> Result<LicenseOutcome> {
        if response.status != 200 {
            self.record_license_failure(request, Some(response.status));
            return Err(Error::LicenseFailed {
                status: Some(response.status),
            });
        }
        let Ok(session) = self.session(request.handle) else {
            debug!("Dropping license response for closed session {}", request.handle);
            return Ok(LicenseOutcome::Stale);
        };
        let outcome = session
            .lock()
            .process_license_response(request.generation, &response.body);
        outcome
    }

    pub fn record_license_failure(&self, request: &LicenseRequest, status: Option<u16>) {
        if let Ok(session) = self.session(request.handle) {
            session
                .lock()
                .record_license_failure(request.generation, status);
        }
    }

    pub fn parse<'a>(&self, handle: SessionHandle, raw: &'a [u8]) -> Result<AccessUnit<'a>> {
        self.session(handle)?.lock().parse(raw)
    }

    /// Decrypt one sample. See [`DrmSession::decrypt`].
    pub fn decrypt(
        &self,
        handle: SessionHandle,
        info: &CryptoInfo,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize> {
        let session = self.session(handle)?;
        let mut session = session.lock();
        session.decrypt(info, input, output)
    }
}
