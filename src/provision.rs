//! Device provisioning handshake.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::manager::DrmSessionManager;
use crate::session::SessionHandle;
use crate::transport::{HttpRequest, HttpTransport};

/// Runs the one-shot provisioning exchange against a provisioning server.
#[derive(Clone)]
pub struct ProvisioningClient {
    transport: Arc<dyn HttpTransport>,
    url: String,
    timeout: Option<Duration>,
}

impl fmt::Debug for ProvisioningClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningClient")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ProvisioningClient {
    pub fn new(transport: Arc<dyn HttpTransport>, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Provision the manager's device through a transient session.
    ///
    /// The transient session is closed whatever the outcome.
    pub fn provision(&self, manager: &DrmSessionManager) -> Result<()> {
        let handle = manager.open_transient_session()?;
        let result = self.exchange(manager, handle);
        manager.close(handle);
        result
    }

    fn exchange(&self, manager: &DrmSessionManager, handle: SessionHandle) -> Result<()> {
        let request = manager.provision_request(handle)?;
        debug!(
            "Sending provisioning request to {} ({} bytes)",
            self.url,
            request.len()
        );

        let http = HttpRequest::post(&self.url, &request)
            .header("Content-Type", "application/octet-stream")
            .timeout(self.timeout);
        match self.transport.request(&http) {
            Ok(response) => {
                manager.process_provision_response(handle, Some(response.status), &response.body)
            }
            Err(Error::Transport { message, timeout }) => {
                warn!(
                    "Provisioning request failed (timeout: {}): {}",
                    timeout, message
                );
                manager.process_provision_response(handle, None, &[])
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use uuid::Uuid;

    use super::*;
    use crate::clearkey::ClearKeyEngine;
    use crate::config::DrmConfig;
    use crate::engine::{CdmEngine, LicenseContext};
    use crate::error::ProvisioningFailure;
    use crate::key::KeyMaterial;
    use crate::scheme::{EsType, KeyType};
    use crate::session::OfflineDrmInfo;
    use crate::transport::HttpResponse;

    /// ClearKey licensing behind a device that wants provisioning once.
    #[derive(Debug, Default)]
    struct ProvisionedEngine {
        provisioned: AtomicBool,
        responses: AtomicUsize,
    }

    impl CdmEngine for ProvisionedEngine {
        fn provision_request(&self) -> Result<Option<Vec<u8>>> {
            if self.provisioned.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(b"provision-me".to_vec()))
        }

        fn process_provision_response(&self, response: &[u8]) -> Result<()> {
            self.responses.fetch_add(1, Ordering::SeqCst);
            if response != b"certificate" {
                return Err(Error::InvalidLicenseMessage("bad certificate".to_string()));
            }
            self.provisioned.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn license_request(&self, ctx: &LicenseContext<'_>) -> Result<Vec<u8>> {
            ClearKeyEngine::new().license_request(ctx)
        }

        fn process_license_response(
            &self,
            ctx: &LicenseContext<'_>,
            response: &[u8],
        ) -> Result<Vec<KeyMaterial>> {
            ClearKeyEngine::new().process_license_response(ctx, response)
        }
    }

    struct Server {
        status: u16,
        fail: bool,
    }

    impl HttpTransport for Server {
        fn request(&self, request: &HttpRequest<'_>) -> Result<HttpResponse> {
            assert_eq!(request.body, Some(&b"provision-me"[..]));
            if self.fail {
                return Err(Error::timeout("connect timed out"));
            }
            Ok(HttpResponse {
                status: self.status,
                body: b"certificate".to_vec(),
            })
        }
    }

    fn setup() -> (Arc<ProvisionedEngine>, DrmSessionManager) {
        let engine = Arc::new(ProvisionedEngine::default());
        let manager = DrmSessionManager::new(engine.clone(), DrmConfig::default());
        (engine, manager)
    }

    fn client(status: u16, fail: bool) -> ProvisioningClient {
        ProvisioningClient::new(
            Arc::new(Server { status, fail }),
            "https://provision.example",
        )
    }

    #[test]
    fn successful_handshake_closes_transient_session() {
        let (engine, manager) = setup();
        manager.start_drm(&client(200, false)).unwrap();

        assert!(engine.provisioned.load(Ordering::SeqCst));
        assert_eq!(manager.session_count(), 0);
        assert!(manager.open().is_ok());
    }

    #[test]
    fn failure_blocks_playback_until_retry_succeeds() {
        let (_, manager) = setup();
        let err = manager.start_drm(&client(500, false)).unwrap_err();
        assert!(matches!(
            err,
            Error::ProvisioningFailed(ProvisioningFailure::Http(Some(500)))
        ));
        assert_eq!(manager.session_count(), 0);
        assert!(matches!(manager.open(), Err(Error::InitFailed(_))));

        manager.start_drm(&client(200, false)).unwrap();
        assert!(manager.open().is_ok());
    }

    #[test]
    fn timeout_is_provisioning_failure_without_status() {
        let (engine, manager) = setup();
        let err = manager.start_drm(&client(200, true)).unwrap_err();
        assert!(matches!(
            err,
            Error::ProvisioningFailed(ProvisioningFailure::Http(None))
        ));
        assert_eq!(engine.responses.load(Ordering::SeqCst), 0);
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn already_provisioned_device_succeeds() {
        let manager = DrmSessionManager::new(Arc::new(ClearKeyEngine::new()), DrmConfig::default());
        let client = ProvisioningClient::new(
            Arc::new(Server {
                status: 200,
                fail: false,
            }),
            "https://provision.example",
        );
        // The server is never contacted: ClearKey has nothing to provision.
        manager.start_drm(&client).unwrap();
        assert!(!manager.provisioning_failed());
    }

    #[test]
    fn provisioning_at_the_session_limit() {
        let engine = Arc::new(ProvisionedEngine::default());
        let config = DrmConfig {
            max_sessions: 1,
            ..Default::default()
        };
        let manager = DrmSessionManager::new(engine.clone(), config);

        let handle = manager.open().unwrap();
        manager.start_drm(&client(200, false)).unwrap();
        assert!(engine.provisioned.load(Ordering::SeqCst));
        manager.start_drm(&client(200, false)).unwrap();
        assert!(!manager.provisioning_failed());
        assert_eq!(manager.session_count(), 1);

        manager.close(handle);
        assert!(manager.open().is_ok());
    }

    #[test]
    fn repeating_provisioning_keeps_open_sessions_intact() {
        let (_, manager) = setup();
        manager.start_drm(&client(200, false)).unwrap();

        let kid = Uuid::from_u128(0x77);
        let handle = manager.open().unwrap();
        manager
            .set_offline_drm_info(
                handle,
                &OfflineDrmInfo::new(KeyType::Aes128, EsType::Ctr, vec![0x66; 16], [1; 16])
                    .with_key_id(kid),
            )
            .unwrap();

        manager.start_drm(&client(200, false)).unwrap();
        let _ = manager.start_drm(&client(503, false));

        assert!(manager.is_open(handle));
        assert_eq!(
            manager.state(handle).unwrap(),
            crate::session::SessionState::KeyInstalled
        );
        assert_eq!(manager.session_count(), 1);
    }
}
