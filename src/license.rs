//! License acquisition over HTTP.
//!
//! Sessions hand out [`LicenseRequest`]s; a [`LicenseClient`] sends them and
//! feeds the answer back to the manager. [`LicenseWorker`] does the same on a
//! background thread so the decode thread never blocks on the network.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::manager::DrmSessionManager;
use crate::session::{LicenseOutcome, SessionHandle};
use crate::transport::{HttpRequest, HttpTransport};

/// Content type of POSTed license challenges.
pub const LICENSE_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

/// How a license request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LicenseRequestType {
    /// GET with a bearer token.
    GetWithJwt,
    /// POST with a bearer token.
    PostWithJwt,
    /// POST without authorization.
    Post,
}

impl LicenseRequestType {
    pub fn is_post(self) -> bool {
        !matches!(self, LicenseRequestType::GetWithJwt)
    }

    /// Whether the request carries `Authorization: Bearer`.
    pub fn with_bearer(self) -> bool {
        !matches!(self, LicenseRequestType::Post)
    }
}

impl fmt::Display for LicenseRequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LicenseRequestType::GetWithJwt => "get-with-jwt",
            LicenseRequestType::PostWithJwt => "post-with-jwt",
            LicenseRequestType::Post => "post",
        };
        f.write_str(name)
    }
}

impl FromStr for LicenseRequestType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "get-with-jwt" => Ok(LicenseRequestType::GetWithJwt),
            "post-with-jwt" => Ok(LicenseRequestType::PostWithJwt),
            "post" => Ok(LicenseRequestType::Post),
            _ => Err(Error::InvalidConfig(format!(
                "Unknown license request type '{}'",
                s
            ))),
        }
    }
}

/// A license exchange some session is waiting for.
#[derive(Clone)]
pub struct LicenseRequest {
    pub handle: SessionHandle,
    /// Session generation the request was issued for.
    pub generation: u64,
    pub request_type: LicenseRequestType,
    pub url: String,
    pub body: Vec<u8>,
    pub token: Option<String>,
}

impl fmt::Debug for LicenseRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LicenseRequest")
            .field("handle", &self.handle)
            .field("generation", &self.generation)
            .field("request_type", &self.request_type)
            .field("url", &self.url)
            .field("body_len", &self.body.len())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Answer of the license server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Sends license requests. Performs no retries.
#[derive(Clone)]
pub struct LicenseClient {
    transport: Arc<dyn HttpTransport>,
    timeout: Option<Duration>,
}

impl fmt::Debug for LicenseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LicenseClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl LicenseClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            timeout: None,
        }
    }

    /// Per-request timeout overriding the transport's read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Send `request` and return the response if the server answered 200.
    ///
    /// Any other status, a transport failure or a timeout is
    /// [`Error::LicenseFailed`].
    pub fn execute(&self, request: &LicenseRequest) -> Result<LicenseResponse> {
        let mut http = if request.request_type.is_post() {
            HttpRequest::post(&request.url, &request.body)
                .header("Content-Type", LICENSE_CONTENT_TYPE)
        } else {
            HttpRequest::get(&request.url)
        };
        if request.request_type.with_bearer() {
            let token = request.token.as_deref().ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "License request type {} needs a bearer token",
                    request.request_type
                ))
            })?;
            http = http.header("Authorization", format!("Bearer {}", token));
        }
        let http = http.timeout(self.timeout);

        debug!(
            "Session {}: {} license request to {} ({} bytes)",
            request.handle,
            http.method,
            request.url,
            request.body.len()
        );
        let response = match self.transport.request(&http) {
            Ok(response) => response,
            Err(Error::Transport { message, timeout }) => {
                warn!(
                    "Session {}: license request failed (timeout: {}): {}",
                    request.handle, timeout, message
                );
                return Err(Error::LicenseFailed { status: None });
            }
            Err(e) => return Err(e),
        };

        if response.status != 200 {
            warn!(
                "Session {}: license server answered HTTP {}",
                request.handle, response.status
            );
            return Err(Error::LicenseFailed {
                status: Some(response.status),
            });
        }
        Ok(LicenseResponse {
            status: response.status,
            body: response.body,
        })
    }

    /// Run `request` and apply the outcome to its session.
    ///
    /// Failures are recorded on the session before being returned.
    pub fn on_license_request(
        &self,
        manager: &DrmSessionManager,
        request: &LicenseRequest,
    ) -> Result<LicenseOutcome> {
        match self.execute(request) {
            Ok(response) => manager.process_license_response(request, &response),
            Err(e) => {
                manager.record_license_failure(request, e.http_status());
                Err(e)
            }
        }
    }
}

struct Job {
    request: LicenseRequest,
    reply: kanal::Sender<Result<LicenseOutcome>>,
}

/// Runs license exchanges on a dedicated thread.
///
/// Dropping the worker lets queued jobs finish, then joins the thread.
pub struct LicenseWorker {
    jobs: Option<kanal::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for LicenseWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LicenseWorker")
            .field("running", &self.jobs.is_some())
            .finish()
    }
}

impl LicenseWorker {
    /// Start the worker thread.
    pub fn spawn(client: LicenseClient, manager: Arc<DrmSessionManager>) -> Result<Self> {
        let (jobs, queue) = kanal::unbounded::<Job>();
        let thread = std::thread::Builder::new()
            .name("rsdrm-license".to_string())
            .spawn(move || {
                trace!("License worker started");
                while let Ok(job) = queue.recv() {
                    let outcome = client.on_license_request(&manager, &job.request);
                    // The submitter may have stopped waiting.
                    let _ = job.reply.send(outcome);
                }
                trace!("License worker stopped");
            })?;
        Ok(Self {
            jobs: Some(jobs),
            thread: Some(thread),
        })
    }

    /// Queue `request`; the outcome arrives on the returned channel.
    pub fn submit(&self, request: LicenseRequest) -> Result<kanal::Receiver<Result<LicenseOutcome>>> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| Error::transport("license worker is stopped"))?;
        let (reply, outcome) = kanal::bounded(1);
        jobs.send(Job { request, reply })
            .map_err(|_| Error::transport("license worker is stopped"))?;
        Ok(outcome)
    }

    /// Queue `request` and block until its outcome is known.
    pub fn run(&self, request: LicenseRequest) -> Result<LicenseOutcome> {
        self.submit(request)?
            .recv()
            .map_err(|_| Error::transport("license worker dropped the request"))?
    }
}

impl Drop for LicenseWorker {
    fn drop(&mut self) {
        drop(self.jobs.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("License worker thread panicked");
            }
        }
    }
}
