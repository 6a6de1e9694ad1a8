//! Peer RPC client: JSON over HTTP with bearer auth, retried with
//! exponential backoff up to the caller's deadline.

use magpie_core::{Librarian, MagpieError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::wire::{
    ApiResponse, CommitResponse, PrepareRequest, PrepareResponse, RequestCopyRequest,
    RequestCopyResponse, StagedResponse, StatusDirection, StatusRequest, StatusResponse,
    TransferRef, VerifyRequest, VerifyResponse,
};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Delay before retry number `attempt` (0-based): doubling from the base,
/// capped.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.min(16);
    BACKOFF_BASE
        .saturating_mul(1u32 << exp)
        .min(BACKOFF_CAP)
}

/// Retry `op` on transient errors until it succeeds, fails permanently, or
/// the next retry would overrun the deadline.
pub async fn with_backoff<T, F, Fut>(deadline: Instant, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                let delay = backoff_delay(attempt);
                let jitter = Duration::from_millis(rand::random::<u64>() % 100);
                if Instant::now() + delay + jitter >= deadline {
                    return Err(e);
                }
                debug!(attempt, ?delay, error = %e, "retrying after transient error");
                tokio::time::sleep(delay + jitter).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One peer librarian's RPC surface.
#[derive(Clone)]
pub struct PeerClient {
    name: String,
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl PeerClient {
    pub fn new(librarian: &Librarian) -> Self {
        Self {
            name: librarian.name.clone(),
            base_url: librarian.url.trim_end_matches('/').to_string(),
            token: librarian.auth_token.clone(),
            client: reqwest::Client::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .map_err(|e| map_transport_error(&self.name, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(MagpieError::Rejected(format!(
                "{} refused credentials ({status})",
                self.name
            )));
        }
        if status.is_server_error() {
            return Err(MagpieError::Unreachable(format!(
                "{} answered {status} for {path}",
                self.name
            )));
        }

        let envelope: ApiResponse<Resp> = response
            .json()
            .await
            .map_err(|e| MagpieError::Protocol(format!("{}: malformed response: {e}", self.name)))?;

        if !envelope.success {
            return Err(MagpieError::Rejected(format!(
                "{}: {}",
                self.name,
                envelope.error.unwrap_or_else(|| "unspecified refusal".to_string())
            )));
        }

        envelope.data.ok_or_else(|| {
            MagpieError::Protocol(format!("{}: success response without data", self.name))
        })
    }

    /// Idempotent by (authenticated caller, `origin_transfer_id`).
    pub async fn prepare_transfer(&self, request: &PrepareRequest) -> Result<PrepareResponse> {
        self.post("/clone/prepare", request).await
    }

    pub async fn staged_transfer(&self, remote_id: i64) -> Result<StagedResponse> {
        self.post("/clone/staged", &TransferRef { remote_id }).await
    }

    /// Idempotent: re-calling after the peer committed returns the same
    /// remote instance claim.
    pub async fn commit_transfer(&self, remote_id: i64) -> Result<CommitResponse> {
        self.post("/clone/commit", &TransferRef { remote_id }).await
    }

    pub async fn transfer_status(
        &self,
        direction: StatusDirection,
        id: i64,
    ) -> Result<StatusResponse> {
        self.post("/clone/status", &StatusRequest { direction, id })
            .await
    }

    /// Idempotent: a terminal transfer stays where it is.
    pub async fn cancel_transfer(&self, remote_id: i64) -> Result<StatusResponse> {
        self.post("/clone/cancel", &TransferRef { remote_id }).await
    }

    /// Ask the peer to recompute the on-disk digest of its copy.
    pub async fn verify_checksum(&self, file_name: &str) -> Result<VerifyResponse> {
        self.post(
            "/checksum/verify",
            &VerifyRequest {
                file_name: file_name.to_string(),
            },
        )
        .await
    }

    /// Ask the peer to queue an outbound copy of `file_name` back to us.
    pub async fn request_copy(&self, file_name: &str) -> Result<RequestCopyResponse> {
        self.post(
            "/clone/request",
            &RequestCopyRequest {
                file_name: file_name.to_string(),
            },
        )
        .await
    }

    /// Stream a file's bytes to the receiver's staging endpoint.
    pub async fn upload_bytes(
        &self,
        upload_url: &str,
        reader: magpie_store::ByteReader,
    ) -> Result<()> {
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        let response = self
            .client
            .post(self.url(upload_url))
            .bearer_auth(&self.token)
            .body(body)
            .send()
            .await
            .map_err(|e| map_transport_error(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MagpieError::Rejected(format!(
                "{} refused byte upload ({status})",
                self.name
            )));
        }

        Ok(())
    }
}

fn map_transport_error(peer: &str, e: reqwest::Error) -> MagpieError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        MagpieError::Unreachable(format!("{peer}: {e}"))
    } else if e.is_decode() {
        MagpieError::Protocol(format!("{peer}: {e}"))
    } else {
        MagpieError::Unreachable(format!("{peer}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn backoff_caps_out() {
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn with_backoff_gives_up_at_the_deadline() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let mut calls = 0u32;
        let result: Result<()> = with_backoff(deadline, || {
            calls += 1;
            async { Err(MagpieError::Unreachable("down".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(MagpieError::Unreachable(_))));
        // The first retry delay (500ms) already overruns a 50ms deadline.
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn with_backoff_does_not_retry_permanent_errors() {
        let deadline = Instant::now() + Duration::from_secs(600);
        let mut calls = 0u32;
        let result: Result<()> = with_backoff(deadline, || {
            calls += 1;
            async { Err(MagpieError::Rejected("no".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(MagpieError::Rejected(_))));
        assert_eq!(calls, 1);
    }
}
