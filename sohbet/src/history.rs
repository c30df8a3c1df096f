//! Historical transcript loading over REST.
//!
//! One load per peer selection, single attempt: a failed history fetch is
//! reported to the caller and never retried in the background. Retrying is
//! the user's call (re-selecting the peer), unlike the live channel, which
//! reconnects on its own.

use sohbet_proto::directory::DirectoryEntry;
use sohbet_proto::message::{MessageRecord, UserId};

use crate::transport::Credential;

/// Errors from the REST collaborators.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The backend could not be reached or answered with a failure status.
    #[error("history service unavailable: {0}")]
    Unavailable(String),

    /// The response arrived but could not be interpreted.
    #[error("malformed history response: {0}")]
    Malformed(String),
}

/// Loads the persisted transcript for one peer.
///
/// The session manager is generic over this trait; tests substitute
/// scripted loaders to exercise slow and failing loads.
pub trait HistoryLoader: Send + Sync + 'static {
    /// Fetch the full transcript between the authenticated user and `peer`,
    /// oldest first, as the backend returns it.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Unavailable`] when the request fails and
    /// [`HistoryError::Malformed`] when the response cannot be decoded.
    /// Exactly one attempt is made per call.
    fn load(
        &self,
        peer: &UserId,
    ) -> impl std::future::Future<Output = Result<Vec<MessageRecord>, HistoryError>> + Send;
}

/// REST client for the chat backend's read-side endpoints.
///
/// Carries the credential as a bearer token on every request; connection
/// pooling is left to [`reqwest`]'s internal pool.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    credential: Credential,
}

impl RestClient {
    /// Creates a client for the given HTTP base URL (e.g. `http://host:8000`).
    pub fn new(base_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential,
        }
    }

    /// List candidate conversation partners from the directory endpoint.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`HistoryLoader::load`]: [`HistoryError::Unavailable`]
    /// for request failures, [`HistoryError::Malformed`] for undecodable
    /// bodies.
    pub async fn list_peers(&self, limit: usize) -> Result<Vec<DirectoryEntry>, HistoryError> {
        let url = format!("{}/users/?limit={limit}", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(self.credential.token())
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "directory request failed");
                HistoryError::Unavailable(e.to_string())
            })?;

        let response = check_status(response)?;
        response
            .json::<Vec<DirectoryEntry>>()
            .await
            .map_err(|e| HistoryError::Malformed(e.to_string()))
    }
}

impl HistoryLoader for RestClient {
    async fn load(&self, peer: &UserId) -> Result<Vec<MessageRecord>, HistoryError> {
        let url = format!("{}/chat/history/{}", self.base_url, peer);
        tracing::debug!(peer = %peer, "loading transcript");

        let response = self
            .http
            .get(&url)
            .bearer_auth(self.credential.token())
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(peer = %peer, err = %e, "history request failed");
                HistoryError::Unavailable(e.to_string())
            })?;

        let response = check_status(response)?;
        response
            .json::<Vec<MessageRecord>>()
            .await
            .map_err(|e| HistoryError::Malformed(e.to_string()))
    }
}

/// Treat any non-success status as the service being unavailable.
fn check_status(response: reqwest::Response) -> Result<reqwest::Response, HistoryError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        tracing::warn!(status = %status, "backend answered with failure status");
        Err(HistoryError::Unavailable(format!("status {status}")))
    }
}
