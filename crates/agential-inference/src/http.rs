//! HTTP helpers shared by the provider backends.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use agential_core::{Error, Result};

/// Build a client with an overall request timeout.
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Inference(format!("Failed to create HTTP client: {}", e)))
}

/// Whether a probe response proves the service is up.
///
/// 400 and 404 mean the server answered but disliked the synthetic request
/// (unknown model, missing route prefix), which is enough for liveness.
pub fn service_answered(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::OK | StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND
    )
}

/// Map a non-2xx response to an inference error that names the endpoint.
pub(crate) async fn ensure_success(identity: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Inference(format!(
        "{} returned {}: {}",
        identity,
        status,
        truncate(&body, 200)
    )))
}

/// Map a transport error, keeping timeouts distinguishable.
pub(crate) fn transport_error(identity: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{} request timed out: {}", identity, e))
    } else {
        Error::Inference(format!("{} request failed: {}", identity, e))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
