//! HTTP client for the engine control plane.
//!
//! One pooled `reqwest::Client` owned by the composition root. Domain
//! rejections (HTTP 200 with `status: "error"`) map to [`BatonError`]
//! variants; connection failures and 5xx mean the engine process is down
//! and surface as [`BatonError::EngineUnavailable`].

use crate::api::control::{
    ControlResponse, HealthResponse, LookupResponse, PlayBody, StatusResponse,
};
use crate::engine::{MediaInfo, PlaylistInfo, TranscodeFormat};
use crate::error::{BatonError, BatonResult};
use crate::orchestrator::resolver::SearchCandidate;
use crate::protocol_constants::SERVICE_ID;

/// Control-plane client bound to one engine base URL.
#[derive(Clone)]
pub struct EngineClient {
    http: reqwest::Client,
    base_url: String,
}

impl EngineClient {
    /// Creates a client for `http://host:port`.
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { http, base_url }
    }

    /// Starts playback for an engine session id.
    pub async fn play(
        &self,
        session_id: &str,
        url: &str,
        format: TranscodeFormat,
        start_at_secs: f64,
        duration_hint_secs: Option<f64>,
    ) -> BatonResult<()> {
        let body = PlayBody {
            url: url.to_string(),
            format,
            start_at: start_at_secs,
            duration: duration_hint_secs,
        };
        let response: ControlResponse = self
            .post_json(&format!("/session/{session_id}/play"), &body)
            .await?;
        self.domain_check(response)
    }

    /// Stops a session; ok regardless of state.
    pub async fn stop(&self, session_id: &str) -> BatonResult<()> {
        let response: ControlResponse = self
            .post_json(&format!("/session/{session_id}/stop"), &())
            .await?;
        self.domain_check(response)
    }

    /// Closes the session's pause gate.
    pub async fn pause(&self, session_id: &str) -> BatonResult<()> {
        let response: ControlResponse = self
            .post_json(&format!("/session/{session_id}/pause"), &())
            .await?;
        self.domain_check(response)
    }

    /// Reopens the session's pause gate.
    pub async fn resume(&self, session_id: &str) -> BatonResult<()> {
        let response: ControlResponse = self
            .post_json(&format!("/session/{session_id}/resume"), &())
            .await?;
        self.domain_check(response)
    }

    /// Fetches the session's state and byte counter.
    pub async fn status(&self, session_id: &str) -> BatonResult<StatusResponse> {
        self.get_json(&format!("/session/{session_id}/status"))
            .await
    }

    /// Best-effort metadata lookup.
    pub async fn metadata(&self, url: &str) -> BatonResult<MediaInfo> {
        let response: LookupResponse<MediaInfo> = self
            .get_json(&format!("/metadata?url={}", urlencode(url)))
            .await?;
        unwrap_lookup(response)
    }

    /// Best-effort playlist listing.
    pub async fn playlist(&self, url: &str) -> BatonResult<PlaylistInfo> {
        let response: LookupResponse<PlaylistInfo> = self
            .get_json(&format!("/playlist?url={}", urlencode(url)))
            .await?;
        unwrap_lookup(response)
    }

    /// Search returning scoreable candidates.
    pub async fn search(&self, query: &str) -> BatonResult<Vec<SearchCandidate>> {
        let response: LookupResponse<Vec<crate::engine::PlaylistEntry>> = self
            .get_json(&format!("/search?q={}", urlencode(query)))
            .await?;
        let entries = unwrap_lookup(response)?;
        Ok(entries
            .into_iter()
            .map(|e| SearchCandidate {
                url: e.url,
                title: e.title,
                duration_secs: e.duration_secs,
            })
            .collect())
    }

    /// Probes `/health` and verifies the service identity.
    pub async fn health(&self) -> BatonResult<HealthResponse> {
        let response: HealthResponse = self.get_json("/health").await?;
        if response.service != SERVICE_ID {
            return Err(BatonError::EngineUnavailable(format!(
                "unexpected service {:?} at {}",
                response.service, self.base_url
            )));
        }
        Ok(response)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> BatonResult<T>
    where
        B: serde::Serialize,
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;
        self.decode(response).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> BatonResult<T> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?;
        self.decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> BatonResult<T> {
        if response.status().is_server_error() {
            return Err(BatonError::EngineUnavailable(format!(
                "engine answered {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    fn domain_check(&self, response: ControlResponse) -> BatonResult<()> {
        if response.is_ok() {
            Ok(())
        } else {
            Err(BatonError::InvalidRequest(
                response
                    .message
                    .unwrap_or_else(|| "engine rejected the request".to_string()),
            ))
        }
    }
}

/// Minimal query-string escaping for URLs and free-text queries.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_reserved_bytes() {
        assert_eq!(urlencode("a b&c"), "a%20b%26c");
        assert_eq!(
            urlencode("https://e/watch?v=1"),
            "https%3A%2F%2Fe%2Fwatch%3Fv%3D1"
        );
        assert_eq!(urlencode("safe-chars_.~"), "safe-chars_.~");
    }

    #[test]
    fn base_url_trailing_slash_stripped() {
        let client = EngineClient::new(reqwest::Client::new(), "http://127.0.0.1:49500///");
        assert_eq!(client.base_url, "http://127.0.0.1:49500");
    }
}
