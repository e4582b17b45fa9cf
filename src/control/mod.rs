//! Control server HTTP client
//!
//! Thin JSON client over `reqwest` for the four control endpoints: health,
//! auth, profile list sync and per-profile sync. Every failure is tagged
//! with an [`ErrorKind`] and, where applicable, the HTTP status, so the
//! scenarios can map it to a localized user message.

pub mod dto;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use crate::state::{ErrorKind, Profile};
use dto::{AuthRequest, AuthResponse, ProfileDto, ProfileSummaryDto};

const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// A failed control-server operation.
#[derive(Debug, Error)]
#[error("{op}: {message}")]
pub struct ControlError {
    pub op: &'static str,
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ControlError {
    fn new(op: &'static str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            op,
            kind,
            status: None,
            message: message.into(),
        }
    }

    fn with_status(op: &'static str, kind: ErrorKind, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            op,
            kind,
            status: Some(status.as_u16()),
            message: message.into(),
        }
    }

    fn transport(op: &'static str, error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() || error.is_connect() {
            ErrorKind::NetworkUnavailable
        } else {
            ErrorKind::Unknown
        };
        Self {
            op,
            kind,
            status: error.status().map(|s| s.as_u16()),
            message: error.to_string(),
        }
    }
}

/// Capability contract of the control server; the engine and its tests only
/// depend on this trait.
#[async_trait]
pub trait ControlApi: Send + Sync {
    async fn check_health(&self) -> Result<(), ControlError>;
    async fn auth(&self, login: &str, password: &str) -> Result<String, ControlError>;
    async fn sync_profile_list(&self, token: &str) -> Result<Vec<Profile>, ControlError>;
    async fn sync_profile(&self, token: &str, id: &str) -> Result<Profile, ControlError>;
}

/// HTTP implementation of [`ControlApi`].
pub struct ControlClient {
    base_url: String,
    client: reqwest::Client,
}

impl ControlClient {
    pub fn new(base_url: &str) -> Result<Self, ControlError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ControlError::new(
                "init",
                ErrorKind::ConfigFailed,
                "control server url is empty",
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|error| ControlError::new("init", ErrorKind::Unknown, error.to_string()))?;
        Ok(Self { base_url, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str, token: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, self.url(path))
            .header(reqwest::header::ACCEPT, "application/json");
        if !token.is_empty() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl ControlApi for ControlClient {
    /// `GET /health`; the body is the literal `OK`, optionally JSON-quoted.
    async fn check_health(&self) -> Result<(), ControlError> {
        const OP: &str = "check_health";
        let response = self
            .request(reqwest::Method::GET, "/health", "")
            .send()
            .await
            .map_err(|error| ControlError::transport(OP, error))?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(ControlError::with_status(
                OP,
                ErrorKind::NetworkUnavailable,
                status,
                format!("unexpected status {}", status.as_u16()),
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|error| ControlError::transport(OP, error))?;
        let text = body.trim();
        if text == "OK" || text == "\"OK\"" {
            return Ok(());
        }
        Err(ControlError::with_status(
            OP,
            ErrorKind::NetworkUnavailable,
            StatusCode::OK,
            format!("unexpected body {:?}", body),
        ))
    }

    /// `POST /auth`; 401/403 map to [`ErrorKind::AuthFailed`], an empty token
    /// in a 200 response is a hard error.
    async fn auth(&self, login: &str, password: &str) -> Result<String, ControlError> {
        const OP: &str = "auth";
        let response = self
            .request(reqwest::Method::POST, "/auth", "")
            .json(&AuthRequest { login, password })
            .send()
            .await
            .map_err(|error| ControlError::transport(OP, error))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ControlError::with_status(
                OP,
                ErrorKind::AuthFailed,
                status,
                "auth failed",
            ));
        }
        if status != StatusCode::OK {
            return Err(ControlError::with_status(
                OP,
                ErrorKind::Unknown,
                status,
                format!("unexpected status {}", status.as_u16()),
            ));
        }
        let body: AuthResponse = response
            .json()
            .await
            .map_err(|error| ControlError::transport(OP, error))?;
        let token = body.auth_token.trim().to_string();
        if token.is_empty() {
            return Err(ControlError::with_status(
                OP,
                ErrorKind::Unknown,
                StatusCode::OK,
                "empty auth token",
            ));
        }
        Ok(token)
    }

    /// `GET /sync/profiles`; any transport, status or validation problem
    /// fails the whole sync.
    async fn sync_profile_list(&self, token: &str) -> Result<Vec<Profile>, ControlError> {
        const OP: &str = "sync_profile_list";
        let response = self
            .request(reqwest::Method::GET, "/sync/profiles", token)
            .send()
            .await
            .map_err(|error| ControlError::transport(OP, error))?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(ControlError::with_status(
                OP,
                ErrorKind::SyncFailed,
                status,
                format!("unexpected status {}", status.as_u16()),
            ));
        }
        let summaries: Vec<ProfileSummaryDto> = response
            .json()
            .await
            .map_err(|error| ControlError::new(OP, ErrorKind::SyncFailed, error.to_string()))?;
        summaries
            .into_iter()
            .map(|dto| {
                dto.validate()
                    .map_err(|message| ControlError::new(OP, ErrorKind::SyncFailed, message))
            })
            .collect()
    }

    /// `GET /profiles/{id}`.
    async fn sync_profile(&self, token: &str, id: &str) -> Result<Profile, ControlError> {
        const OP: &str = "sync_profile";
        let id = id.trim();
        if id.is_empty() {
            return Err(ControlError::new(
                OP,
                ErrorKind::SyncFailed,
                "profile id is empty",
            ));
        }
        let path = format!("/profiles/{}", urlencode_path_segment(id));
        let response = self
            .request(reqwest::Method::GET, &path, token)
            .send()
            .await
            .map_err(|error| ControlError::transport(OP, error))?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(ControlError::with_status(
                OP,
                ErrorKind::SyncFailed,
                status,
                format!("unexpected status {}", status.as_u16()),
            ));
        }
        let dto: ProfileDto = response
            .json()
            .await
            .map_err(|error| ControlError::new(OP, ErrorKind::SyncFailed, error.to_string()))?;
        dto.validate()
            .map_err(|message| ControlError::new(OP, ErrorKind::SyncFailed, message))
    }
}

/// Percent-encodes everything outside the URL path unreserved set.
fn urlencode_path_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_segments_are_percent_encoded() {
        assert_eq!(urlencode_path_segment("p1"), "p1");
        assert_eq!(urlencode_path_segment("a b/c"), "a%20b%2Fc");
        assert_eq!(urlencode_path_segment("id-xyz_0.~"), "id-xyz_0.~");
    }

    #[test]
    fn client_rejects_empty_base_url() {
        assert!(ControlClient::new("").is_err());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = ControlClient::new("http://127.0.0.1:8080/").unwrap();
        assert_eq!(client.url("/health"), "http://127.0.0.1:8080/health");
    }
}
