//! Wire types for the control server API.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::state::Profile;

/// `POST /auth` request body.
#[derive(Debug, Serialize)]
pub struct AuthRequest<'a> {
    pub login: &'a str,
    pub password: &'a str,
}

/// `POST /auth` response body.
#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    #[serde(rename = "authToken", default)]
    pub auth_token: String,
}

/// One element of `GET /sync/profiles`.
#[derive(Debug, Deserialize)]
pub struct ProfileSummaryDto {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub country: String,
}

impl ProfileSummaryDto {
    /// Converts the summary into a partial [`Profile`] after validation.
    pub fn validate(self) -> Result<Profile, String> {
        if self.id.is_empty() {
            return Err("profile id is empty".to_string());
        }
        if self.name.is_empty() {
            return Err(format!("profile {}: name is empty", self.id));
        }
        Ok(Profile {
            id: self.id,
            name: self.name,
            country: self.country,
            ..Profile::default()
        })
    }
}

/// `GET /profiles/{id}` response. `core_config` is captured as raw JSON and
/// carried through as bytes, never normalized.
#[derive(Debug, Deserialize)]
pub struct ProfileDto {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: i64,
    pub core_config: Option<Box<RawValue>>,
    #[serde(default)]
    pub direct_routes: Vec<String>,
    #[serde(default)]
    pub tunnel_routes: Vec<String>,
    #[serde(default)]
    pub kill_switch: bool,
}

impl ProfileDto {
    /// Client-side validation: non-empty id/name/host, port in 1..=65535.
    pub fn validate(self) -> Result<Profile, String> {
        if self.id.is_empty() {
            return Err("profile id is empty".to_string());
        }
        if self.name.is_empty() {
            return Err(format!("profile {}: name is empty", self.id));
        }
        if self.host.is_empty() {
            return Err(format!("profile {}: host is empty", self.id));
        }
        if self.port < 1 || self.port > 65535 {
            return Err(format!("profile {}: invalid port {}", self.id, self.port));
        }
        Ok(Profile {
            id: self.id,
            name: self.name,
            country: self.country,
            host: self.host,
            port: self.port as u16,
            core_config: self
                .core_config
                .map(|raw| raw.get().as_bytes().to_vec())
                .unwrap_or_default(),
            direct_routes: normalize_cidrs(self.direct_routes),
            tunnel_routes: normalize_cidrs(self.tunnel_routes),
            kill_switch: self.kill_switch,
        })
    }
}

fn normalize_cidrs(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}
