//! Player name lookup
//!
//! Endpoint: https://sessionserver.mojang.com/session/minecraft/profile/{uuid}
//! Returns: `{"id": "<uuid without dashes>", "name": "<username>"}`
//!
//! Unknown profiles answer `204 No Content` (older deployments `404`).

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("lookup returned HTTP {0}")]
    Status(StatusCode),
    #[error("no profile for {0}")]
    NotFound(String),
    #[error("malformed profile payload: {0}")]
    Malformed(String),
}

/// Maps an opaque actor id to a display name
#[async_trait]
pub trait NameLookup: Send + Sync {
    async fn lookup(&self, actor_id: &str) -> Result<String, LookupError>;
}

#[derive(Debug, Deserialize)]
struct Profile {
    name: String,
}

/// reqwest-backed client for the Mojang session profile endpoint
pub struct MojangLookupClient {
    client: reqwest::Client,
    base_url: String,
}

impl MojangLookupClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl NameLookup for MojangLookupClient {
    async fn lookup(&self, actor_id: &str) -> Result<String, LookupError> {
        let url = format!("{}/{}", self.base_url, actor_id.replace('-', ""));
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
                return Err(LookupError::NotFound(actor_id.to_string()))
            }
            status if !status.is_success() => return Err(LookupError::Status(status)),
            _ => {}
        }

        let body = response.text().await?;
        parse_profile(&body)
    }
}

fn parse_profile(body: &str) -> Result<String, LookupError> {
    let profile: Profile =
        serde_json::from_str(body).map_err(|e| LookupError::Malformed(e.to_string()))?;
    if profile.name.is_empty() {
        return Err(LookupError::Malformed("empty name".to_string()));
    }
    Ok(profile.name)
}
