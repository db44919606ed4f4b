//! Optional "agent status" heartbeat pushed to the backend's business
//! console, gated by `ANODOT_SEND_TO_BC`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

const BEARER_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Serialize)]
struct Source {
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct Pipeline {
    pipeline_id: String,
    created: i64,
    updated: i64,
    status: String,
    source: Source,
}

#[derive(Debug, Deserialize, Default)]
struct AccessTokenResponse {
    #[serde(rename = "Token")]
    token: String,
}

struct CachedToken {
    token: String,
    obtained_at: Instant,
}

/// Pushes a periodic "this agent is alive" record to
/// `<server>/api/v2/bc/agents`, refreshing its bearer token from
/// `<server>/api/v2/access-token` at most once every 24 hours.
pub struct BcClient {
    client: reqwest::Client,
    server: String,
    access_key: String,
    bearer: Mutex<Option<CachedToken>>,
    started_at: i64,
}

#[derive(Debug)]
pub enum BcError {
    Transport(reqwest::Error),
    Unauthorized,
    UnexpectedStatus(reqwest::StatusCode),
}

impl std::fmt::Display for BcError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BcError::Transport(e) => write!(f, "transport error talking to business console: {e}"),
            BcError::Unauthorized => write!(f, "failed to refresh bearer token"),
            BcError::UnexpectedStatus(s) => write!(f, "business console responded with status {s}"),
        }
    }
}

impl std::error::Error for BcError {}

impl From<reqwest::Error> for BcError {
    fn from(err: reqwest::Error) -> Self {
        BcError::Transport(err)
    }
}

impl BcClient {
    pub fn new(server: impl Into<String>, access_key: impl Into<String>, started_at: i64) -> Self {
        BcClient {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            server: server.into(),
            access_key: access_key.into(),
            bearer: Mutex::new(None),
            started_at,
        }
    }

    async fn bearer_token(&self) -> Result<String, BcError> {
        let cached = {
            let guard = self.bearer.lock().unwrap();
            guard
                .as_ref()
                .filter(|c| c.obtained_at.elapsed() < BEARER_TOKEN_TTL)
                .map(|c| c.token.clone())
        };
        if let Some(token) = cached {
            return Ok(token);
        }

        let url = format!("{}/api/v2/access-token", self.server.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "refreshToken": self.access_key }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BcError::Unauthorized);
        }

        let body: AccessTokenResponse = response.json().await.unwrap_or_default();
        *self.bearer.lock().unwrap() = Some(CachedToken {
            token: body.token.clone(),
            obtained_at: Instant::now(),
        });
        Ok(body.token)
    }

    /// Sends a single heartbeat record. Intended to be called from a
    /// `tokio::time::interval` loop at `ANODOT_SEND_TO_BC_PERIOD_SEC`.
    pub async fn send_heartbeat(&self, now: i64) -> Result<(), BcError> {
        let token = self.bearer_token().await?;
        let url = format!("{}/api/v2/bc/agents", self.server.trim_end_matches('/'));

        let pipeline = Pipeline {
            pipeline_id: "prometheus-remote-write".to_string(),
            created: self.started_at,
            updated: now,
            status: "RUNNING".to_string(),
            source: Source {
                name: "prometheus".to_string(),
                kind: "prometheus".to_string(),
            },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&pipeline)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BcError::UnexpectedStatus(response.status()))
        }
    }
}
