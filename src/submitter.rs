//! The HTTP contract between a [`crate::forwarder::Forwarder`] and the
//! anomaly-detection backend it submits metrics to.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::model::OutgoingMetric;

#[derive(Debug)]
pub enum SubmitError {
    Transport(reqwest::Error),
    UnexpectedStatus(reqwest::StatusCode),
    ApplicationErrors(Vec<String>),
    BodyParse(reqwest::Error),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SubmitError::Transport(e) => write!(f, "transport error submitting metrics: {e}"),
            SubmitError::UnexpectedStatus(s) => write!(f, "backend responded with status {s}"),
            SubmitError::ApplicationErrors(errs) => {
                write!(f, "backend reported {} application error(s): {}", errs.len(), errs.join("; "))
            }
            SubmitError::BodyParse(e) => write!(f, "failed to parse backend response body: {e}"),
        }
    }
}

impl std::error::Error for SubmitError {}

impl From<reqwest::Error> for SubmitError {
    fn from(err: reqwest::Error) -> Self {
        SubmitError::Transport(err)
    }
}

/// The outcome of one submission attempt, carrying enough detail for
/// the forwarder to record its per-status-code counters.
pub struct SubmitOutcome {
    pub status: Option<reqwest::StatusCode>,
    pub result: Result<(), SubmitError>,
}

/// Abstraction over "ship these metrics to a backend", so the
/// forwarder can be tested against a fake and the default Anodot
/// client is just one implementation among possibly several.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, metrics: &[OutgoingMetric]) -> SubmitOutcome;

    /// A short label identifying this backend, used as the
    /// `anodot_url` metric label.
    fn label(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct SubmitResponseBody {
    #[serde(default)]
    errors: Vec<String>,
}

/// Submits metrics to `<server>/api/v1/metrics?token=...&protocol=anodot20`.
pub struct AnodotSubmitter {
    client: reqwest::Client,
    server: String,
    token: String,
    label: String,
}

impl AnodotSubmitter {
    pub fn new(server: impl Into<String>, token: impl Into<String>) -> Self {
        let server = server.into();
        AnodotSubmitter {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            label: server.clone(),
            server,
            token: token.into(),
        }
    }
}

#[async_trait]
impl Submitter for AnodotSubmitter {
    async fn submit(&self, metrics: &[OutgoingMetric]) -> SubmitOutcome {
        let url = format!(
            "{}/api/v1/metrics?token={}&protocol=anodot20",
            self.server.trim_end_matches('/'),
            self.token
        );

        let response = match self.client.post(&url).json(metrics).send().await {
            Ok(r) => r,
            Err(e) => {
                return SubmitOutcome {
                    status: None,
                    result: Err(SubmitError::from(e)),
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            return SubmitOutcome {
                status: Some(status),
                result: Err(SubmitError::UnexpectedStatus(status)),
            };
        }

        let body: SubmitResponseBody = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                return SubmitOutcome {
                    status: Some(status),
                    result: Err(SubmitError::BodyParse(e)),
                }
            }
        };

        if body.errors.is_empty() {
            SubmitOutcome {
                status: Some(status),
                result: Ok(()),
            }
        } else {
            SubmitOutcome {
                status: Some(status),
                result: Err(SubmitError::ApplicationErrors(body.errors)),
            }
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}
