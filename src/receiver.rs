//! The HTTP surface: the remote-write ingest endpoint, health check,
//! self-telemetry, and the optional self-scrape loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;

use crate::decoder::{self, DecodeError};
use crate::forwarder::Forwarder;
use crate::metrics;
use crate::model::{Sample, TAG_PREFIX};
use crate::transform::Transformer;

pub struct ReceiverState {
    pub transformer: Transformer,
    pub forwarders: Vec<Arc<Forwarder>>,
    pub basic_auth: Option<(String, String)>,
    /// `ANODOT_PUSH_METRICS_ENABLED`: a global kill switch. Samples are
    /// still decoded and transformed when this is false, just never
    /// handed to a forwarder — used to run the adapter read-only.
    pub push_metrics_enabled: bool,
}

impl ReceiverState {
    fn dispatch(&self, samples: Vec<Sample>) {
        let outgoing = self.transformer.process_all(samples);
        if outgoing.is_empty() || !self.push_metrics_enabled {
            return;
        }
        for forwarder in &self.forwarders {
            forwarder.do_forward(outgoing.clone());
        }
    }
}

#[derive(Debug)]
pub enum ReceiveError {
    BodyUnreadable(axum::Error),
    BadPayload(DecodeError),
}

impl IntoResponse for ReceiveError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ReceiveError::BodyUnreadable(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to read request body: {err}")).into_response()
            }
            ReceiveError::BadPayload(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        }
    }
}

async fn receive(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> impl IntoResponse {
    metrics::RECEIVED_REQUESTS.inc();
    log::debug!("received write request from {}", source_ip(&headers, remote_addr));

    // `Bytes`-as-extractor would let axum reject an unreadable body with its
    // own 400 before this handler runs; reading it explicitly keeps body
    // read failures on the 500 path the stream-decode failures use.
    let body = match to_bytes(request.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            metrics::HTTP_RESPONSES.with_label_values(&["500"]).inc();
            return ReceiveError::BodyUnreadable(axum::Error::new(err)).into_response();
        }
    };

    let samples = match decoder::decode(&body) {
        Ok(samples) => samples,
        Err(err) => {
            metrics::HTTP_RESPONSES.with_label_values(&["400"]).inc();
            return ReceiveError::BadPayload(err).into_response();
        }
    };

    state.dispatch(samples);

    metrics::HTTP_RESPONSES.with_label_values(&["200"]).inc();
    StatusCode::OK.into_response()
}

fn source_ip(headers: &HeaderMap, remote_addr: SocketAddr) -> String {
    headers
        .get("x-real-ip")
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .unwrap_or_else(|| remote_addr.ip().to_string())
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

async fn basic_auth(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let Some((user, password)) = &state.basic_auth else {
        return next.run(request).await;
    };

    let authorized = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|decoded| decoded.split_once(':').map(|(u, p)| (u.to_string(), p.to_string())))
        .is_some_and(|(u, p)| constant_time_eq(&u, user) && constant_time_eq(&p, password));

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(axum::http::header::WWW_AUTHENTICATE, "Basic")],
        )
            .into_response()
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn router(state: Arc<ReceiverState>) -> Router {
    let receive_route = Router::new()
        .route("/receive", post(receive))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), basic_auth));

    Router::new()
        .merge(receive_route)
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: Arc<ReceiverState>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state).into_make_service_with_connect_info::<SocketAddr>()).await
}

/// Scrapes this process's own `/metrics` on loopback, parses it back
/// into samples, tags each with `anodot_tag_source_host_id` when an
/// instance name is configured, and forwards them like any other
/// sample. Runs until the process exits.
pub async fn self_scrape_loop(port: u16, instance_name: Option<String>, period: Duration, state: Arc<ReceiverState>) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{port}/metrics");
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;
        match scrape_self(&client, &url, instance_name.as_deref()).await {
            Ok(samples) => state.dispatch(samples),
            Err(err) => log::warn!("self-scrape of {url} failed: {err}"),
        }
    }
}

async fn scrape_self(client: &reqwest::Client, url: &str, instance_name: Option<&str>) -> Result<Vec<Sample>, String> {
    let text = client.get(url).send().await.map_err(|e| e.to_string())?.text().await.map_err(|e| e.to_string())?;
    let lines = text.lines().map(|l| Ok(l.to_string()));
    let scrape = prometheus_parse::Scrape::parse(lines).map_err(|e| e.to_string())?;

    Ok(scrape
        .samples
        .into_iter()
        .map(|s| {
            let value = match s.value {
                prometheus_parse::Value::Counter(v) => v,
                prometheus_parse::Value::Gauge(v) => v,
                prometheus_parse::Value::Untyped(v) => v,
                prometheus_parse::Value::Histogram(_) | prometheus_parse::Value::Summary(_) => f64::NAN,
            };
            let mut labels: Vec<(String, String)> = s.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            labels.push(("__name__".to_string(), s.metric));
            if let Some(name) = instance_name {
                labels.push((format!("{TAG_PREFIX}source_host_id"), name.to_string()));
            }
            Sample {
                labels,
                timestamp_ms: s.timestamp.timestamp_millis(),
                value,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "wrong"));
        assert!(!constant_time_eq("short", "longer-value"));
    }

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4242))
    }

    #[test]
    fn test_source_ip_prefers_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "1.2.3.4".parse().unwrap());
        headers.insert("x-forwarded-for", "5.6.7.8".parse().unwrap());
        pretty_assert_eq!(source_ip(&headers, loopback()), "1.2.3.4");
    }

    #[test]
    fn test_source_ip_falls_back_to_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "5.6.7.8, 9.9.9.9".parse().unwrap());
        pretty_assert_eq!(source_ip(&headers, loopback()), "5.6.7.8");
    }

    #[test]
    fn test_source_ip_falls_back_to_remote_addr() {
        let headers = HeaderMap::new();
        pretty_assert_eq!(source_ip(&headers, loopback()), "127.0.0.1");
    }
}
