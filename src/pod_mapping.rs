//! Periodic fetcher that keeps a [`PodMappingSnapshot`] up to date by
//! polling a configured relabel service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::metrics;
use crate::transform::podmap::{PodKey, PodMappingSnapshot};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;
const POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct PodsResponse {
    #[serde(default)]
    whitelisted_pods: HashMap<String, String>,
    #[serde(default)]
    excluded_pods: HashMap<String, String>,
}

fn parse_key(raw: &str) -> Option<PodKey> {
    let (namespace, pod_name) = raw.split_once('|')?;
    Some((namespace.to_string(), pod_name.to_string()))
}

fn to_keyed_map(raw: HashMap<String, String>) -> HashMap<PodKey, String> {
    raw.into_iter()
        .filter_map(|(k, v)| parse_key(&k).map(|key| (key, v)))
        .collect()
}

/// Periodically polls `base_url` + `/pods` and keeps `snapshot` fresh.
/// Runs until the process exits; failures are logged and counted but
/// never take down the task, so a flaky relabel service degrades to
/// "use the last known mapping" rather than crashing the adapter.
pub async fn run(client: reqwest::Client, base_url: String, snapshot: Arc<PodMappingSnapshot>) {
    let url = format!("{}/pods", base_url.trim_end_matches('/'));
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        interval.tick().await;
        match fetch_once(&client, &url).await {
            Ok(resp) => {
                snapshot.replace(to_keyed_map(resp.whitelisted_pods), to_keyed_map(resp.excluded_pods));
            }
            Err(err) => {
                log::warn!("failed to refresh pod mapping from {url}: {err}");
                metrics::POD_MAPPING_FETCH_ERRORS.inc();
            }
        }
    }
}

async fn fetch_once(client: &reqwest::Client, url: &str) -> Result<PodsResponse, String> {
    let mut last_err = String::new();
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let jitter_ms = rand::thread_rng().gen_range(0..250);
            tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt) + jitter_ms)).await;
        }
        match client.get(url).timeout(FETCH_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => {
                return resp.json::<PodsResponse>().await.map_err(|e| e.to_string());
            }
            Ok(resp) => last_err = format!("unexpected status {}", resp.status()),
            Err(e) => last_err = e.to_string(),
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn test_parse_key() {
        pretty_assert_eq!(
            parse_key("default|api-7f8"),
            Some(("default".to_string(), "api-7f8".to_string()))
        );
        assert!(parse_key("no-separator").is_none());
    }

    #[test]
    fn test_to_keyed_map_skips_malformed() {
        let mut raw = HashMap::new();
        raw.insert("default|api-7f8".to_string(), "api".to_string());
        raw.insert("malformed".to_string(), "ignored".to_string());
        let keyed = to_keyed_map(raw);
        pretty_assert_eq!(keyed.len(), 1);
        pretty_assert_eq!(
            keyed.get(&("default".to_string(), "api-7f8".to_string())).map(String::as_str),
            Some("api")
        );
    }
}
