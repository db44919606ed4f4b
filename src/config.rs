//! Command-line flags, environment overrides and the on-disk relabel
//! YAML file, resolved once at startup into a single validated
//! [`Config`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::forwarder::ForwarderConfig;
use crate::transform::relabel::{RawRelabelRule, RelabelRule, RelabelRuleError};

#[derive(Parser, Debug)]
#[command(name = "anodot-remote-write", about = "Prometheus remote-write adapter for Anodot")]
struct Args {
    /// Anodot account endpoint, e.g. https://api.anodot.com
    #[arg(long)]
    url: String,

    /// Anodot data collection token.
    #[arg(long, default_value = "")]
    token: String,

    /// Port this adapter listens on for remote-write and /metrics.
    #[arg(long, default_value_t = 1234)]
    server: u16,

    /// Maximum concurrent in-flight submissions to the backend.
    #[arg(long, default_value_t = 20)]
    workers: i64,

    /// Only forward metrics whose properties match `key=value` pairs (comma separated).
    #[arg(long)]
    filter_in: Option<String>,

    /// Drop metrics whose properties match `key=value` pairs (comma separated).
    #[arg(long)]
    filter_out: Option<String>,

    /// Mirror backend endpoint; when set, every metric is also forwarded here.
    #[arg(long)]
    murl: Option<String>,

    /// Mirror backend token.
    #[arg(long, default_value = "")]
    mtoken: String,

    /// Base URL of the pod-name relabel service (`/pods` is appended).
    #[arg(long)]
    relabel_url: Option<String>,

    /// Path to a YAML file of Prometheus-style relabel rules.
    #[arg(long)]
    relabel_config: Option<PathBuf>,

    /// Log received metrics instead of submitting them.
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingToken,
    InvalidFilter(String),
    ReadRelabelConfig(std::io::Error),
    ParseRelabelConfig(serde_yaml::Error),
    InvalidRelabelRule(RelabelRuleError),
    InvalidForwarder(crate::forwarder::ForwarderConfigError),
    InvalidEnvInt { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::MissingToken => write!(f, "no Anodot API token provided (--token or ANODOT_API_TOKEN)"),
            ConfigError::InvalidFilter(s) => write!(f, "invalid filter expression {s:?}, expected key=value pairs"),
            ConfigError::ReadRelabelConfig(e) => write!(f, "failed to read relabel config: {e}"),
            ConfigError::ParseRelabelConfig(e) => write!(f, "failed to parse relabel config: {e}"),
            ConfigError::InvalidRelabelRule(e) => write!(f, "invalid relabel rule: {e}"),
            ConfigError::InvalidForwarder(e) => write!(f, "invalid forwarder configuration: {e}"),
            ConfigError::InvalidEnvInt { var, value } => write!(f, "{var}={value:?} is not a valid integer"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Deserialize)]
struct RelabelConfigFile {
    #[serde(default)]
    relabel_configs: Vec<RawRelabelRule>,
}

/// Everything the rest of the process needs, resolved from CLI flags
/// and environment overrides. Environment variables win over the
/// identically-purposed flag when both are set.
pub struct Config {
    pub anodot_url: String,
    pub anodot_token: String,
    pub listen_port: u16,
    pub forwarder: ForwarderConfig,
    pub filter_in: Option<HashMap<String, String>>,
    pub filter_out: Option<HashMap<String, String>>,
    /// Mirror backend (`--murl`/`--mtoken`): every metric forwarded to the
    /// primary backend is also forwarded here, as its own `Forwarder`.
    pub mirror: Option<(String, String)>,
    pub push_metrics_enabled: bool,
    pub static_tags: HashMap<String, String>,
    pub relabel_url: Option<String>,
    pub relabel_rules: Vec<RelabelRule>,
    pub basic_auth: Option<(String, String)>,
    pub instance_name: Option<String>,
    pub report_monitoring_metrics: bool,
    pub monitoring_report_period: Duration,
    pub send_to_bc: bool,
    pub send_to_bc_period: Duration,
    pub access_key: Option<String>,
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    env(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1").unwrap_or(default)
}

fn env_int<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env(name) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidEnvInt { var: name, value: v }),
    }
}

fn parse_kv_pairs(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(',')
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| ConfigError::InvalidFilter(pair.to_string()))
        })
        .collect()
}

fn parse_tags(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(';')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| ConfigError::InvalidFilter(pair.to_string()))
        })
        .collect()
}

impl Config {
    /// Parses CLI flags, applies environment overrides, loads the
    /// optional relabel YAML file, and validates everything in one
    /// place so a misconfigured deployment fails fast at boot.
    pub fn load() -> Result<Self, ConfigError> {
        let args = Args::parse();

        let anodot_token = env("ANODOT_API_TOKEN").unwrap_or(args.token);
        if anodot_token.is_empty() {
            return Err(ConfigError::MissingToken);
        }

        let filter_in = match args.filter_in {
            Some(raw) => Some(parse_kv_pairs(&raw)?),
            None => None,
        };
        let filter_out = match args.filter_out {
            Some(raw) => Some(parse_kv_pairs(&raw)?),
            None => None,
        };

        // No environment override is documented for these two (unlike the
        // rest of the CLI surface); `--murl`/`--mtoken` are flag-only.
        let mirror = args.murl.map(|url| (url, args.mtoken));

        let push_metrics_enabled = env_bool("ANODOT_PUSH_METRICS_ENABLED", true);

        let static_tags = match env("ANODOT_TAGS") {
            Some(raw) => parse_tags(&raw)?,
            None => HashMap::new(),
        };

        let relabel_url = env("K8S_RELABEL_SERVICE_URL").or(args.relabel_url);

        let relabel_config_path = env("ANODOT_RELABEL_CONFIG_PATH").map(PathBuf::from).or(args.relabel_config);
        let relabel_rules = match relabel_config_path {
            Some(path) => {
                let contents = std::fs::read_to_string(&path).map_err(ConfigError::ReadRelabelConfig)?;
                let parsed: RelabelConfigFile = serde_yaml::from_str(&contents).map_err(ConfigError::ParseRelabelConfig)?;
                parsed
                    .relabel_configs
                    .into_iter()
                    .map(RelabelRule::try_from)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(ConfigError::InvalidRelabelRule)?
            }
            None => Vec::new(),
        };

        let basic_auth = match (env("ANODOT_REMOTE_WRITE_USER"), env("ANODOT_REMOTE_WRITE_PASSWORD")) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        };

        let max_workers = env_int("ANODOT_MAX_WORKERS", args.workers)?;
        let metrics_per_request_size: usize = env_int("ANODOT_METRICS_PER_REQUEST_SIZE", 1000)?;
        let batch_send_deadline_secs: u64 = env_int("ANODOT_BATCH_SEND_DEADLINE", 60)?;
        let max_allowed_eps: u32 = env_int("ANODOT_MAX_ALLOWED_EPS", 0)?;
        let debug = env_bool("ANODOT_DEBUG", args.debug);

        let forwarder = ForwarderConfig {
            max_workers,
            metrics_per_request_size,
            batch_send_deadline: Duration::from_secs(batch_send_deadline_secs),
            max_allowed_eps,
            debug,
        };
        forwarder.validate().map_err(ConfigError::InvalidForwarder)?;

        Ok(Config {
            anodot_url: args.url,
            anodot_token,
            listen_port: env_int("ANODOT_LISTEN_PORT", args.server)?,
            forwarder,
            filter_in,
            filter_out,
            mirror,
            push_metrics_enabled,
            static_tags,
            relabel_url,
            relabel_rules,
            basic_auth,
            instance_name: env("ANODOT_INSTANCE_NAME"),
            report_monitoring_metrics: env_bool("ANODOT_REPORT_MONITORING_METRICS", false),
            monitoring_report_period: Duration::from_secs(env_int("ANODOT_MONTORING_REPORT_PERIOD_SEC", 60)?),
            send_to_bc: env_bool("ANODOT_SEND_TO_BC", false),
            send_to_bc_period: Duration::from_secs(env_int("ANODOT_SEND_TO_BC_PERIOD_SEC", 300)?),
            access_key: env("ANODOT_ACCESS_KEY"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags("env=prod;team=sre").unwrap();
        pretty_assert_eq!(tags.get("env").map(String::as_str), Some("prod"));
        pretty_assert_eq!(tags.get("team").map(String::as_str), Some("sre"));
    }

    #[test]
    fn test_parse_kv_pairs_rejects_malformed() {
        assert!(parse_kv_pairs("not-a-pair").is_err());
    }
}
