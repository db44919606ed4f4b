use std::net::SocketAddr;
use std::sync::Arc;

use anodot_remote_write::config::Config;
use anodot_remote_write::forwarder::Forwarder;
use anodot_remote_write::receiver::{self, ReceiverState};
use anodot_remote_write::submitter::AnodotSubmitter;
use anodot_remote_write::transform::podmap::PodMappingSnapshot;
use anodot_remote_write::transform::{PodMapProcessor, Processor, RelabelProcessor, Transformer};
use anodot_remote_write::{bc, metrics, pod_mapping};

pub async fn run() {
    let log_level = std::env::var("ANODOT_LOG_LEVEL")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(log::LevelFilter::Info);
    simple_logger::SimpleLogger::new()
        .with_level(log_level)
        .init()
        .expect("failed to initialize logger");
    metrics::init();

    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(error) => {
            eprintln!("configuration error: {error}");
            std::process::exit(exitcode::CONFIG);
        }
    };

    let mut processors: Vec<Box<dyn Processor>> = Vec::new();
    if !cfg.relabel_rules.is_empty() {
        processors.push(Box::new(RelabelProcessor {
            rules: cfg.relabel_rules.clone(),
        }));
    }

    let pod_snapshot = PodMappingSnapshot::new();
    if let Some(relabel_url) = &cfg.relabel_url {
        processors.push(Box::new(PodMapProcessor {
            snapshot: Arc::clone(&pod_snapshot),
        }));
        let client = reqwest::Client::new();
        tokio::spawn(pod_mapping::run(client, relabel_url.clone(), Arc::clone(&pod_snapshot)));
    }

    let transformer = Transformer::new(processors, cfg.static_tags.clone(), cfg.filter_in.clone(), cfg.filter_out.clone());

    let (done_tx, done_rx) = tokio::sync::watch::channel(false);

    let mut forwarders = Vec::new();
    let submitter = Arc::new(AnodotSubmitter::new(cfg.anodot_url.clone(), cfg.anodot_token.clone()));
    let forwarder = match Forwarder::new(cfg.forwarder.clone(), submitter) {
        Ok(forwarder) => forwarder,
        Err(error) => {
            eprintln!("configuration error: {error}");
            std::process::exit(exitcode::CONFIG);
        }
    };
    forwarder.spawn(done_rx.clone());
    forwarders.push(forwarder);

    // `--murl`/`--mtoken`: mirror every metric to a second backend, its own
    // Forwarder sharing the primary's buffering/concurrency tuning.
    if let Some((mirror_url, mirror_token)) = cfg.mirror.clone() {
        let mirror_submitter = Arc::new(AnodotSubmitter::new(mirror_url, mirror_token));
        let mirror_forwarder = match Forwarder::new(cfg.forwarder.clone(), mirror_submitter) {
            Ok(forwarder) => forwarder,
            Err(error) => {
                eprintln!("configuration error: {error}");
                std::process::exit(exitcode::CONFIG);
            }
        };
        mirror_forwarder.spawn(done_rx.clone());
        forwarders.push(mirror_forwarder);
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown signal received, stopping dispatchers (no final flush)");
            let _ = done_tx.send(true);
        }
    });

    let state = Arc::new(ReceiverState {
        transformer,
        forwarders,
        basic_auth: cfg.basic_auth.clone(),
        push_metrics_enabled: cfg.push_metrics_enabled,
    });

    if cfg.report_monitoring_metrics {
        tokio::spawn(receiver::self_scrape_loop(
            cfg.listen_port,
            cfg.instance_name.clone(),
            cfg.monitoring_report_period,
            Arc::clone(&state),
        ));
    }

    if cfg.send_to_bc {
        if let Some(access_key) = cfg.access_key.clone() {
            let client = bc::BcClient::new(cfg.anodot_url.clone(), access_key, now_unix());
            let period = cfg.send_to_bc_period;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    if let Err(err) = client.send_heartbeat(now_unix()).await {
                        log::warn!("failed to send agent heartbeat: {err}");
                    }
                }
            });
        } else {
            log::warn!("ANODOT_SEND_TO_BC is set but ANODOT_ACCESS_KEY is missing; heartbeat disabled");
        }
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    if let Err(error) = receiver::serve(addr, state).await {
        eprintln!("failed to bind listener on {addr}: {error}");
        std::process::exit(exitcode::OSERR);
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[tokio::main]
async fn main() {
    run().await
}
