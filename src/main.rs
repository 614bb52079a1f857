mod cli;
mod config;
mod consolidation;
mod delivery;
mod error;
mod kubernetes;
mod metrics;
mod slack;
mod stream;
mod types;
mod utils;

use clap::Parser;
use kube::{Client, config as kube_config};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cli::{Cli, LogFormat};
use config::Config;
use consolidation::{ConsolidationEngine, ConsolidationSettings, PatternState};
use delivery::{DeliveryQueue, DeliverySettings};
use kubernetes::{Annotations, DiscoveryContext, KubeLogSource, spawn_watchers};
use metrics::Metrics;
use slack::{NotificationSink, SlackSink, StdoutSink};
use stream::{StreamManager, StreamSettings};
use utils::format_age;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    match cli.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }

    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_cli(&cli);
    config.validate(!cli.dry_run)?;
    let config = Arc::new(config);

    let client = initialize_client(cli.context.as_deref()).await?;
    let sink = build_sink(&cli, &config).await?;
    let metrics = Arc::new(Metrics::default());

    let queue = DeliveryQueue::start(
        sink,
        DeliverySettings::from(&config.delivery),
        metrics.clone(),
    );
    let engine = ConsolidationEngine::new(
        ConsolidationSettings::from(&config.consolidation),
        queue.clone(),
        metrics.clone(),
    );
    let source = Arc::new(KubeLogSource::new(
        client.clone(),
        config.kubernetes.poll_interval(),
    ));
    let manager = Arc::new(StreamManager::new(
        source,
        engine.clone(),
        queue.clone(),
        metrics.clone(),
        StreamSettings {
            poll_interval: config.kubernetes.poll_interval(),
            stale_after: Duration::from_secs(config.stream.stale_after_secs),
        },
    ));

    let ctx = DiscoveryContext {
        manager: manager.clone(),
        config: config.clone(),
        annotations: Annotations::new(config.kubernetes.annotation_prefix.clone()),
        metrics: metrics.clone(),
    };
    let watchers = spawn_watchers(client, ctx);
    if config.kubernetes.namespaces.is_empty() {
        info!("Watching pods in all namespaces");
    } else {
        info!("Watching pods in namespaces: {}", config.kubernetes.namespaces.join(", "));
    }

    let started = Instant::now();
    let stats_metrics = metrics.clone();
    let stats_manager = manager.clone();
    let stats_engine = engine.clone();
    let stats = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            log_stats(&stats_metrics, started);
            log_streams(&stats_manager, &stats_engine).await;
        }
    });

    wait_for_shutdown().await?;
    info!("Shutdown signal received, stopping");

    stats.abort();
    for watcher in watchers {
        watcher.abort();
    }
    manager.stop_all().await;
    queue.shutdown().await;
    log_stats(&metrics, started);

    Ok(())
}

async fn initialize_client(context: Option<&str>) -> anyhow::Result<Client> {
    let config = match context {
        Some(ctx) => kube_config::Config::from_kubeconfig(&kube_config::KubeConfigOptions {
            context: Some(ctx.to_string()),
            ..Default::default()
        })
        .await
        .map_err(|e| anyhow::anyhow!("Context '{}' not found in kubeconfig: {}", ctx, e))?,
        None => kube_config::Config::infer().await?,
    };
    let client = Client::try_from(config)?;
    info!("Kubernetes client initialized");
    Ok(client)
}

async fn build_sink(cli: &Cli, config: &Config) -> anyhow::Result<Arc<dyn NotificationSink>> {
    if cli.dry_run {
        warn!("Dry run: notifications are printed to stdout");
        return Ok(Arc::new(StdoutSink));
    }
    let token = config
        .slack
        .token
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Slack token not configured"))?;
    let sink = SlackSink::new(config.slack.api_url.clone(), token);
    sink.verify()
        .await
        .map_err(|e| anyhow::anyhow!("Slack authentication failed: {}", e))?;
    Ok(Arc::new(sink))
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn log_stats(metrics: &Metrics, started: Instant) {
    let s = metrics.snapshot();
    info!(
        uptime = %format_age(started.elapsed().as_secs()),
        lines_processed = s.lines_processed,
        lines_filtered = s.lines_filtered,
        lines_suppressed = s.lines_suppressed,
        messages_sent = s.messages_sent,
        errors = s.errors,
        pod_events = s.pod_events,
        active_streams = s.active_streams,
        "stats"
    );
}

async fn log_streams(manager: &StreamManager, engine: &ConsolidationEngine) {
    for key in manager.keys().await {
        let Some(status) = manager.status(&key).await else {
            continue;
        };
        debug!(
            stream = %key,
            active = status.active,
            buffered = status.buffered,
            last_flush = %status
                .last_flush
                .map(|d| format_age(d.as_secs()))
                .unwrap_or_else(|| "never".to_string()),
            patterns = status.patterns.total,
            suppressed = status.patterns.suppressed,
            "stream status"
        );
        for pattern in engine.patterns(&key) {
            if pattern.state == PatternState::Suppressed {
                debug!(
                    stream = %key,
                    count = pattern.count,
                    summary_pending = pattern.consolidation_pending,
                    resolution_pending = pattern.resolution_pending,
                    "suppressed: {}",
                    pattern.pattern
                );
            }
        }
    }
}
