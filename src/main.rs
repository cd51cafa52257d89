mod analytics;
mod cache;
mod config;
mod dedup;
mod esi;
mod events;
mod handlers;
mod http;
mod killmail;
mod license;
mod map_api;
mod notifier;
mod pipeline;
mod registry;
mod router;
mod telemetry;

use analytics::{Analytics, AnalyticsConfig};
use cache::Cache;
use clap::Parser;
use config::{ChannelIds, Environment, Features, WatchConfig};
use dedup::Deduplicator;
use esi::EsiClient;
use eyre::{eyre, Result};
use handlers::HandlerContext;
use http::{HttpClient, HttpConfig};
use license::LicenseConfig;
use map_api::MapApiClient;
use pipeline::{OverrideMode, PipelineContext, ValidationOverride};
use registry::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::{Counters, Telemetry, TelemetryConfig};
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(
    name = "wormwatch",
    version,
    about = "Wormhole map notification bot: tracks map systems/characters and kill activity"
)]
struct Args {
    /// Deployment environment tag (dev|test|prod).
    #[arg(long, env = "WORMWATCH_ENV", default_value = "dev")]
    environment: String,

    /// Game catalog (ESI) base URL.
    #[arg(long, env = "WORMWATCH_ESI_BASE", default_value = "https://esi.evetech.net")]
    esi_base: String,

    /// Map service base URL.
    #[arg(long, env = "WORMWATCH_MAP_BASE", default_value = "")]
    map_base: String,

    /// Slug of the map to follow.
    #[arg(long, env = "WORMWATCH_MAP_SLUG", default_value = "")]
    map_slug: String,

    /// Bearer token for the map API. Prefer the env var over the flag.
    #[arg(long, env = "WORMWATCH_MAP_TOKEN", default_value = "", hide_env_values = true)]
    map_token: String,

    /// Chat webhook URL notifications are POSTed to.
    #[arg(long, env = "WORMWATCH_WEBHOOK_URL", default_value = "", hide_env_values = true)]
    chat_webhook_url: String,

    /// Channel id for system notifications.
    #[arg(long, env = "WORMWATCH_CHANNEL_SYSTEM")]
    channel_system: Option<String>,

    /// Channel id for character notifications.
    #[arg(long, env = "WORMWATCH_CHANNEL_CHARACTER")]
    channel_character: Option<String>,

    /// Channel id for kill notifications.
    #[arg(long, env = "WORMWATCH_CHANNEL_KILL")]
    channel_kill: Option<String>,

    /// Channel id for rally notifications.
    #[arg(long, env = "WORMWATCH_CHANNEL_RALLY")]
    channel_rally: Option<String>,

    /// Channel id for status notifications.
    #[arg(long, env = "WORMWATCH_CHANNEL_STATUS")]
    channel_status: Option<String>,

    /// License server base URL.
    #[arg(long, env = "WORMWATCH_LICENSE_BASE", default_value = "")]
    license_base: String,

    /// License key. Empty in dev/test runs against the sentinel license.
    #[arg(long, env = "WORMWATCH_LICENSE_KEY", default_value = "", hide_env_values = true)]
    license_key: String,

    /// API token for the license server.
    #[arg(long, env = "WORMWATCH_API_TOKEN", default_value = "", hide_env_values = true)]
    api_token: String,

    /// License revalidation interval in milliseconds.
    #[arg(long, default_value_t = 3_600_000)]
    license_refresh_interval_ms: u64,

    /// Optional killmail feed URL to long-poll alongside the map stream.
    #[arg(long, env = "WORMWATCH_KILL_FEED_URL")]
    kill_feed_url: Option<String>,

    /// Mute add/update notifications for this long after startup.
    #[arg(long, default_value_t = 30)]
    startup_suppression_seconds: u64,

    /// Telemetry sampling interval in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    collection_interval_ms: u64,

    /// Telemetry history retention in milliseconds.
    #[arg(long, default_value_t = 86_400_000)]
    retention_period_ms: u64,

    /// Telemetry aggregation window in milliseconds.
    #[arg(long, default_value_t = 300_000)]
    aggregation_window_ms: u64,

    /// Deduplication fingerprint TTL in seconds.
    #[arg(long, default_value_t = 86_400)]
    dedup_ttl_seconds: u64,

    /// Max concurrent killmail enrichments. Defaults to the CPU count.
    #[arg(long)]
    max_enrichment: Option<usize>,

    /// Bound on the notification dispatch queue.
    #[arg(long, default_value_t = notifier::DEFAULT_QUEUE_CAPACITY)]
    dispatch_queue: usize,

    /// Disable system tracking.
    #[arg(long)]
    no_system_tracking: bool,

    /// Disable character tracking.
    #[arg(long)]
    no_character_tracking: bool,

    /// Disable all outbound notifications.
    #[arg(long)]
    no_notifications: bool,

    /// Arm the validation override at startup (system|character). The next
    /// killmail is forced through that notification path.
    #[arg(long)]
    arm_override: Option<String>,

    /// Cache prune sweep interval in seconds.
    #[arg(long, default_value_t = 300)]
    cache_prune_seconds: u64,

    /// Don't POST webhooks; log what would be sent.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let environment: Environment = args.environment.parse()?;
    let features = Features {
        system_tracking: !args.no_system_tracking,
        character_tracking: !args.no_character_tracking,
        notifications: !args.no_notifications,
    };
    let channel_ids = ChannelIds {
        system: args.channel_system,
        character: args.channel_character,
        kill: args.channel_kill,
        rally: args.channel_rally,
        status: args.channel_status,
    };

    let max_enrichment = args.max_enrichment.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(4)
    });

    let cfg = WatchConfig::assemble(
        environment,
        args.esi_base,
        args.map_base,
        args.map_slug,
        args.map_token,
        args.chat_webhook_url,
        channel_ids,
        args.license_base,
        args.license_key,
        args.api_token,
        args.license_refresh_interval_ms,
        args.kill_feed_url,
        args.startup_suppression_seconds,
        args.collection_interval_ms,
        args.retention_period_ms,
        args.aggregation_window_ms,
        args.dedup_ttl_seconds,
        max_enrichment,
        args.dispatch_queue,
        features,
        args.dry_run,
    )?;

    let arm_override = match args.arm_override.as_deref() {
        None => None,
        Some("system") => Some(OverrideMode::System),
        Some("character") => Some(OverrideMode::Character),
        Some(other) => {
            return Err(eyre!(
                "invalid --arm-override '{other}' (expected system|character)"
            ))
        }
    };

    tracing::info!(
        environment = ?cfg.environment,
        map_slug = %cfg.map_slug,
        max_enrichment = cfg.max_enrichment,
        dispatch_queue = cfg.dispatch_queue_capacity,
        suppression_s = cfg.startup_suppression.as_secs(),
        dry_run = cfg.dry_run,
        "wormwatch starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cache = Arc::new(Cache::default());
    let counters = Arc::new(Counters::default());
    let analytics = Arc::new(Analytics::new(AnalyticsConfig::default()));
    let http = Arc::new(HttpClient::new(HttpConfig::default())?);

    let registry = Registry::new(cache.clone());
    let dedup = Deduplicator::new(cache.clone(), cfg.dedup_ttl);
    let esi = EsiClient::new(http.clone(), cache.clone(), cfg.esi_base.clone());
    let map_api = MapApiClient::new(
        http.clone(),
        cfg.map_base.clone(),
        cfg.map_slug.clone(),
        cfg.map_token.clone(),
    );

    let license = license::spawn(
        LicenseConfig {
            base: cfg.license_base.clone(),
            license_key: cfg.license_key.clone(),
            api_token: cfg.api_token.clone(),
            refresh_interval: cfg.license_refresh_interval,
            dev_mode: cfg.environment.is_dev_or_test(),
        },
        shutdown_rx.clone(),
    );

    let notifier_handle = notifier::spawn(
        notifier::NotifierConfig {
            webhook_url: cfg.chat_webhook_url.clone(),
            channel_ids: cfg.channel_ids.clone(),
            queue_capacity: cfg.dispatch_queue_capacity,
            dry_run: cfg.dry_run,
        },
        counters.clone(),
        dedup.clone(),
        shutdown_rx.clone(),
    );

    let override_ctl = Arc::new(ValidationOverride::default());
    let kills = pipeline::spawn(
        PipelineContext {
            esi: esi.clone(),
            registry: registry.clone(),
            dedup: dedup.clone(),
            license: license.clone(),
            notifier: notifier_handle.clone(),
            counters: counters.clone(),
            analytics: analytics.clone(),
            features: cfg.features,
            override_ctl: override_ctl.clone(),
        },
        cfg.max_enrichment,
        shutdown_rx.clone(),
    );
    if let Some(mode) = arm_override {
        kills.arm_override(mode);
    }

    // Seed the registry from the map snapshot. A failed fetch is degraded,
    // not fatal: tracking fills in from the live stream, and the first-run
    // guard keeps the initial burst quiet either way.
    let snapshot_systems = match map_api.systems().await {
        Ok(systems) => systems,
        Err(err) => {
            tracing::warn!(error = %err, "map systems snapshot failed; starting empty");
            Vec::new()
        }
    };
    let snapshot_characters = match map_api.user_characters().await {
        Ok(characters) => characters,
        Err(err) => {
            tracing::warn!(error = %err, "map characters snapshot failed; starting empty");
            Vec::new()
        }
    };
    tracing::info!(
        systems = snapshot_systems.len(),
        characters = snapshot_characters.len(),
        "map snapshot loaded"
    );
    registry.load_snapshot(snapshot_systems, snapshot_characters);

    let handler_ctx = HandlerContext {
        registry: registry.clone(),
        dedup: dedup.clone(),
        license: license.clone(),
        notifier: notifier_handle.clone(),
        kills: kills.clone(),
        counters: counters.clone(),
        features: cfg.features,
        started_at: Instant::now(),
        suppression: cfg.startup_suppression,
    };

    let telemetry = Arc::new(Telemetry::new(
        TelemetryConfig {
            collection_interval: cfg.collection_interval,
            retention_period: cfg.retention_period,
            aggregation_window: cfg.aggregation_window,
            stream_count: 1,
        },
        counters.clone(),
    ));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(router::run(
        router::RouterConfig {
            map_base: cfg.map_base.clone(),
            map_slug: cfg.map_slug.clone(),
            map_token: cfg.map_token.clone(),
        },
        handler_ctx,
        counters.clone(),
        analytics.clone(),
        shutdown_rx.clone(),
    )));
    if let Some(feed_url) = cfg.kill_feed_url.clone() {
        tasks.push(tokio::spawn(pipeline::run_feed_poller(
            feed_url,
            kills.clone(),
            counters.clone(),
            shutdown_rx.clone(),
        )));
    }
    tasks.push(tokio::spawn(telemetry::run(
        telemetry.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(analytics::run_cleanup(
        analytics.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(run_cache_prune(
        cache.clone(),
        Duration::from_secs(args.cache_prune_seconds.max(10)),
        shutdown_rx.clone(),
    )));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("failed to listen for shutdown signal: {e}"))?;
    tracing::info!("shutdown signal received; draining");
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(Duration::from_secs(15), futures::future::join_all(tasks))
        .await
        .is_err()
    {
        tracing::warn!("tasks did not drain within the grace window");
    }

    if let Some(aggregation) = telemetry.aggregate() {
        tracing::info!(
            avg_score = aggregation.avg_score,
            events = aggregation.totals.events_processed,
            "final health aggregate"
        );
    }
    let sent = license.counters();
    let http_stats = http.stats();
    tracing::info!(
        system_notifications = sent.system,
        character_notifications = sent.character,
        kill_notifications = sent.killmail,
        http_requests = http_stats.requests.load(std::sync::atomic::Ordering::Relaxed),
        http_retries = http_stats.retries.load(std::sync::atomic::Ordering::Relaxed),
        "wormwatch stopped"
    );
    Ok(())
}

async fn run_cache_prune(
    cache: Arc<Cache>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = cache.prune();
                let stats = cache.stats();
                tracing::debug!(
                    evicted,
                    entries = cache.len(),
                    hits = stats.hits.load(std::sync::atomic::Ordering::Relaxed),
                    misses = stats.misses.load(std::sync::atomic::Ordering::Relaxed),
                    "cache prune sweep"
                );
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
