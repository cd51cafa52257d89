use eyre::{eyre, Result};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Test,
    Prod,
}

impl Environment {
    pub fn is_dev_or_test(self) -> bool {
        matches!(self, Environment::Dev | Environment::Test)
    }
}

impl FromStr for Environment {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "test" => Ok(Environment::Test),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(eyre!("unknown environment '{other}' (expected dev|test|prod)")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelIds {
    pub system: Option<String>,
    pub character: Option<String>,
    pub kill: Option<String>,
    pub rally: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    pub system_tracking: bool,
    pub character_tracking: bool,
    pub notifications: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            system_tracking: true,
            character_tracking: true,
            notifications: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub environment: Environment,

    pub esi_base: String,
    pub map_base: String,
    pub map_slug: String,
    pub map_token: String,

    pub chat_webhook_url: String,
    pub channel_ids: ChannelIds,

    pub license_base: String,
    pub license_key: String,
    pub api_token: String,
    pub license_refresh_interval: Duration,

    pub kill_feed_url: Option<String>,

    pub startup_suppression: Duration,
    pub collection_interval: Duration,
    pub retention_period: Duration,
    pub aggregation_window: Duration,
    pub dedup_ttl: Duration,

    pub max_enrichment: usize,
    pub dispatch_queue_capacity: usize,

    pub features: Features,

    pub dry_run: bool,
}

impl WatchConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        environment: Environment,
        esi_base: String,
        map_base: String,
        map_slug: String,
        map_token: String,
        chat_webhook_url: String,
        channel_ids: ChannelIds,
        license_base: String,
        license_key: String,
        api_token: String,
        license_refresh_interval_ms: u64,
        kill_feed_url: Option<String>,
        startup_suppression_seconds: u64,
        collection_interval_ms: u64,
        retention_period_ms: u64,
        aggregation_window_ms: u64,
        dedup_ttl_seconds: u64,
        max_enrichment: usize,
        dispatch_queue_capacity: usize,
        features: Features,
        dry_run: bool,
    ) -> Result<Self> {
        if map_base.is_empty() {
            return Err(eyre!(
                "no map base url provided. pass --map-base or set WORMWATCH_MAP_BASE"
            ));
        }
        if map_slug.is_empty() {
            return Err(eyre!(
                "no map slug provided. pass --map-slug or set WORMWATCH_MAP_SLUG"
            ));
        }
        if map_token.is_empty() {
            return Err(eyre!("no map token provided. set WORMWATCH_MAP_TOKEN"));
        }
        if chat_webhook_url.is_empty() && !dry_run {
            return Err(eyre!(
                "no chat webhook url provided. set WORMWATCH_WEBHOOK_URL or run with --dry-run"
            ));
        }
        if environment == Environment::Prod && (license_key.is_empty() || api_token.is_empty()) {
            return Err(eyre!("license key and api token are required outside dev/test"));
        }

        if chat_webhook_url.contains("/api/webhooks/") {
            tracing::warn!(
                "webhook URL embeds its token; prefer the WORMWATCH_WEBHOOK_URL env over flags that can land in shell history"
            );
        }

        if startup_suppression_seconds > 600 {
            tracing::warn!(
                startup_suppression_seconds,
                "startup suppression above 10 minutes; late map events will be silently dropped"
            );
        }

        let retention_period = Duration::from_millis(retention_period_ms.max(60_000));
        let aggregation_window = Duration::from_millis(aggregation_window_ms.max(1_000));
        if aggregation_window > retention_period {
            tracing::warn!(
                aggregation_window_ms,
                retention_period_ms,
                "aggregation window exceeds retention; clamping to retention"
            );
        }

        Ok(Self {
            environment,
            esi_base: default_if_empty(esi_base, "https://esi.evetech.net"),
            map_base: map_base.trim_end_matches('/').to_string(),
            map_slug,
            map_token,
            chat_webhook_url,
            channel_ids,
            license_base: default_if_empty(license_base, "https://license.wanderer.example"),
            license_key,
            api_token,
            license_refresh_interval: Duration::from_millis(license_refresh_interval_ms.max(1_000)),
            kill_feed_url: kill_feed_url.filter(|u| !u.is_empty()),
            startup_suppression: Duration::from_secs(startup_suppression_seconds),
            collection_interval: Duration::from_millis(collection_interval_ms.max(1_000)),
            retention_period,
            aggregation_window: aggregation_window.min(retention_period),
            dedup_ttl: Duration::from_secs(dedup_ttl_seconds.max(60)),
            max_enrichment: max_enrichment.max(1),
            dispatch_queue_capacity: dispatch_queue_capacity.max(1),
            features,
            dry_run,
        })
    }
}

fn default_if_empty(value: String, default: &str) -> String {
    let trimmed = value.trim_end_matches('/').to_string();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed
    }
}
