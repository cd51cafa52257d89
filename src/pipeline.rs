use crate::analytics::{Analytics, EventObservation};
use crate::config::Features;
use crate::dedup::{DedupKind, DedupOutcome, Deduplicator, KillStatus, SkipReason};
use crate::esi::{EsiClient, EsiKillmail};
use crate::killmail::{format_isk, normalise, parse_feed_envelope, PendingKill, RawKillmail};
use crate::license::{CountKind, LicenseHandle};
use crate::notifier::{DispatchHandle, Embed, EmbedField, EnqueueError, Notification, NotificationKind};
use crate::registry::Registry;
use crate::telemetry::Counters;
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};

/// Hard deadline on enrichment work for one killmail.
const ENRICH_DEADLINE: Duration = Duration::from_secs(30);
/// Attacker lookups run at most this many at a time.
const ATTACKER_CONCURRENCY: usize = 4;
/// Ingest buffer ahead of enrichment.
const INGEST_CAPACITY: usize = 1024;
/// An armed override decays if unconsumed.
const OVERRIDE_TTL: Duration = Duration::from_secs(5 * 60);

const SOURCE: &str = "killmail";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideMode {
    System,
    Character,
}

/// Single-shot operator control: forces the next killmail through the chosen
/// notification path. Consumed on first use or after the TTL, whichever
/// comes first.
#[derive(Debug)]
pub struct ValidationOverride {
    slot: Mutex<Option<(OverrideMode, Instant)>>,
    ttl: Duration,
}

impl Default for ValidationOverride {
    fn default() -> Self {
        Self::new(OVERRIDE_TTL)
    }
}

impl ValidationOverride {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            ttl,
        }
    }

    pub fn arm(&self, mode: OverrideMode) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some((mode, Instant::now()));
        tracing::info!(mode = ?mode, ttl_s = self.ttl.as_secs(), "validation override armed");
    }

    /// Take the armed mode if it has not expired. Either way the slot is
    /// empty afterwards.
    pub fn consume(&self) -> Option<OverrideMode> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some((mode, armed_at)) if armed_at.elapsed() <= self.ttl => Some(mode),
            Some(_) => {
                tracing::debug!("validation override expired unconsumed");
                None
            }
            None => None,
        }
    }

    #[allow(dead_code)]
    pub fn armed(&self) -> Option<OverrideMode> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match *slot {
            Some((mode, armed_at)) if armed_at.elapsed() <= self.ttl => Some(mode),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillRelevance {
    TrackedCharacter,
    TrackedSystem,
    ForcedCharacter,
    ForcedSystem,
    NotRelevant,
}

/// Pure filter decision. A consumed override wins outright; otherwise a
/// tracked character beats a tracked system for formatting purposes.
pub fn assess_relevance(
    victim_tracked: bool,
    attacker_tracked: bool,
    system_tracked: bool,
    forced: Option<OverrideMode>,
) -> KillRelevance {
    match forced {
        Some(OverrideMode::System) => KillRelevance::ForcedSystem,
        Some(OverrideMode::Character) => KillRelevance::ForcedCharacter,
        None => {
            if victim_tracked || attacker_tracked {
                KillRelevance::TrackedCharacter
            } else if system_tracked {
                KillRelevance::TrackedSystem
            } else {
                KillRelevance::NotRelevant
            }
        }
    }
}

/// Catalog decorations resolved around the killmail body. Every field is
/// optional: lookups that fail degrade the notification, they never drop it.
#[derive(Debug, Clone, Default)]
pub struct Decorations {
    pub victim_name: Option<String>,
    pub victim_corporation: Option<String>,
    pub victim_alliance: Option<String>,
    pub victim_ship: Option<String>,
    pub system_name: Option<String>,
    pub final_blow_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnrichedKill {
    pub pending: PendingKill,
    pub body: EsiKillmail,
    pub decorations: Decorations,
}

#[derive(Debug)]
pub enum EnrichError {
    /// The killmail body itself could not be fetched; the kill is dropped.
    Body(String),
}

async fn enrich(esi: &EsiClient, pending: PendingKill) -> Result<EnrichedKill, EnrichError> {
    let started = Instant::now();
    let body = match tokio::time::timeout(
        ENRICH_DEADLINE,
        esi.get_killmail(pending.killmail_id, &pending.hash),
    )
    .await
    {
        Ok(Ok(body)) => body,
        Ok(Err(err)) => return Err(EnrichError::Body(err.to_string())),
        Err(_) => return Err(EnrichError::Body("enrichment deadline exceeded".to_string())),
    };

    let remaining = ENRICH_DEADLINE.saturating_sub(started.elapsed());
    let decorations = match tokio::time::timeout(remaining, decorate(esi, &body)).await {
        Ok(decorations) => decorations,
        Err(_) => {
            tracing::warn!(
                killmail_id = pending.killmail_id,
                "enrichment deadline hit while decorating; notification degraded"
            );
            Decorations::default()
        }
    };

    Ok(EnrichedKill {
        pending,
        body,
        decorations,
    })
}

async fn decorate(esi: &EsiClient, body: &EsiKillmail) -> Decorations {
    let victim = &body.victim;

    let (victim_name, victim_corporation, victim_alliance, victim_ship, system_name) = tokio::join!(
        lookup_character(esi, victim.character_id),
        lookup_corporation(esi, victim.corporation_id),
        lookup_alliance(esi, victim.alliance_id),
        lookup_type(esi, victim.ship_type_id),
        async { esi.get_system(body.solar_system_id).await.ok().map(|s| s.name) },
    );

    // Resolve every attacker character, a few at a time, and pull the final
    // blow's name out of the same pass.
    let final_blow_id = body
        .attackers
        .iter()
        .find(|a| a.final_blow)
        .and_then(|a| a.character_id);
    let attacker_ids: Vec<u64> = body.attackers.iter().filter_map(|a| a.character_id).collect();
    let resolved: Vec<(u64, String)> = futures::stream::iter(attacker_ids)
        .map(|id| {
            let esi = esi.clone();
            async move { esi.get_character(id).await.ok().map(|c| (id, c.name)) }
        })
        .buffer_unordered(ATTACKER_CONCURRENCY)
        .filter_map(|resolved| async move { resolved })
        .collect()
        .await;

    let final_blow_name =
        final_blow_id.and_then(|id| resolved.iter().find(|(rid, _)| *rid == id).map(|(_, n)| n.clone()));

    Decorations {
        victim_name,
        victim_corporation,
        victim_alliance,
        victim_ship,
        system_name,
        final_blow_name,
    }
}

async fn lookup_character(esi: &EsiClient, id: Option<u64>) -> Option<String> {
    let id = id?;
    esi.get_character(id).await.ok().map(|c| c.name)
}

async fn lookup_corporation(esi: &EsiClient, id: Option<u64>) -> Option<String> {
    let id = id?;
    esi.get_corporation(id).await.ok().map(|c| c.name)
}

async fn lookup_alliance(esi: &EsiClient, id: Option<u64>) -> Option<String> {
    let id = id?;
    esi.get_alliance(id).await.ok().map(|a| a.name)
}

async fn lookup_type(esi: &EsiClient, id: Option<u64>) -> Option<String> {
    let id = id?;
    esi.get_type(id).await.ok().map(|t| t.name)
}

/// Render the kill as a webhook notification.
pub fn build_kill_notification(kill: &EnrichedKill, relevance: KillRelevance) -> Notification {
    let body = &kill.body;
    let deco = &kill.decorations;
    let system = deco
        .system_name
        .clone()
        .unwrap_or_else(|| body.solar_system_id.to_string());
    let victim = deco.victim_name.clone().unwrap_or_else(|| "Unknown".to_string());
    let ship = deco.victim_ship.clone().unwrap_or_else(|| "ship".to_string());

    let content = match relevance {
        KillRelevance::TrackedCharacter | KillRelevance::ForcedCharacter => {
            format!("{victim} lost a {ship} in {system}")
        }
        _ => format!("Kill in {system}: {victim} lost a {ship}"),
    };

    let mut fields = vec![EmbedField {
        name: "System".to_string(),
        value: system,
        inline: true,
    }];
    if let Some(value) = kill.pending.total_value {
        fields.push(EmbedField {
            name: "Value".to_string(),
            value: format_isk(value),
            inline: true,
        });
    }
    if let Some(points) = kill.pending.points {
        fields.push(EmbedField {
            name: "Points".to_string(),
            value: points.to_string(),
            inline: true,
        });
    }
    fields.push(EmbedField {
        name: "Attackers".to_string(),
        value: body.attackers.len().to_string(),
        inline: true,
    });
    if let Some(final_blow) = &deco.final_blow_name {
        fields.push(EmbedField {
            name: "Final blow".to_string(),
            value: final_blow.clone(),
            inline: true,
        });
    }
    if let Some(corp) = &deco.victim_corporation {
        let affiliation = match &deco.victim_alliance {
            Some(alliance) => format!("{corp} / {alliance}"),
            None => corp.clone(),
        };
        fields.push(EmbedField {
            name: "Victim corp".to_string(),
            value: affiliation,
            inline: true,
        });
    }

    Notification {
        kind: NotificationKind::Kill,
        content,
        embeds: vec![Embed {
            title: Some(format!("Killmail {}", body.killmail_id)),
            description: Some(format!(
                "https://zkillboard.com/kill/{}/",
                body.killmail_id
            )),
            fields,
        }],
        fingerprint: Some(body.killmail_id),
    }
}

#[derive(Clone)]
pub struct PipelineContext {
    pub esi: EsiClient,
    pub registry: Registry,
    pub dedup: Deduplicator,
    pub license: LicenseHandle,
    pub notifier: DispatchHandle,
    pub counters: Arc<Counters>,
    pub analytics: Arc<Analytics>,
    pub features: Features,
    pub override_ctl: Arc<ValidationOverride>,
}

/// Producer-side handle for the killmail pipeline.
#[derive(Clone)]
pub struct KillmailHandle {
    tx: mpsc::Sender<RawKillmail>,
    override_ctl: Arc<ValidationOverride>,
}

impl KillmailHandle {
    pub fn ingest(&self, raw: RawKillmail) -> bool {
        match self.tx.try_send(raw) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(raw)) => {
                tracing::warn!(killmail_id = raw.killmail_id, "ingest queue full; kill dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn arm_override(&self, mode: OverrideMode) {
        self.override_ctl.arm(mode);
    }
}

/// Spawn the pipeline worker: pulls raw kills off the ingest queue and runs
/// each through dedup → enrich → filter → format → dispatch, several kills
/// in flight at once. Ordering across killmails is not preserved; each kill's
/// own stages are strictly ordered.
pub fn spawn(
    ctx: PipelineContext,
    max_enrichment: usize,
    mut shutdown: watch::Receiver<bool>,
) -> KillmailHandle {
    let (tx, mut rx) = mpsc::channel::<RawKillmail>(INGEST_CAPACITY);
    let handle = KillmailHandle {
        tx,
        override_ctl: ctx.override_ctl.clone(),
    };

    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(max_enrichment.max(1)));
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(raw) => {
                        let permit = match semaphore.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            process_one(&ctx, raw).await;
                            drop(permit);
                        });
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Wait for in-flight enrichment to settle before exiting.
        let _ = semaphore.acquire_many(max_enrichment.max(1) as u32).await;
        tracing::debug!("killmail pipeline stopped");
    });

    handle
}

async fn process_one(ctx: &PipelineContext, raw: RawKillmail) {
    ctx.counters.kills_received.fetch_add(1, Ordering::Relaxed);
    let pending = normalise(raw);
    let killmail_id = pending.killmail_id;
    let received_at = pending.received_at;

    let outcome = ctx.dedup.check(DedupKind::Kill, killmail_id);
    ctx.counters.record_dedup(outcome == DedupOutcome::Duplicate);
    if outcome == DedupOutcome::Duplicate {
        skip(ctx, killmail_id, received_at, SkipReason::Duplicate);
        return;
    }

    let enriched = match enrich(&ctx.esi, pending).await {
        Ok(enriched) => enriched,
        Err(EnrichError::Body(reason)) => {
            ctx.counters.upstream_errors.fetch_add(1, Ordering::Relaxed);
            ctx.counters.kills_skipped.fetch_add(1, Ordering::Relaxed);
            ctx.dedup
                .mark_kill_status(killmail_id, KillStatus::failed(SkipReason::UpstreamUnavailable));
            ctx.analytics.record(
                SOURCE,
                EventObservation {
                    success: false,
                    latency: received_at.elapsed(),
                    error_type: Some("enrichment".to_string()),
                    payload_complete: false,
                },
            );
            tracing::warn!(killmail_id, reason, "killmail body unavailable; dropped");
            return;
        }
    };

    let forced = ctx.override_ctl.consume();
    let victim_tracked = enriched
        .body
        .victim
        .character_id
        .is_some_and(|id| ctx.registry.is_tracked_character(id));
    let attacker_tracked = enriched
        .body
        .attackers
        .iter()
        .filter_map(|a| a.character_id)
        .any(|id| ctx.registry.is_tracked_character(id));
    let system_tracked = ctx.registry.is_tracked_system(enriched.body.solar_system_id);

    let relevance = assess_relevance(victim_tracked, attacker_tracked, system_tracked, forced);
    if relevance == KillRelevance::NotRelevant {
        skip(ctx, killmail_id, received_at, SkipReason::NoTrackedEntity);
        return;
    }
    if forced.is_some() {
        tracing::info!(killmail_id, relevance = ?relevance, "validation override consumed");
    }

    // Tracked entities know their own names; prefer those over catalog
    // lookups that may have failed or lag behind a custom label.
    let mut enriched = enriched;
    if let Some(tracked) = ctx.registry.get_system(enriched.body.solar_system_id) {
        enriched.decorations.system_name = Some(tracked.display_name().to_string());
    }
    if enriched.decorations.victim_name.is_none() {
        if let Some(id) = enriched.body.victim.character_id {
            if let Some(tracked) = ctx.registry.get_character(id) {
                enriched.decorations.victim_name = Some(tracked.name);
            }
        }
    }

    if !ctx.features.notifications {
        skip(ctx, killmail_id, received_at, SkipReason::FeatureDisabled);
        return;
    }
    if !ctx.license.notifications_enabled().await {
        skip(ctx, killmail_id, received_at, SkipReason::NotificationsDisabled);
        return;
    }

    let notification = build_kill_notification(&enriched, relevance);
    match ctx.notifier.enqueue(notification) {
        Ok(()) => {
            ctx.counters.kills_notified.fetch_add(1, Ordering::Relaxed);
            ctx.license.count_notification(CountKind::Killmail);
            ctx.dedup.mark_kill_status(killmail_id, KillStatus::notified());
            ctx.analytics.record(
                SOURCE,
                EventObservation {
                    success: true,
                    latency: received_at.elapsed(),
                    error_type: None,
                    payload_complete: true,
                },
            );
            tracing::info!(killmail_id, relevance = ?relevance, "kill notification queued");
        }
        Err(EnqueueError::Full) => {
            ctx.counters
                .notifications_backpressure
                .fetch_add(1, Ordering::Relaxed);
            skip(ctx, killmail_id, received_at, SkipReason::Backpressure);
        }
        Err(EnqueueError::Closed) => {
            ctx.counters.internal_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(killmail_id, "dispatcher gone; kill dropped");
        }
    }
}

fn skip(ctx: &PipelineContext, killmail_id: u64, received_at: Instant, reason: SkipReason) {
    ctx.counters.kills_skipped.fetch_add(1, Ordering::Relaxed);
    ctx.dedup
        .mark_kill_status(killmail_id, KillStatus::skipped(reason));
    ctx.analytics.record(
        SOURCE,
        EventObservation {
            success: true,
            latency: received_at.elapsed(),
            error_type: None,
            payload_complete: true,
        },
    );
    tracing::info!(killmail_id, reason = reason.as_str(), "kill skipped");
}

/// Long-poll the external kill feed and push envelopes into the pipeline.
pub async fn run_feed_poller(
    feed_url: String,
    handle: KillmailHandle,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "failed to build kill feed client");
            return;
        }
    };

    let mut delay = Duration::from_millis(200);
    loop {
        if *shutdown.borrow() {
            break;
        }

        let poll = async {
            let resp = client.get(&feed_url).send().await?;
            resp.json::<serde_json::Value>().await
        };

        tokio::select! {
            result = poll => match result {
                Ok(body) => {
                    delay = Duration::from_millis(200);
                    if let Some(raw) = parse_feed_envelope(&body) {
                        handle.ingest(raw);
                    }
                }
                Err(err) => {
                    counters.upstream_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %err, sleep_ms = delay.as_millis() as u64, "kill feed poll failed; backing off");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("kill feed poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::AnalyticsConfig;
    use crate::cache::{keys as cache_keys, Cache, CacheValue};
    use crate::dedup::KillOutcome;
    use crate::esi::{EsiAttacker, EsiVictim};
    use crate::http::{HttpClient, HttpConfig};
    use crate::killmail::ZkbSummary;
    use crate::license::{self, LicenseConfig};
    use crate::notifier;
    use crate::registry::TrackedSystem;
    use serde_json::json;

    fn pending() -> PendingKill {
        normalise(RawKillmail {
            killmail_id: 100,
            zkb: ZkbSummary {
                hash: "h".to_string(),
                total_value: Some(2_450_000_000.0),
                points: Some(25),
            },
        })
    }

    fn body() -> EsiKillmail {
        EsiKillmail {
            killmail_id: 100,
            killmail_time: "2025-11-02T12:00:00Z".to_string(),
            solar_system_id: 31_000_001,
            victim: EsiVictim {
                character_id: Some(95_000_001),
                corporation_id: Some(1_000_001),
                alliance_id: None,
                ship_type_id: Some(670),
            },
            attackers: vec![
                EsiAttacker {
                    character_id: Some(95_000_002),
                    corporation_id: None,
                    alliance_id: None,
                    ship_type_id: Some(17_738),
                    final_blow: true,
                },
                EsiAttacker {
                    character_id: None,
                    corporation_id: None,
                    alliance_id: None,
                    ship_type_id: None,
                    final_blow: false,
                },
            ],
        }
    }

    fn enriched() -> EnrichedKill {
        EnrichedKill {
            pending: pending(),
            body: body(),
            decorations: Decorations {
                victim_name: Some("Pilot One".to_string()),
                victim_corporation: Some("Corp".to_string()),
                victim_alliance: None,
                victim_ship: Some("Capsule".to_string()),
                system_name: Some("J123456".to_string()),
                final_blow_name: Some("Pilot Two".to_string()),
            },
        }
    }

    #[test]
    fn relevance_prefers_forced_then_character_then_system() {
        assert_eq!(
            assess_relevance(false, false, false, Some(OverrideMode::System)),
            KillRelevance::ForcedSystem
        );
        assert_eq!(
            assess_relevance(true, false, true, None),
            KillRelevance::TrackedCharacter
        );
        assert_eq!(
            assess_relevance(false, true, false, None),
            KillRelevance::TrackedCharacter
        );
        assert_eq!(
            assess_relevance(false, false, true, None),
            KillRelevance::TrackedSystem
        );
        assert_eq!(
            assess_relevance(false, false, false, None),
            KillRelevance::NotRelevant
        );
    }

    #[test]
    fn override_is_single_shot() {
        let ctl = ValidationOverride::new(Duration::from_secs(300));
        assert_eq!(ctl.consume(), None);

        ctl.arm(OverrideMode::System);
        assert_eq!(ctl.armed(), Some(OverrideMode::System));
        assert_eq!(ctl.consume(), Some(OverrideMode::System));
        // Consumed: the next kill reverts to default filtering.
        assert_eq!(ctl.consume(), None);
        assert_eq!(ctl.armed(), None);
    }

    #[test]
    fn override_decays_after_ttl() {
        let ctl = ValidationOverride::new(Duration::from_millis(0));
        ctl.arm(OverrideMode::Character);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(ctl.armed(), None);
        assert_eq!(ctl.consume(), None);
    }

    #[test]
    fn rearming_replaces_the_slot() {
        let ctl = ValidationOverride::new(Duration::from_secs(300));
        ctl.arm(OverrideMode::System);
        ctl.arm(OverrideMode::Character);
        assert_eq!(ctl.consume(), Some(OverrideMode::Character));
    }

    #[test]
    fn kill_notification_carries_fingerprint_and_fields() {
        let notification = build_kill_notification(&enriched(), KillRelevance::TrackedSystem);
        assert_eq!(notification.kind, NotificationKind::Kill);
        assert_eq!(notification.fingerprint, Some(100));
        assert!(notification.content.contains("J123456"));

        let embed = &notification.embeds[0];
        assert_eq!(embed.title.as_deref(), Some("Killmail 100"));
        let names: Vec<&str> = embed.fields.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"System"));
        assert!(names.contains(&"Value"));
        assert!(names.contains(&"Attackers"));
        assert!(names.contains(&"Final blow"));

        let value = embed
            .fields
            .iter()
            .find(|f| f.name == "Value")
            .map(|f| f.value.as_str());
        assert_eq!(value, Some("2.5b ISK"));
    }

    #[test]
    fn character_path_leads_with_the_victim() {
        let notification =
            build_kill_notification(&enriched(), KillRelevance::TrackedCharacter);
        assert!(notification.content.starts_with("Pilot One"));
    }

    #[test]
    fn degraded_decorations_fall_back_to_ids() {
        let mut kill = enriched();
        kill.decorations = Decorations::default();
        let notification = build_kill_notification(&kill, KillRelevance::TrackedSystem);
        assert!(notification.content.contains("31000001"));
        assert!(notification.content.contains("Unknown"));
    }

    struct PipelineFixture {
        ctx: PipelineContext,
        notifications: tokio::sync::mpsc::Receiver<Notification>,
        cache: Arc<Cache>,
        _shutdown_tx: watch::Sender<bool>,
    }

    async fn pipeline_fixture() -> PipelineFixture {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cache = Arc::new(Cache::default());
        let registry = Registry::new(cache.clone());
        let dedup = Deduplicator::new(cache.clone(), Duration::from_secs(86_400));
        let counters = Arc::new(Counters::default());
        let analytics = Arc::new(crate::analytics::Analytics::new(AnalyticsConfig::default()));
        let (notifier_handle, notifications) = notifier::test_handle(16);
        let license = license::spawn(
            LicenseConfig {
                base: String::new(),
                license_key: String::new(),
                api_token: String::new(),
                refresh_interval: Duration::from_secs(3600),
                dev_mode: true,
            },
            shutdown_rx,
        );
        // Let the license task take its first (sentinel) tick.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let http = Arc::new(HttpClient::new(HttpConfig::default()).unwrap());
        let esi = EsiClient::new(http, cache.clone(), "https://esi.example.net".to_string());

        PipelineFixture {
            ctx: PipelineContext {
                esi,
                registry,
                dedup,
                license,
                notifier: notifier_handle,
                counters,
                analytics,
                features: Features::default(),
                override_ctl: Arc::new(ValidationOverride::default()),
            },
            notifications,
            cache,
            _shutdown_tx: shutdown_tx,
        }
    }

    /// Seed the catalog cache so enrichment never leaves the process.
    fn seed_catalog(
        cache: &Cache,
        killmail_id: u64,
        solar_system_id: u32,
        victim_id: u64,
        attacker_id: u64,
    ) {
        cache.put(
            &cache_keys::esi("killmail", &killmail_id.to_string()),
            CacheValue::Json(json!({
                "killmail_id": killmail_id,
                "killmail_time": "2025-11-02T12:00:00Z",
                "solar_system_id": solar_system_id,
                "victim": { "character_id": victim_id },
                "attackers": [ { "character_id": attacker_id, "final_blow": true } ]
            })),
            None,
        );
        cache.put(
            &cache_keys::esi("character", &victim_id.to_string()),
            CacheValue::Json(json!({ "name": "Victim" })),
            None,
        );
        cache.put(
            &cache_keys::esi("character", &attacker_id.to_string()),
            CacheValue::Json(json!({ "name": "Attacker" })),
            None,
        );
        cache.put(
            &cache_keys::esi("system", &solar_system_id.to_string()),
            CacheValue::Json(json!({ "name": "J123456" })),
            None,
        );
    }

    fn raw(killmail_id: u64, hash: &str) -> RawKillmail {
        RawKillmail {
            killmail_id,
            zkb: ZkbSummary {
                hash: hash.to_string(),
                total_value: Some(1_000_000.0),
                points: Some(1),
            },
        }
    }

    fn tracked(id: u32, name: &str) -> TrackedSystem {
        TrackedSystem {
            solar_system_id: id,
            name: name.to_string(),
            custom_name: None,
            class_title: None,
            statics: Vec::new(),
            region_name: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn duplicate_killmail_notifies_once_and_records_the_skip() {
        let mut fx = pipeline_fixture().await;
        fx.ctx.registry.add_system(tracked(31_000_001, "J123456"));
        seed_catalog(&fx.cache, 100, 31_000_001, 95_000_001, 95_000_002);

        process_one(&fx.ctx, raw(100, "h")).await;
        let sent = fx.notifications.try_recv().expect("first arrival notifies");
        assert_eq!(sent.fingerprint, Some(100));
        assert_eq!(fx.ctx.dedup.kill_status(100), Some(KillStatus::notified()));

        // Same fingerprint within the TTL: no second notification, and the
        // arrival is recorded as a duplicate skip.
        process_one(&fx.ctx, raw(100, "h")).await;
        assert!(fx.notifications.try_recv().is_err());
        let status = fx.ctx.dedup.kill_status(100).unwrap();
        assert_eq!(status.status, KillOutcome::Skipped);
        assert_eq!(status.reason, Some(SkipReason::Duplicate));
        assert_eq!(fx.ctx.counters.dedup_duplicates.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn untracked_kill_skips_but_the_fingerprint_still_marks() {
        let mut fx = pipeline_fixture().await;
        // Nothing is tracked; the kill sits in an untracked k-space system.
        seed_catalog(&fx.cache, 101, 30_000_999, 95_000_001, 95_000_002);

        process_one(&fx.ctx, raw(101, "h2")).await;
        assert!(fx.notifications.try_recv().is_err());
        let status = fx.ctx.dedup.kill_status(101).unwrap();
        assert_eq!(status.status, KillOutcome::Skipped);
        assert_eq!(status.reason, Some(SkipReason::NoTrackedEntity));
        // The fingerprint was still consumed: a later arrival is a duplicate.
        assert_eq!(
            fx.ctx.dedup.check(DedupKind::Kill, 101),
            DedupOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn armed_override_forces_exactly_one_kill_through() {
        let mut fx = pipeline_fixture().await;
        seed_catalog(&fx.cache, 102, 30_000_999, 95_000_001, 95_000_002);
        seed_catalog(&fx.cache, 103, 30_000_999, 95_000_001, 95_000_002);

        fx.ctx.override_ctl.arm(OverrideMode::System);
        process_one(&fx.ctx, raw(102, "h3")).await;
        let sent = fx.notifications.try_recv().expect("forced kill notifies");
        assert_eq!(sent.fingerprint, Some(102));

        // The next kill reverts to default filtering.
        process_one(&fx.ctx, raw(103, "h4")).await;
        assert!(fx.notifications.try_recv().is_err());
        assert_eq!(
            fx.ctx.dedup.kill_status(103).unwrap().reason,
            Some(SkipReason::NoTrackedEntity)
        );
    }
}
