use crate::config::Features;
use crate::dedup::{DedupKind, DedupOutcome, Deduplicator};
use crate::events::{
    categorise, extract_character, extract_character_id, extract_rally, extract_system,
    extract_system_id, EventKind, MapEvent, RallyPoint,
};
use crate::killmail::parse_feed_envelope;
use crate::license::{CountKind, LicenseHandle};
use crate::notifier::{DispatchHandle, Embed, EmbedField, Notification, NotificationKind};
use crate::pipeline::KillmailHandle;
use crate::registry::{AddOutcome, Registry, TrackedCharacter, TrackedSystem, UpdateOutcome};
use crate::telemetry::Counters;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Handled,
    Ignored,
    Error(String),
}

#[derive(Clone)]
pub struct HandlerContext {
    pub registry: Registry,
    pub dedup: Deduplicator,
    pub license: LicenseHandle,
    pub notifier: DispatchHandle,
    pub kills: KillmailHandle,
    pub counters: Arc<Counters>,
    pub features: Features,
    pub started_at: Instant,
    pub suppression: Duration,
}

impl HandlerContext {
    /// Startup suppression hides the notification flood from the initial
    /// snapshot reconcile.
    fn suppressed(&self) -> bool {
        self.started_at.elapsed() < self.suppression
    }
}

/// Route one validated event to its handler. Handler errors are reported to
/// the caller for logging; they never abort the stream.
pub async fn handle_event(ctx: &HandlerContext, event: &MapEvent) -> HandlerOutcome {
    match categorise(&event.event_type) {
        EventKind::SystemAdded => {
            if !ctx.features.system_tracking {
                return HandlerOutcome::Ignored;
            }
            system_added(ctx, event).await
        }
        EventKind::SystemRemoved => {
            if !ctx.features.system_tracking {
                return HandlerOutcome::Ignored;
            }
            system_removed(ctx, event)
        }
        EventKind::SystemUpdated => {
            if !ctx.features.system_tracking {
                return HandlerOutcome::Ignored;
            }
            system_updated(ctx, event).await
        }
        EventKind::CharacterAdded => {
            if !ctx.features.character_tracking {
                return HandlerOutcome::Ignored;
            }
            character_added(ctx, event).await
        }
        EventKind::CharacterRemoved => {
            if !ctx.features.character_tracking {
                return HandlerOutcome::Ignored;
            }
            character_removed(ctx, event)
        }
        EventKind::CharacterUpdated => {
            if !ctx.features.character_tracking {
                return HandlerOutcome::Ignored;
            }
            character_updated(ctx, event).await
        }
        EventKind::RallyAdded => rally_added(ctx, event).await,
        EventKind::RallyRemoved => {
            tracing::info!(event_id = %event.id, "rally point removed");
            HandlerOutcome::Handled
        }
        EventKind::Reserved => HandlerOutcome::Ignored,
        EventKind::Connected => {
            let server_time = event
                .payload
                .get("server_time")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            tracing::info!(map_id = %event.map_id, server_time, "map stream connected");
            HandlerOutcome::Handled
        }
        EventKind::MapKill => match parse_feed_envelope(&event.payload) {
            Some(raw) => {
                ctx.kills.ingest(raw);
                HandlerOutcome::Handled
            }
            None => HandlerOutcome::Error("map_kill payload missing killmail identity".to_string()),
        },
        EventKind::Unknown => {
            tracing::warn!(event_type = %event.event_type, "unknown event type; ignoring");
            HandlerOutcome::Ignored
        }
    }
}

async fn system_added(ctx: &HandlerContext, event: &MapEvent) -> HandlerOutcome {
    let system = match extract_system(&event.payload) {
        Ok(system) => system,
        Err(err) => return HandlerOutcome::Error(err.to_string()),
    };
    let id = system.solar_system_id;
    let notification = system_notification(&system);

    match ctx.registry.add_system(system) {
        AddOutcome::AlreadyTracked => {
            tracing::debug!(solar_system_id = id, "system already tracked");
            HandlerOutcome::Handled
        }
        AddOutcome::Added { collection_was_empty } => {
            let decision = notify_added(
                ctx,
                DedupKind::System,
                u64::from(id),
                Some(CountKind::System),
                collection_was_empty,
                notification,
            )
            .await;
            tracing::info!(solar_system_id = id, decision, "system added");
            HandlerOutcome::Handled
        }
    }
}

fn system_removed(ctx: &HandlerContext, event: &MapEvent) -> HandlerOutcome {
    let id = match extract_system_id(&event.payload) {
        Ok(id) => id,
        Err(err) => return HandlerOutcome::Error(err.to_string()),
    };
    let removed = ctx.registry.remove_system(id);
    tracing::info!(solar_system_id = id, removed, "system removed");
    HandlerOutcome::Handled
}

async fn system_updated(ctx: &HandlerContext, event: &MapEvent) -> HandlerOutcome {
    let system = match extract_system(&event.payload) {
        Ok(system) => system,
        Err(err) => return HandlerOutcome::Error(err.to_string()),
    };
    let id = system.solar_system_id;
    let notification = system_notification(&system);

    match ctx.registry.update_system(system) {
        UpdateOutcome::Updated => {
            tracing::debug!(solar_system_id = id, "system metadata updated");
            HandlerOutcome::Handled
        }
        // Update of an unknown system behaves as an add, notification policy
        // included.
        UpdateOutcome::Inserted { collection_was_empty } => {
            let decision = notify_added(
                ctx,
                DedupKind::System,
                u64::from(id),
                Some(CountKind::System),
                collection_was_empty,
                notification,
            )
            .await;
            tracing::info!(solar_system_id = id, decision, "system upserted via update");
            HandlerOutcome::Handled
        }
    }
}

async fn character_added(ctx: &HandlerContext, event: &MapEvent) -> HandlerOutcome {
    let character = match extract_character(&event.payload) {
        Ok(character) => character,
        Err(err) => return HandlerOutcome::Error(err.to_string()),
    };
    let id = character.eve_id;
    let notification = character_notification(&character);

    match ctx.registry.add_character(character) {
        AddOutcome::AlreadyTracked => {
            tracing::debug!(eve_id = id, "character already tracked");
            HandlerOutcome::Handled
        }
        AddOutcome::Added { collection_was_empty } => {
            let decision = notify_added(
                ctx,
                DedupKind::Character,
                id,
                Some(CountKind::Character),
                collection_was_empty,
                notification,
            )
            .await;
            tracing::info!(eve_id = id, decision, "character added");
            HandlerOutcome::Handled
        }
    }
}

fn character_removed(ctx: &HandlerContext, event: &MapEvent) -> HandlerOutcome {
    let id = match extract_character_id(&event.payload) {
        Ok(id) => id,
        Err(err) => return HandlerOutcome::Error(err.to_string()),
    };
    let removed = ctx.registry.remove_character(id);
    tracing::info!(eve_id = id, removed, "character removed");
    HandlerOutcome::Handled
}

async fn character_updated(ctx: &HandlerContext, event: &MapEvent) -> HandlerOutcome {
    let character = match extract_character(&event.payload) {
        Ok(character) => character,
        Err(err) => return HandlerOutcome::Error(err.to_string()),
    };
    let id = character.eve_id;
    let notification = character_notification(&character);

    match ctx.registry.update_character(character) {
        UpdateOutcome::Updated => {
            tracing::debug!(eve_id = id, "character updated");
            HandlerOutcome::Handled
        }
        UpdateOutcome::Inserted { collection_was_empty } => {
            let decision = notify_added(
                ctx,
                DedupKind::Character,
                id,
                Some(CountKind::Character),
                collection_was_empty,
                notification,
            )
            .await;
            tracing::info!(eve_id = id, decision, "character upserted via update");
            HandlerOutcome::Handled
        }
    }
}

async fn rally_added(ctx: &HandlerContext, event: &MapEvent) -> HandlerOutcome {
    let rally = match extract_rally(&event.payload) {
        Ok(rally) => rally,
        Err(err) => return HandlerOutcome::Error(err.to_string()),
    };
    let id = rally.id;
    let notification = rally_notification(&rally);
    let decision = notify_added(ctx, DedupKind::Rally, id, None, false, notification).await;
    tracing::info!(rally_point_id = id, decision, "rally point added");
    HandlerOutcome::Handled
}

/// Shared notification policy for add-like events. The checks run in order;
/// the first failing one names the decision for the caller's log line.
async fn notify_added(
    ctx: &HandlerContext,
    kind: DedupKind,
    id: u64,
    count: Option<CountKind>,
    collection_was_empty: bool,
    notification: Notification,
) -> &'static str {
    if ctx.suppressed() {
        return "suppressed";
    }

    let outcome = ctx.dedup.check(kind, id);
    ctx.counters.record_dedup(outcome == DedupOutcome::Duplicate);
    if outcome == DedupOutcome::Duplicate {
        return "duplicate";
    }

    if !ctx.features.notifications {
        return "feature_disabled";
    }
    if !ctx.license.notifications_enabled().await {
        return "notifications_disabled";
    }

    // First-run guard: an add into a previously empty collection is the
    // initial sync, not news.
    if collection_was_empty {
        return "first_run";
    }

    match ctx.notifier.enqueue(notification) {
        Ok(()) => {
            if let Some(count) = count {
                ctx.license.count_notification(count);
            }
            "notified"
        }
        Err(_) => {
            ctx.counters
                .notifications_backpressure
                .fetch_add(1, Ordering::Relaxed);
            "backpressure"
        }
    }
}

fn system_notification(system: &TrackedSystem) -> Notification {
    let label = if crate::registry::is_wormhole_id(system.solar_system_id) {
        "New wormhole on the map"
    } else {
        "New system on the map"
    };
    let mut fields = vec![EmbedField {
        name: "System".to_string(),
        value: system.name.clone(),
        inline: true,
    }];
    if let Some(class_title) = &system.class_title {
        fields.push(EmbedField {
            name: "Class".to_string(),
            value: class_title.clone(),
            inline: true,
        });
    }
    if !system.statics.is_empty() {
        fields.push(EmbedField {
            name: "Statics".to_string(),
            value: system.statics.join(", "),
            inline: true,
        });
    }
    if let Some(region) = &system.region_name {
        fields.push(EmbedField {
            name: "Region".to_string(),
            value: region.clone(),
            inline: true,
        });
    }

    Notification {
        kind: NotificationKind::System,
        content: format!("{label}: {}", system.display_name()),
        embeds: vec![Embed {
            title: Some(system.display_name().to_string()),
            description: None,
            fields,
        }],
        fingerprint: None,
    }
}

fn character_notification(character: &TrackedCharacter) -> Notification {
    let mut fields = Vec::new();
    if let Some(corporation_id) = character.corporation_id {
        fields.push(EmbedField {
            name: "Corporation".to_string(),
            value: corporation_id.to_string(),
            inline: true,
        });
    }
    if let Some(alliance_id) = character.alliance_id {
        fields.push(EmbedField {
            name: "Alliance".to_string(),
            value: alliance_id.to_string(),
            inline: true,
        });
    }

    Notification {
        kind: NotificationKind::Character,
        content: format!("Now tracking {}", character.name),
        embeds: vec![Embed {
            title: Some(character.name.clone()),
            description: None,
            fields,
        }],
        fingerprint: None,
    }
}

fn rally_notification(rally: &RallyPoint) -> Notification {
    let location = rally
        .solar_system_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "unknown system".to_string());
    let mut description = format!("Rally point in {location}");
    if let Some(message) = &rally.message {
        description = format!("{description}: {message}");
    }

    Notification {
        kind: NotificationKind::Rally,
        content: description.clone(),
        embeds: vec![Embed {
            title: rally.created_by.clone(),
            description: Some(description),
            fields: Vec::new(),
        }],
        fingerprint: None,
    }
}
