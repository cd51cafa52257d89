use crate::cache::{keys, Cache, CacheValue};
use std::sync::Arc;
use std::time::Duration;

/// Fingerprint namespace for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupKind {
    System,
    Character,
    Rally,
    Kill,
}

impl DedupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DedupKind::System => "system",
            DedupKind::Character => "character",
            DedupKind::Rally => "rally",
            DedupKind::Kill => "kill",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    New,
    Duplicate,
}

/// Why a notification was not dispatched. These are recorded outcomes, not
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Duplicate,
    NoTrackedEntity,
    Backpressure,
    NotificationsDisabled,
    FeatureDisabled,
    UpstreamUnavailable,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Duplicate => "duplicate",
            SkipReason::NoTrackedEntity => "no_tracked_entity",
            SkipReason::Backpressure => "backpressure",
            SkipReason::NotificationsDisabled => "notifications_disabled",
            SkipReason::FeatureDisabled => "feature_disabled",
            SkipReason::UpstreamUnavailable => "upstream_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Notified,
    Skipped,
    Failed,
}

impl KillOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            KillOutcome::Notified => "notified",
            KillOutcome::Skipped => "skipped",
            KillOutcome::Failed => "failed",
        }
    }
}

/// Terminal disposition recorded against a kill fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct KillStatus {
    pub status: KillOutcome,
    pub reason: Option<SkipReason>,
}

impl KillStatus {
    pub fn notified() -> Self {
        Self {
            status: KillOutcome::Notified,
            reason: None,
        }
    }

    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            status: KillOutcome::Skipped,
            reason: Some(reason),
        }
    }

    pub fn failed(reason: SkipReason) -> Self {
        Self {
            status: KillOutcome::Failed,
            reason: Some(reason),
        }
    }
}

/// Single-use fingerprint check per `(kind, id)` within a TTL window.
///
/// Sits directly on the cache's `get_and_update`, so at most one caller ever
/// observes `New` for a given fingerprint. The rule is strict: an absent
/// entry means new; anything at all stored under the key means duplicate.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    cache: Arc<Cache>,
    ttl: Duration,
}

impl Deduplicator {
    pub fn new(cache: Arc<Cache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn check(&self, kind: DedupKind, id: u64) -> DedupOutcome {
        let key = keys::dedup(kind.as_str(), id);
        self.cache
            .get_and_update(&key, Some(self.ttl), |current| match current {
                None => (Some(CacheValue::Flag(true)), DedupOutcome::New),
                Some(existing) => (Some(existing), DedupOutcome::Duplicate),
            })
    }

    /// Record a terminal disposition against a kill fingerprint. The entry
    /// keeps the TTL window opened by the first `check`, so a late status
    /// write does not extend deduplication.
    pub fn mark_kill_status(&self, killmail_id: u64, status: KillStatus) {
        let key = keys::dedup(DedupKind::Kill.as_str(), killmail_id);
        self.cache.get_and_update(&key, Some(self.ttl), |_| {
            (Some(CacheValue::KillStatus(status)), ())
        });
    }

    #[allow(dead_code)]
    pub fn kill_status(&self, killmail_id: u64) -> Option<KillStatus> {
        let key = keys::dedup(DedupKind::Kill.as_str(), killmail_id);
        match self.cache.get(&key) {
            Some(CacheValue::KillStatus(status)) => Some(status),
            _ => None,
        }
    }
}
