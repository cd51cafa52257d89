use crate::config::ChannelIds;
use crate::dedup::{Deduplicator, KillStatus, SkipReason};
use crate::telemetry::Counters;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const DEFAULT_QUEUE_CAPACITY: usize = 500;
const MAX_SEND_ATTEMPTS: u32 = 3;
const SEND_BACKOFF_BASE: Duration = Duration::from_millis(500);
const SEND_BACKOFF_CAP: Duration = Duration::from_secs(5);
const DRAIN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    System,
    Character,
    Kill,
    Rally,
    Status,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::System => "system",
            NotificationKind::Character => "character",
            NotificationKind::Kill => "kill",
            NotificationKind::Rally => "rally",
            NotificationKind::Status => "status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub content: String,
    pub embeds: Vec<Embed>,
    /// Kill fingerprint; a terminal send failure is recorded against it.
    pub fingerprint: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue at capacity; the caller records a backpressure skip.
    Full,
    Closed,
}

/// Producer-side handle for the dispatcher queue.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<Notification>,
}

impl DispatchHandle {
    pub fn enqueue(&self, notification: Notification) -> Result<(), EnqueueError> {
        self.tx.try_send(notification).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub webhook_url: String,
    pub channel_ids: ChannelIds,
    pub queue_capacity: usize,
    pub dry_run: bool,
}

/// Which channel a notification kind routes to.
pub fn channel_for(kind: NotificationKind, channels: &ChannelIds) -> Option<&str> {
    match kind {
        NotificationKind::System => channels.system.as_deref(),
        NotificationKind::Character => channels.character.as_deref(),
        NotificationKind::Kill => channels.kill.as_deref(),
        NotificationKind::Rally => channels.rally.as_deref(),
        NotificationKind::Status => channels.status.as_deref(),
    }
}

/// Webhook body: `content` plus embeds with `{name, value, inline}` fields.
pub fn build_payload(notification: &Notification) -> serde_json::Value {
    serde_json::json!({
        "content": notification.content,
        "embeds": notification.embeds,
    })
}

/// Spawn the single egress task. Everything outbound goes through the
/// bounded queue behind the returned handle; overflow surfaces to producers
/// as `EnqueueError::Full`, never by dropping an in-flight notification.
pub fn spawn(
    cfg: NotifierConfig,
    counters: Arc<Counters>,
    dedup: Deduplicator,
    shutdown: watch::Receiver<bool>,
) -> DispatchHandle {
    let capacity = cfg.queue_capacity.max(1);
    let (tx, rx) = mpsc::channel::<Notification>(capacity);
    tokio::spawn(run_worker(cfg, counters, dedup, rx, shutdown));
    DispatchHandle { tx }
}

async fn run_worker(
    cfg: NotifierConfig,
    counters: Arc<Counters>,
    dedup: Deduplicator,
    mut rx: mpsc::Receiver<Notification>,
    mut shutdown: watch::Receiver<bool>,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "failed to build webhook client; dispatcher disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(notification) => {
                    deliver(&cfg, &client, &counters, &dedup, notification).await;
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

    // Drain what is already queued within the grace window.
    rx.close();
    let drain_deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    loop {
        match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
            Ok(Some(notification)) => {
                deliver(&cfg, &client, &counters, &dedup, notification).await;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::warn!("drain grace expired; dropping queued notifications");
                break;
            }
        }
    }
    tracing::debug!("dispatcher task stopped");
}

async fn deliver(
    cfg: &NotifierConfig,
    client: &reqwest::Client,
    counters: &Counters,
    dedup: &Deduplicator,
    notification: Notification,
) {
    let kind = notification.kind;
    let channel = channel_for(kind, &cfg.channel_ids).map(str::to_string);
    let payload = build_payload(&notification);

    if cfg.dry_run {
        counters.notifications_sent.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            kind = kind.as_str(),
            channel = channel.as_deref().unwrap_or(""),
            content = %notification.content,
            "DRY RUN: would dispatch notification"
        );
        return;
    }

    let mut delay = SEND_BACKOFF_BASE;
    for attempt in 1..=MAX_SEND_ATTEMPTS {
        let mut req = client.post(&cfg.webhook_url).json(&payload);
        if let Some(channel) = channel.as_deref() {
            req = req.query(&[("thread_id", channel)]);
        }

        let retryable = match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                counters.notifications_sent.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    kind = kind.as_str(),
                    channel = channel.as_deref().unwrap_or(""),
                    attempt,
                    "notification dispatched"
                );
                return;
            }
            Ok(resp) => {
                let status = resp.status();
                tracing::warn!(
                    kind = kind.as_str(),
                    attempt,
                    status = status.as_u16(),
                    "webhook rejected notification"
                );
                status.is_server_error() || status.as_u16() == 429
            }
            Err(err) => {
                tracing::warn!(kind = kind.as_str(), attempt, error = %err, "webhook send failed");
                true
            }
        };

        if !retryable || attempt == MAX_SEND_ATTEMPTS {
            break;
        }

        let jitter = rand::thread_rng().gen_range(0..250);
        tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
        delay = (delay * 2).min(SEND_BACKOFF_CAP);
    }

    counters.notifications_failed.fetch_add(1, Ordering::Relaxed);
    if let Some(killmail_id) = notification.fingerprint {
        dedup.mark_kill_status(killmail_id, KillStatus::failed(SkipReason::UpstreamUnavailable));
    }
    tracing::warn!(
        kind = kind.as_str(),
        attempts = MAX_SEND_ATTEMPTS,
        "notification dropped after retries"
    );
}

#[cfg(test)]
pub(crate) fn test_handle(capacity: usize) -> (DispatchHandle, mpsc::Receiver<Notification>) {
    let (tx, rx) = mpsc::channel(capacity);
    (DispatchHandle { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> ChannelIds {
        ChannelIds {
            system: Some("111".to_string()),
            character: Some("222".to_string()),
            kill: Some("333".to_string()),
            rally: None,
            status: Some("555".to_string()),
        }
    }

    fn notification(kind: NotificationKind) -> Notification {
        Notification {
            kind,
            content: "hello".to_string(),
            embeds: vec![Embed {
                title: Some("title".to_string()),
                description: None,
                fields: vec![EmbedField {
                    name: "System".to_string(),
                    value: "J123456".to_string(),
                    inline: true,
                }],
            }],
            fingerprint: None,
        }
    }

    #[test]
    fn routing_follows_configuration() {
        let channels = channels();
        assert_eq!(channel_for(NotificationKind::System, &channels), Some("111"));
        assert_eq!(channel_for(NotificationKind::Kill, &channels), Some("333"));
        assert_eq!(channel_for(NotificationKind::Rally, &channels), None);
    }

    #[test]
    fn payload_shape_matches_webhook_contract() {
        let payload = build_payload(&notification(NotificationKind::Kill));
        assert_eq!(payload["content"], "hello");
        let field = &payload["embeds"][0]["fields"][0];
        assert_eq!(field["name"], "System");
        assert_eq!(field["value"], "J123456");
        assert_eq!(field["inline"], true);
        // Unset optional parts are omitted, not null.
        assert!(payload["embeds"][0].get("description").is_none());
    }

    #[test]
    fn enqueue_reports_backpressure_at_capacity() {
        let (handle, _rx) = test_handle(2);
        assert!(handle.enqueue(notification(NotificationKind::System)).is_ok());
        assert!(handle.enqueue(notification(NotificationKind::System)).is_ok());
        assert_eq!(
            handle.enqueue(notification(NotificationKind::System)),
            Err(EnqueueError::Full)
        );
    }

    #[test]
    fn default_bound_rejects_the_five_hundred_first() {
        let (handle, _rx) = test_handle(DEFAULT_QUEUE_CAPACITY);
        for _ in 0..DEFAULT_QUEUE_CAPACITY {
            assert!(handle.enqueue(notification(NotificationKind::Kill)).is_ok());
        }
        assert_eq!(
            handle.enqueue(notification(NotificationKind::Kill)),
            Err(EnqueueError::Full)
        );
    }

    #[tokio::test]
    async fn in_flight_notifications_survive_backpressure() {
        let (handle, mut rx) = test_handle(1);
        let first = notification(NotificationKind::System);
        assert!(handle.enqueue(first.clone()).is_ok());
        assert_eq!(
            handle.enqueue(notification(NotificationKind::Character)),
            Err(EnqueueError::Full)
        );
        // The queued notification is still there, untouched by the rejection.
        assert_eq!(rx.recv().await.unwrap(), first);
    }
}
