use crate::analytics::{Analytics, EventObservation};
use crate::events::{categorise, parse_event};
use crate::handlers::{handle_event, HandlerContext, HandlerOutcome};
use crate::telemetry::Counters;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

const SOURCE: &str = "sse";
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub map_base: String,
    pub map_slug: String,
    pub map_token: String,
}

impl RouterConfig {
    fn stream_url(&self) -> String {
        format!(
            "{}/api/maps/{}/events",
            self.map_base.trim_end_matches('/'),
            self.map_slug
        )
    }
}

/// Consume one map's SSE stream until shutdown. One cooperative consumer per
/// stream: events are validated, categorised and routed strictly in arrival
/// order, and no event outcome ever stops the stream.
pub async fn run(
    cfg: RouterConfig,
    ctx: HandlerContext,
    counters: Arc<Counters>,
    analytics: Arc<Analytics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "failed to build sse client");
            return;
        }
    };

    let url = cfg.stream_url();
    let mut backoff = RECONNECT_BASE;

    loop {
        if *shutdown.borrow() {
            break;
        }

        tracing::info!(url = %url, "connecting to map event stream");
        let resp = tokio::select! {
            resp = client
                .get(&url)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .bearer_auth(&cfg.map_token)
                .send() => resp,
            _ = shutdown.changed() => continue,
        };

        let resp = match resp.and_then(|r| r.error_for_status()) {
            Ok(resp) => resp,
            Err(err) => {
                counters.upstream_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::warn!(
                    error = %err,
                    sleep_s = backoff.as_secs(),
                    "map stream connect failed; backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {},
                    _ = shutdown.changed() => {},
                }
                backoff = (backoff * 2).min(RECONNECT_CAP);
                continue;
            }
        };

        counters.mark_stream_connected(true);
        analytics.note_pattern("stream_connect");
        let mut stream = resp.bytes_stream().eventsource();
        let mut last_event_at: Option<Instant> = None;

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match item {
                Some(Ok(frame)) => {
                    if let Some(previous) = last_event_at {
                        counters.record_stream_ping(previous.elapsed());
                    }
                    last_event_at = Some(Instant::now());

                    if frame.data.is_empty() {
                        continue;
                    }
                    process_frame(&ctx, &counters, &analytics, &frame.data).await;
                    // A live stream resets the reconnect backoff.
                    backoff = RECONNECT_BASE;
                }
                Some(Err(err)) => {
                    counters
                        .upstream_errors
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    tracing::warn!(error = %err, "map stream error; reconnecting");
                    break;
                }
                None => {
                    tracing::warn!("map stream closed by server; reconnecting");
                    break;
                }
            }
        }

        counters.mark_stream_connected(false);
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {},
            _ = shutdown.changed() => {},
        }
        backoff = (backoff * 2).min(RECONNECT_CAP);
    }

    tracing::debug!("sse consumer stopped");
}

/// validate → categorise → route → log, with every failure contained to the
/// frame that caused it.
pub async fn process_frame(
    ctx: &HandlerContext,
    counters: &Counters,
    analytics: &Analytics,
    data: &str,
) {
    let started = Instant::now();
    let event = match parse_event(data) {
        Ok(event) => event,
        Err(err) => {
            counters.record_event_failed();
            analytics.record(
                SOURCE,
                EventObservation {
                    success: false,
                    latency: started.elapsed(),
                    error_type: Some("validation".to_string()),
                    payload_complete: false,
                },
            );
            tracing::warn!(error = %err, "dropping malformed event");
            return;
        }
    };

    let kind = categorise(&event.event_type);
    match handle_event(ctx, &event).await {
        HandlerOutcome::Handled => {
            counters.record_event_processed(started.elapsed());
            analytics.record(
                SOURCE,
                EventObservation {
                    success: true,
                    latency: started.elapsed(),
                    error_type: None,
                    payload_complete: true,
                },
            );
            let age_ms = (chrono::Utc::now() - event.timestamp)
                .num_milliseconds()
                .max(0);
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                category = ?kind.category(),
                age_ms,
                "event handled"
            );
        }
        HandlerOutcome::Ignored => {
            counters.record_event_ignored();
        }
        HandlerOutcome::Error(reason) => {
            counters.record_event_failed();
            analytics.record(
                SOURCE,
                EventObservation {
                    success: false,
                    latency: started.elapsed(),
                    error_type: Some("handler".to_string()),
                    payload_complete: true,
                },
            );
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                map_id = %event.map_id,
                reason,
                "event handler failed; continuing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::AnalyticsConfig;
    use crate::cache::Cache;
    use crate::config::Features;
    use crate::dedup::Deduplicator;
    use crate::esi::EsiClient;
    use crate::http::{HttpClient, HttpConfig};
    use crate::license::{self, LicenseConfig};
    use crate::notifier;
    use crate::pipeline::{self, PipelineContext, ValidationOverride};
    use crate::registry::Registry;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tokio::sync::watch;

    async fn context() -> (HandlerContext, Arc<Counters>, Arc<Analytics>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cache = Arc::new(Cache::default());
        let registry = Registry::new(cache.clone());
        let dedup = Deduplicator::new(cache.clone(), Duration::from_secs(86_400));
        let counters = Arc::new(Counters::default());
        let analytics = Arc::new(Analytics::new(AnalyticsConfig::default()));
        let (notifier_handle, _rx) = notifier::test_handle(16);
        let license = license::spawn(
            LicenseConfig {
                base: String::new(),
                license_key: String::new(),
                api_token: String::new(),
                refresh_interval: Duration::from_secs(3600),
                dev_mode: true,
            },
            shutdown_rx.clone(),
        );
        let http = Arc::new(HttpClient::new(HttpConfig::default()).unwrap());
        let esi = EsiClient::new(http, cache.clone(), "https://esi.example.net".to_string());
        let kills = pipeline::spawn(
            PipelineContext {
                esi,
                registry: registry.clone(),
                dedup: dedup.clone(),
                license: license.clone(),
                notifier: notifier_handle.clone(),
                counters: counters.clone(),
                analytics: analytics.clone(),
                features: Features::default(),
                override_ctl: Arc::new(ValidationOverride::default()),
            },
            2,
            shutdown_rx,
        );

        let ctx = HandlerContext {
            registry,
            dedup,
            license,
            notifier: notifier_handle,
            kills,
            counters: counters.clone(),
            features: Features::default(),
            started_at: Instant::now(),
            suppression: Duration::ZERO,
        };
        (ctx, counters, analytics, shutdown_tx)
    }

    fn frame(event_type: &str, payload: serde_json::Value) -> String {
        json!({
            "id": "01JBX6T1R7N9M7V9Z3D4E5F6G7",
            "type": event_type,
            "map_id": "map-1",
            "timestamp": "2025-11-02T12:00:00Z",
            "payload": payload
        })
        .to_string()
    }

    #[tokio::test]
    async fn malformed_frames_do_not_stop_the_stream() {
        let (ctx, counters, analytics, _shutdown) = context().await;

        process_frame(&ctx, &counters, &analytics, "not json").await;
        process_frame(&ctx, &counters, &analytics, r#"{"type":"add_system"}"#).await;
        process_frame(
            &ctx,
            &counters,
            &analytics,
            &frame("add_system", json!({})),
        )
        .await;
        // A good frame afterwards is processed normally.
        process_frame(
            &ctx,
            &counters,
            &analytics,
            &frame("add_system", json!({ "solar_system_id": 31_000_001, "name": "J123456" })),
        )
        .await;

        assert_eq!(counters.events_failed.load(Ordering::Relaxed), 3);
        assert_eq!(counters.events_processed.load(Ordering::Relaxed), 1);
        assert!(ctx.registry.is_tracked_system(31_000_001));
    }

    #[tokio::test]
    async fn handler_errors_are_contained() {
        let (ctx, counters, analytics, _shutdown) = context().await;
        // Valid envelope, unusable payload for the handler.
        process_frame(
            &ctx,
            &counters,
            &analytics,
            &frame("add_system", json!({ "note": "no id" })),
        )
        .await;
        assert_eq!(counters.events_failed.load(Ordering::Relaxed), 1);

        process_frame(
            &ctx,
            &counters,
            &analytics,
            &frame("add_system", json!({ "solar_system_id": 31_000_002, "name": "J2" })),
        )
        .await;
        assert_eq!(counters.events_processed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unknown_types_are_ignored_not_failed() {
        let (ctx, counters, analytics, _shutdown) = context().await;
        process_frame(
            &ctx,
            &counters,
            &analytics,
            &frame("brand_new_event", json!({ "x": 1 })),
        )
        .await;
        assert_eq!(counters.events_failed.load(Ordering::Relaxed), 0);
        assert!(counters.events_ignored.load(Ordering::Relaxed) >= 1);
    }
}
