use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

const MAX_SAMPLES: usize = 500;

/// Process-wide counters. Every component pushes into these; the collector
/// task samples them on an interval.
#[derive(Debug, Default)]
pub struct Counters {
    pub events_processed: AtomicU64,
    pub events_failed: AtomicU64,
    pub events_ignored: AtomicU64,
    pub batches_processed: AtomicU64,
    processing_time_us: AtomicU64,
    processing_samples: AtomicU64,

    pub dedup_checks: AtomicU64,
    pub dedup_duplicates: AtomicU64,

    pub kills_received: AtomicU64,
    pub kills_notified: AtomicU64,
    pub kills_skipped: AtomicU64,

    pub notifications_sent: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub notifications_backpressure: AtomicU64,

    pub stream_connects: AtomicU64,
    pub stream_disconnects: AtomicU64,
    stream_connected: AtomicU64,
    stream_ping_ms: AtomicU64,

    pub upstream_errors: AtomicU64,
    pub internal_errors: AtomicU64,
    pub sampling_errors: AtomicU64,
}

impl Counters {
    pub fn record_event_processed(&self, took: Duration) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.processing_time_us
            .fetch_add(took.as_micros() as u64, Ordering::Relaxed);
        self.processing_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_ignored(&self) {
        self.events_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedup(&self, duplicate: bool) {
        self.dedup_checks.fetch_add(1, Ordering::Relaxed);
        if duplicate {
            self.dedup_duplicates.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn mark_stream_connected(&self, connected: bool) {
        if connected {
            self.stream_connects.fetch_add(1, Ordering::Relaxed);
            self.stream_connected.store(1, Ordering::Relaxed);
        } else {
            self.stream_disconnects.fetch_add(1, Ordering::Relaxed);
            self.stream_connected.store(0, Ordering::Relaxed);
        }
    }

    pub fn stream_is_connected(&self) -> bool {
        self.stream_connected.load(Ordering::Relaxed) == 1
    }

    /// Liveness proxy: gap between consecutive stream events.
    pub fn record_stream_ping(&self, gap: Duration) {
        self.stream_ping_ms
            .store(gap.as_millis() as u64, Ordering::Relaxed);
    }

    fn avg_processing_ms(&self) -> f64 {
        let samples = self.processing_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        let total_us = self.processing_time_us.load(Ordering::Relaxed) as f64;
        total_us / samples as f64 / 1000.0
    }
}

// Sub-score tables. Each bucket boundary is exact.

pub fn time_score(avg_ms: f64) -> f64 {
    if avg_ms < 10.0 {
        100.0
    } else if avg_ms < 50.0 {
        80.0
    } else if avg_ms < 100.0 {
        60.0
    } else if avg_ms < 500.0 {
        40.0
    } else {
        20.0
    }
}

pub fn dedup_score(rate_pct: f64) -> f64 {
    if rate_pct < 1.0 {
        100.0
    } else if rate_pct < 5.0 {
        90.0
    } else if rate_pct < 10.0 {
        80.0
    } else if rate_pct < 20.0 {
        70.0
    } else {
        50.0
    }
}

pub fn memory_score(resident_gb: f64) -> f64 {
    if resident_gb < 0.5 {
        100.0
    } else if resident_gb < 1.0 {
        80.0
    } else if resident_gb < 2.0 {
        60.0
    } else {
        40.0
    }
}

pub fn process_score(count: u64) -> f64 {
    if count < 100 {
        100.0
    } else if count < 500 {
        80.0
    } else if count < 1000 {
        60.0
    } else {
        40.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionMetrics {
    pub count: u32,
    pub healthy: u32,
    pub avg_ping_ms: f64,
    pub uptime_pct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingMetrics {
    pub processed: u64,
    pub failed: u64,
    pub success_rate_pct: f64,
    pub avg_processing_ms: f64,
    pub events_per_sec: f64,
    pub batches: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupMetrics {
    pub total: u64,
    pub duplicates: u64,
    pub rate_pct: f64,
    pub strategy: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemMetrics {
    pub resident_memory_gb: f64,
    pub thread_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthSample {
    pub at: DateTime<Utc>,
    pub connection: ConnectionMetrics,
    pub processing: ProcessingMetrics,
    pub dedup: DedupMetrics,
    pub system: SystemMetrics,
    /// Weighted 0..100 score, rounded to two decimals at sampling time.
    pub score: f64,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Weighted overall score from the four sub-scores.
pub fn weighted_score(
    connection: &ConnectionMetrics,
    processing: &ProcessingMetrics,
    dedup: &DedupMetrics,
    system: &SystemMetrics,
) -> f64 {
    let connection_score = connection.uptime_pct.clamp(0.0, 100.0);
    let processing_score =
        0.5 * processing.success_rate_pct + 0.5 * time_score(processing.avg_processing_ms);
    let dedup_sub = dedup_score(dedup.rate_pct);
    let system_sub =
        0.5 * memory_score(system.resident_memory_gb) + 0.5 * process_score(system.thread_count);
    0.3 * connection_score + 0.4 * processing_score + 0.2 * dedup_sub + 0.1 * system_sub
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateTotals {
    pub events_processed: u64,
    pub events_failed: u64,
    pub duplicates: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateAverages {
    pub score: f64,
    pub events_per_sec: f64,
    pub processing_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub sample_count: usize,
    pub avg_score: f64,
    pub totals: AggregateTotals,
    pub averages: AggregateAverages,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub collection_interval: Duration,
    pub retention_period: Duration,
    pub aggregation_window: Duration,
    pub stream_count: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(30),
            retention_period: Duration::from_secs(24 * 60 * 60),
            aggregation_window: Duration::from_secs(5 * 60),
            stream_count: 1,
        }
    }
}

struct HistoryEntry {
    sample: HealthSample,
    taken: Instant,
}

/// Health collector: samples the counter registry on an interval, keeps a
/// bounded history and aggregates it on demand.
pub struct Telemetry {
    cfg: TelemetryConfig,
    counters: Arc<Counters>,
    history: Mutex<VecDeque<HistoryEntry>>,
    last_cycle: Mutex<Option<(Instant, u64)>>,
}

impl Telemetry {
    pub fn new(cfg: TelemetryConfig, counters: Arc<Counters>) -> Self {
        Self {
            cfg,
            counters,
            history: Mutex::new(VecDeque::new()),
            last_cycle: Mutex::new(None),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Take one health sample and append it to history.
    pub fn sample_now(&self) -> HealthSample {
        let now = Instant::now();
        let processed = self.counters.events_processed.load(Ordering::Relaxed);
        let failed = self.counters.events_failed.load(Ordering::Relaxed);

        let events_per_sec = {
            let mut last = self.last_cycle.lock().unwrap_or_else(|e| e.into_inner());
            let rate = match *last {
                Some((at, count)) => {
                    let elapsed = now.duration_since(at).as_secs_f64();
                    if elapsed > 0.0 {
                        (processed.saturating_sub(count)) as f64 / elapsed
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            *last = Some((now, processed));
            rate
        };

        let healthy = if self.counters.stream_is_connected() {
            self.cfg.stream_count
        } else {
            0
        };
        let connection = ConnectionMetrics {
            count: self.cfg.stream_count,
            healthy,
            avg_ping_ms: self.counters.stream_ping_ms.load(Ordering::Relaxed) as f64,
            uptime_pct: if self.cfg.stream_count == 0 {
                0.0
            } else {
                f64::from(healthy) / f64::from(self.cfg.stream_count) * 100.0
            },
        };

        let attempted = processed + failed;
        let processing = ProcessingMetrics {
            processed,
            failed,
            success_rate_pct: if attempted == 0 {
                100.0
            } else {
                processed as f64 / attempted as f64 * 100.0
            },
            avg_processing_ms: self.counters.avg_processing_ms(),
            events_per_sec,
            batches: self.counters.batches_processed.load(Ordering::Relaxed),
        };

        let checks = self.counters.dedup_checks.load(Ordering::Relaxed);
        let duplicates = self.counters.dedup_duplicates.load(Ordering::Relaxed);
        let dedup = DedupMetrics {
            total: checks,
            duplicates,
            rate_pct: if checks == 0 {
                0.0
            } else {
                duplicates as f64 / checks as f64 * 100.0
            },
            strategy: "cache_ttl",
        };

        let system = match read_system_metrics() {
            Ok(metrics) => metrics,
            Err(err) => {
                self.counters.sampling_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "system metrics sampling failed");
                SystemMetrics {
                    resident_memory_gb: 0.0,
                    thread_count: 0,
                }
            }
        };

        let score = round2(weighted_score(&connection, &processing, &dedup, &system));
        let sample = HealthSample {
            at: Utc::now(),
            connection,
            processing,
            dedup,
            system,
            score,
        };

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(HistoryEntry {
            sample: sample.clone(),
            taken: now,
        });
        while history.len() > MAX_SAMPLES {
            history.pop_front();
        }
        let retention = self.cfg.retention_period;
        while history
            .front()
            .is_some_and(|entry| now.duration_since(entry.taken) > retention)
        {
            history.pop_front();
        }

        sample
    }

    #[allow(dead_code)]
    pub fn latest(&self) -> Option<HealthSample> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.back().map(|entry| entry.sample.clone())
    }

    #[allow(dead_code)]
    pub fn history_len(&self) -> usize {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.len()
    }

    /// Aggregate the samples taken within the configured window.
    pub fn aggregate(&self) -> Option<Aggregation> {
        let now = Instant::now();
        let window = self.cfg.aggregation_window;
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let recent: Vec<&HistoryEntry> = history
            .iter()
            .filter(|entry| now.duration_since(entry.taken) <= window)
            .collect();
        let first = recent.first()?;
        let last = recent.last()?;

        let count = recent.len();
        let avg =
            |f: fn(&HealthSample) -> f64| recent.iter().map(|e| f(&e.sample)).sum::<f64>() / count as f64;

        Some(Aggregation {
            from: first.sample.at,
            to: last.sample.at,
            sample_count: count,
            avg_score: round2(avg(|s| s.score)),
            totals: AggregateTotals {
                events_processed: last
                    .sample
                    .processing
                    .processed
                    .saturating_sub(first.sample.processing.processed),
                events_failed: last
                    .sample
                    .processing
                    .failed
                    .saturating_sub(first.sample.processing.failed),
                duplicates: last
                    .sample
                    .dedup
                    .duplicates
                    .saturating_sub(first.sample.dedup.duplicates),
            },
            averages: AggregateAverages {
                score: round2(avg(|s| s.score)),
                events_per_sec: round2(avg(|s| s.processing.events_per_sec)),
                processing_ms: round2(avg(|s| s.processing.avg_processing_ms)),
            },
        })
    }
}

/// Timer loop: one sample per collection interval until shutdown.
pub async fn run(telemetry: Arc<Telemetry>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(telemetry.cfg.collection_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sample = telemetry.sample_now();
                tracing::info!(
                    score = sample.score,
                    events_processed = sample.processing.processed,
                    events_per_sec = sample.processing.events_per_sec,
                    dedup_rate_pct = sample.dedup.rate_pct,
                    stream_healthy = sample.connection.healthy,
                    "health sample"
                );
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("telemetry task stopped");
}

#[cfg(target_os = "linux")]
fn read_system_metrics() -> Result<SystemMetrics, String> {
    let status = std::fs::read_to_string("/proc/self/status").map_err(|e| e.to_string())?;
    let mut rss_kb: Option<u64> = None;
    let mut threads: Option<u64> = None;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss_kb = rest
                .trim()
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok());
        } else if let Some(rest) = line.strip_prefix("Threads:") {
            threads = rest.trim().parse().ok();
        }
    }
    Ok(SystemMetrics {
        resident_memory_gb: rss_kb.ok_or("VmRSS not found")? as f64 / 1024.0 / 1024.0,
        thread_count: threads.ok_or("Threads not found")?,
    })
}

#[cfg(not(target_os = "linux"))]
fn read_system_metrics() -> Result<SystemMetrics, String> {
    Err("system metrics unavailable on this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_score_buckets_are_exact() {
        assert_eq!(time_score(0.0), 100.0);
        assert_eq!(time_score(9.99), 100.0);
        assert_eq!(time_score(10.0), 80.0);
        assert_eq!(time_score(49.9), 80.0);
        assert_eq!(time_score(50.0), 60.0);
        assert_eq!(time_score(99.9), 60.0);
        assert_eq!(time_score(100.0), 40.0);
        assert_eq!(time_score(499.9), 40.0);
        assert_eq!(time_score(500.0), 20.0);
    }

    #[test]
    fn dedup_score_buckets_are_exact() {
        assert_eq!(dedup_score(0.5), 100.0);
        assert_eq!(dedup_score(1.0), 90.0);
        assert_eq!(dedup_score(4.9), 90.0);
        assert_eq!(dedup_score(5.0), 80.0);
        assert_eq!(dedup_score(10.0), 70.0);
        assert_eq!(dedup_score(19.9), 70.0);
        assert_eq!(dedup_score(20.0), 50.0);
    }

    #[test]
    fn memory_and_process_buckets_are_exact() {
        assert_eq!(memory_score(0.49), 100.0);
        assert_eq!(memory_score(0.5), 80.0);
        assert_eq!(memory_score(1.0), 60.0);
        assert_eq!(memory_score(2.0), 40.0);

        assert_eq!(process_score(99), 100.0);
        assert_eq!(process_score(100), 80.0);
        assert_eq!(process_score(500), 60.0);
        assert_eq!(process_score(1000), 40.0);
    }

    fn sample_inputs() -> (ConnectionMetrics, ProcessingMetrics, DedupMetrics, SystemMetrics) {
        (
            ConnectionMetrics {
                count: 1,
                healthy: 1,
                avg_ping_ms: 20.0,
                uptime_pct: 100.0,
            },
            ProcessingMetrics {
                processed: 1000,
                failed: 0,
                success_rate_pct: 100.0,
                avg_processing_ms: 5.0,
                events_per_sec: 3.0,
                batches: 10,
            },
            DedupMetrics {
                total: 1000,
                duplicates: 5,
                rate_pct: 0.5,
                strategy: "cache_ttl",
            },
            SystemMetrics {
                resident_memory_gb: 0.1,
                thread_count: 12,
            },
        )
    }

    #[test]
    fn weighted_score_composes_sub_scores() {
        let (c, p, d, s) = sample_inputs();
        // All sub-scores are 100 here: 0.3 + 0.4 + 0.2 + 0.1 of 100.
        assert_eq!(round2(weighted_score(&c, &p, &d, &s)), 100.0);

        let degraded = DedupMetrics {
            rate_pct: 25.0,
            ..d
        };
        // Dedup sub-score drops to 50: 100 - 0.2 * 50.
        assert_eq!(round2(weighted_score(&c, &p, &degraded, &s)), 90.0);
    }

    #[test]
    fn rounding_happens_once_to_two_decimals() {
        assert_eq!(round2(93.333333), 93.33);
        assert_eq!(round2(93.335), 93.34);
    }

    #[test]
    fn history_is_capped() {
        let telemetry = Telemetry::new(
            TelemetryConfig {
                collection_interval: Duration::from_millis(1),
                ..Default::default()
            },
            Arc::new(Counters::default()),
        );
        for _ in 0..(MAX_SAMPLES + 25) {
            telemetry.sample_now();
        }
        assert_eq!(telemetry.history_len(), MAX_SAMPLES);
    }

    #[test]
    fn aggregation_reports_deltas_and_averages() {
        let counters = Arc::new(Counters::default());
        let telemetry = Telemetry::new(TelemetryConfig::default(), counters.clone());
        counters.mark_stream_connected(true);

        counters.record_event_processed(Duration::from_millis(2));
        telemetry.sample_now();
        for _ in 0..9 {
            counters.record_event_processed(Duration::from_millis(2));
        }
        counters.record_dedup(true);
        telemetry.sample_now();

        let agg = telemetry.aggregate().expect("aggregation");
        assert_eq!(agg.sample_count, 2);
        assert_eq!(agg.totals.events_processed, 9);
        assert_eq!(agg.totals.duplicates, 1);
        assert!(agg.avg_score > 0.0);
    }

    #[test]
    fn empty_history_has_no_aggregation() {
        let telemetry = Telemetry::new(TelemetryConfig::default(), Arc::new(Counters::default()));
        assert!(telemetry.aggregate().is_none());
    }
}
