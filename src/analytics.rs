use crate::telemetry::round2;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

const LATENCY_SAMPLE_CAP: usize = 100;
const PATTERN_RING_CAP: usize = 256;

#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub bucket_size: Duration,
    pub window: Duration,
    pub pattern_window: Duration,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            bucket_size: Duration::from_secs(60),
            window: Duration::from_secs(60 * 60),
            pattern_window: Duration::from_secs(5 * 60),
        }
    }
}

/// One observed event from a source.
#[derive(Debug, Clone)]
pub struct EventObservation {
    pub success: bool,
    pub latency: Duration,
    pub error_type: Option<String>,
    pub payload_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct SourceStats {
    total: u64,
    successful: u64,
    failed: u64,
    complete_payloads: u64,
    latency_samples: VecDeque<f64>,
    error_types: BTreeMap<String, u64>,
    last_event: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceReport {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
    pub error_types: BTreeMap<String, u64>,
    pub last_event_age_ms: Option<u64>,
    pub uptime_pct: f64,
    pub data_quality_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternReport {
    pub kind: String,
    pub count: usize,
    pub per_minute: f64,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<(u64, String), BucketStats>,
    sources: HashMap<String, SourceStats>,
    patterns: HashMap<(String, u64), VecDeque<Instant>>,
}

/// Bucketed per-source event metrics, quality scoring and pattern detection.
#[derive(Debug)]
pub struct Analytics {
    cfg: AnalyticsConfig,
    started: Instant,
    state: Mutex<State>,
}

impl Analytics {
    pub fn new(cfg: AnalyticsConfig) -> Self {
        Self {
            cfg,
            started: Instant::now(),
            state: Mutex::new(State::default()),
        }
    }

    fn bucket_index(&self, at: Instant) -> u64 {
        let elapsed = at.saturating_duration_since(self.started).as_millis() as u64;
        elapsed / (self.cfg.bucket_size.as_millis() as u64).max(1)
    }

    fn pattern_window_index(&self, at: Instant) -> u64 {
        let elapsed = at.saturating_duration_since(self.started).as_millis() as u64;
        elapsed / (self.cfg.pattern_window.as_millis() as u64).max(1)
    }

    fn window_buckets(&self) -> u64 {
        let bucket_ms = (self.cfg.bucket_size.as_millis() as u64).max(1);
        ((self.cfg.window.as_millis() as u64) / bucket_ms).max(1)
    }

    pub fn record(&self, source: &str, obs: EventObservation) {
        let now = Instant::now();
        let bucket_key = (self.bucket_index(now), source.to_string());
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let bucket = state.buckets.entry(bucket_key).or_default();
        bucket.total += 1;
        if obs.success {
            bucket.successful += 1;
        } else {
            bucket.failed += 1;
        }

        let stats = state.sources.entry(source.to_string()).or_default();
        stats.total += 1;
        if obs.success {
            stats.successful += 1;
        } else {
            stats.failed += 1;
        }
        if obs.payload_complete {
            stats.complete_payloads += 1;
        }
        stats.latency_samples.push_back(obs.latency.as_secs_f64() * 1000.0);
        while stats.latency_samples.len() > LATENCY_SAMPLE_CAP {
            stats.latency_samples.pop_front();
        }
        stats.last_event = Some(now);

        if let Some(error_type) = obs.error_type {
            *stats.error_types.entry(error_type.clone()).or_insert(0) += 1;
            drop(state);
            self.note_pattern(&format!("error:{error_type}"));
        }
    }

    /// Push one occurrence into the bounded ring for `(kind, current 5-min
    /// window)`.
    pub fn note_pattern(&self, kind: &str) {
        let now = Instant::now();
        let key = (kind.to_string(), self.pattern_window_index(now));
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ring = state.patterns.entry(key).or_default();
        ring.push_back(now);
        while ring.len() > PATTERN_RING_CAP {
            ring.pop_front();
        }
    }

    /// Patterns firing more often than once per minute inside the current
    /// detection window.
    pub fn patterns(&self) -> Vec<PatternReport> {
        let now = Instant::now();
        let current_window = self.pattern_window_index(now);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // Frequency is measured against the full detection window, so a
        // burst of one or two events does not read as a pattern.
        let window_minutes = (self.cfg.pattern_window.as_secs_f64() / 60.0).max(1.0 / 60.0);
        let mut reports: Vec<PatternReport> = state
            .patterns
            .iter()
            .filter(|((_, window), _)| *window == current_window)
            .filter_map(|((kind, _), ring)| {
                let per_minute = ring.len() as f64 / window_minutes;
                (per_minute > 1.0).then(|| PatternReport {
                    kind: kind.clone(),
                    count: ring.len(),
                    per_minute: round2(per_minute),
                })
            })
            .collect();
        reports.sort_by(|a, b| b.count.cmp(&a.count));
        reports
    }

    pub fn source_report(&self, source: &str) -> Option<SourceReport> {
        let now = Instant::now();
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let stats = state.sources.get(source)?;

        let window_buckets = self.window_buckets();
        let current = self.bucket_index(now);
        let window_start = current.saturating_sub(window_buckets - 1);
        let active_buckets = state
            .buckets
            .keys()
            .filter(|(idx, s)| *idx >= window_start && s == source)
            .count() as u64;
        // Buckets elapsed so far, capped at the window length.
        let observable = (current - window_start + 1).min(window_buckets);
        let uptime_pct = active_buckets as f64 / observable as f64 * 100.0;

        Some(SourceReport {
            total: stats.total,
            successful: stats.successful,
            failed: stats.failed,
            avg_latency_ms: round2(mean(&stats.latency_samples)),
            error_types: stats.error_types.clone(),
            last_event_age_ms: stats
                .last_event
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            uptime_pct: round2(uptime_pct),
            data_quality_score: round2(self.quality(stats, now)),
        })
    }

    /// Weighted 0..1 quality: completeness, timeliness, accuracy and latency
    /// consistency at 0.3/0.3/0.2/0.2.
    fn quality(&self, stats: &SourceStats, now: Instant) -> f64 {
        if stats.total == 0 {
            return 0.0;
        }
        let completeness = stats.complete_payloads as f64 / stats.total as f64;
        // Timeliness decays linearly over one bucket of silence.
        let timeliness = match stats.last_event {
            Some(at) => {
                let gap = now.saturating_duration_since(at).as_secs_f64();
                (1.0 - gap / self.cfg.bucket_size.as_secs_f64()).clamp(0.0, 1.0)
            }
            None => 0.0,
        };
        let accuracy = stats.successful as f64 / stats.total as f64;
        let consistency = (1.0 - coefficient_of_variation(&stats.latency_samples)).clamp(0.0, 1.0);
        0.3 * completeness + 0.3 * timeliness + 0.2 * accuracy + 0.2 * consistency
    }

    /// Drop buckets and pattern rings that fell out of their windows.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let bucket_cutoff = self
            .bucket_index(now)
            .saturating_sub(self.window_buckets() - 1);
        let pattern_cutoff = self.pattern_window_index(now).saturating_sub(1);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.buckets.len() + state.patterns.len();
        state.buckets.retain(|(idx, _), _| *idx >= bucket_cutoff);
        state.patterns.retain(|(_, window), _| *window >= pattern_cutoff);
        before - (state.buckets.len() + state.patterns.len())
    }

    pub fn source_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sources
            .keys()
            .cloned()
            .collect()
    }

    #[allow(dead_code)]
    pub fn bucket_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .buckets
            .len()
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cfg.window / 10
    }
}

fn mean(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

fn coefficient_of_variation(samples: &VecDeque<f64>) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let mean = mean(samples);
    if mean <= f64::EPSILON {
        return 0.0;
    }
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    variance.sqrt() / mean
}

/// Timer loop pruning stale buckets/patterns every `window / 10`.
pub async fn run_cleanup(analytics: Arc<Analytics>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(analytics.cleanup_interval().max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let dropped = analytics.cleanup();
                if dropped > 0 {
                    tracing::debug!(dropped, "analytics cleanup");
                }
                for pattern in analytics.patterns() {
                    tracing::info!(
                        kind = %pattern.kind,
                        count = pattern.count,
                        per_minute = pattern.per_minute,
                        "event pattern detected"
                    );
                }
                for source in analytics.source_names() {
                    if let Some(report) = analytics.source_report(&source) {
                        tracing::debug!(
                            source = %source,
                            total = report.total,
                            failed = report.failed,
                            quality = report.data_quality_score,
                            uptime_pct = report.uptime_pct,
                            "source quality"
                        );
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("analytics cleanup task stopped");
}
