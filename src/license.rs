use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Hard deadline on the validation RPC. A timeout leaves state unchanged.
const VALIDATION_DEADLINE: Duration = Duration::from_secs(3);

/// Consecutive hard validation failures after which notifications are
/// blocked. The pipeline itself keeps running so telemetry stays valid.
const HARD_FAILURE_LIMIT: u32 = 3;

pub const FEATURE_NOTIFICATIONS: &str = "notifications";
pub const FEATURE_SYSTEM_TRACKING: &str = "system_tracking";
pub const FEATURE_CHARACTER_TRACKING: &str = "character_tracking";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Unknown,
    Valid,
    PartialValid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseErrorKind {
    RateLimited,
    Timeout,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountKind {
    System,
    Character,
    Killmail,
}

/// Per-kind notification counters. Plain atomics so increments do not take
/// the command-channel round trip and survive every state transition.
#[derive(Debug, Default)]
pub struct NotificationCounters {
    system: AtomicU64,
    character: AtomicU64,
    killmail: AtomicU64,
}

impl NotificationCounters {
    pub fn increment(&self, kind: CountKind) {
        match kind {
            CountKind::System => self.system.fetch_add(1, Ordering::Relaxed),
            CountKind::Character => self.character.fetch_add(1, Ordering::Relaxed),
            CountKind::Killmail => self.killmail.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            system: self.system.load(Ordering::Relaxed),
            character: self.character.load(Ordering::Relaxed),
            killmail: self.killmail.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub system: u64,
    pub character: u64,
    pub killmail: u64,
}

#[derive(Debug, Clone)]
pub struct LicenseStatus {
    pub verdict: Verdict,
    pub valid: bool,
    pub bot_assigned: bool,
    pub details: Option<String>,
    pub features: Vec<String>,
    pub error: Option<LicenseErrorKind>,
    pub last_checked: Option<DateTime<Utc>>,
    pub notifications_enabled: bool,
    pub counters: CounterSnapshot,
}

/// Outcome of one validation call against the license server.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Success {
        valid: bool,
        bot_assigned: bool,
        details: Option<String>,
        features: Vec<String>,
    },
    RateLimited,
    Timeout,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct LicenseState {
    pub verdict: Verdict,
    pub valid: bool,
    pub bot_assigned: bool,
    pub details: Option<String>,
    pub features: Vec<String>,
    pub error: Option<LicenseErrorKind>,
    pub last_checked: Option<DateTime<Utc>>,
    pub hard_failures: u32,
}

impl Default for LicenseState {
    fn default() -> Self {
        Self {
            verdict: Verdict::Unknown,
            valid: false,
            bot_assigned: false,
            details: None,
            features: Vec::new(),
            error: None,
            last_checked: None,
            hard_failures: 0,
        }
    }
}

impl LicenseState {
    /// Apply one validation outcome. Success overwrites the verdict; a
    /// rate-limited call freezes the previous `{valid, bot_assigned,
    /// details}` and only surfaces the error; timeout and hard failure leave
    /// the verdict untouched.
    pub fn apply(&mut self, outcome: ValidationOutcome, now: DateTime<Utc>) {
        match outcome {
            ValidationOutcome::Success {
                valid,
                bot_assigned,
                details,
                features,
            } => {
                self.verdict = match (valid, bot_assigned) {
                    (true, true) => Verdict::Valid,
                    (true, false) => Verdict::PartialValid,
                    (false, _) => Verdict::Invalid,
                };
                self.valid = valid;
                self.bot_assigned = bot_assigned;
                self.details = details;
                self.features = features;
                self.error = None;
                self.hard_failures = 0;
                self.last_checked = Some(now);
            }
            ValidationOutcome::RateLimited => {
                self.error = Some(LicenseErrorKind::RateLimited);
                self.last_checked = Some(now);
            }
            ValidationOutcome::Timeout => {
                self.error = Some(LicenseErrorKind::Timeout);
            }
            ValidationOutcome::Failed(_) => {
                self.error = Some(LicenseErrorKind::Upstream);
                self.hard_failures = self.hard_failures.saturating_add(1);
                self.last_checked = Some(now);
            }
        }
    }

    pub fn feature_enabled(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }

    pub fn notifications_enabled(&self) -> bool {
        self.verdict == Verdict::Valid
            && self.hard_failures < HARD_FAILURE_LIMIT
            && self.feature_enabled(FEATURE_NOTIFICATIONS)
    }

    fn status(&self, counters: &NotificationCounters) -> LicenseStatus {
        LicenseStatus {
            verdict: self.verdict,
            valid: self.valid,
            bot_assigned: self.bot_assigned,
            details: self.details.clone(),
            features: self.features.clone(),
            error: self.error,
            last_checked: self.last_checked,
            notifications_enabled: self.notifications_enabled(),
            counters: counters.snapshot(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LicenseConfig {
    pub base: String,
    pub license_key: String,
    pub api_token: String,
    pub refresh_interval: Duration,
    /// Dev/test mode with empty credentials self-reports Valid.
    pub dev_mode: bool,
}

impl LicenseConfig {
    fn sentinel_mode(&self) -> bool {
        self.dev_mode && self.license_key.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ValidationBody {
    #[serde(default)]
    valid: bool,
    #[serde(default)]
    bot_assigned: bool,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    features: Option<serde_json::Value>,
}

fn features_from_body(features: Option<serde_json::Value>) -> Vec<String> {
    // Absent or non-list means every feature is disabled.
    match features {
        Some(serde_json::Value::Array(values)) => values
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

enum Command {
    Status(oneshot::Sender<LicenseStatus>),
    Feature(String, oneshot::Sender<bool>),
    Revalidate,
}

/// Cheap cloneable accessor for the license task.
#[derive(Clone)]
pub struct LicenseHandle {
    tx: mpsc::Sender<Command>,
    counters: Arc<NotificationCounters>,
}

impl LicenseHandle {
    pub async fn status(&self) -> LicenseStatus {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Status(reply_tx)).await.is_err() {
            return LicenseState::default().status(&self.counters);
        }
        reply_rx
            .await
            .unwrap_or_else(|_| LicenseState::default().status(&self.counters))
    }

    #[allow(dead_code)]
    pub async fn feature_enabled(&self, name: &str) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Feature(name.to_string(), reply_tx))
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    pub async fn notifications_enabled(&self) -> bool {
        self.status().await.notifications_enabled
    }

    #[allow(dead_code)]
    pub async fn force_revalidate(&self) {
        let _ = self.tx.send(Command::Revalidate).await;
    }

    pub fn count_notification(&self, kind: CountKind) {
        self.counters.increment(kind);
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}

/// Spawn the single-owner license task. All reads and refreshes go through
/// the returned handle.
pub fn spawn(cfg: LicenseConfig, mut shutdown: watch::Receiver<bool>) -> LicenseHandle {
    let (tx, mut rx) = mpsc::channel::<Command>(32);
    let counters = Arc::new(NotificationCounters::default());
    let handle = LicenseHandle {
        tx,
        counters: counters.clone(),
    };

    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(VALIDATION_DEADLINE)
            .build()
            .ok();
        let mut state = LicenseState::default();
        let mut ticker = tokio::time::interval(cfg.refresh_interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = validate(&cfg, client.as_ref()).await;
                    transition(&mut state, outcome);
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(state.status(&counters));
                    }
                    Some(Command::Feature(name, reply)) => {
                        let _ = reply.send(state.feature_enabled(&name));
                    }
                    Some(Command::Revalidate) => {
                        let outcome = validate(&cfg, client.as_ref()).await;
                        transition(&mut state, outcome);
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
        tracing::debug!("license task stopped");
    });

    handle
}

fn transition(state: &mut LicenseState, outcome: ValidationOutcome) {
    let before = state.verdict;
    state.apply(outcome, Utc::now());
    if state.verdict != before {
        tracing::info!(
            from = ?before,
            to = ?state.verdict,
            error = ?state.error,
            "license verdict changed"
        );
    } else if let Some(error) = state.error {
        tracing::warn!(verdict = ?state.verdict, error = ?error, "license refresh degraded");
    }
}

async fn validate(cfg: &LicenseConfig, client: Option<&reqwest::Client>) -> ValidationOutcome {
    if cfg.sentinel_mode() {
        return ValidationOutcome::Success {
            valid: true,
            bot_assigned: true,
            details: Some("dev mode license".to_string()),
            features: vec![
                FEATURE_NOTIFICATIONS.to_string(),
                FEATURE_SYSTEM_TRACKING.to_string(),
                FEATURE_CHARACTER_TRACKING.to_string(),
            ],
        };
    }

    let Some(client) = client else {
        return ValidationOutcome::Failed("http client unavailable".to_string());
    };

    let url = format!("{}/api/validate_bot", cfg.base.trim_end_matches('/'));
    let result = client
        .post(&url)
        .bearer_auth(&cfg.api_token)
        .json(&serde_json::json!({ "license_key": cfg.license_key }))
        .send()
        .await;

    let resp = match result {
        Ok(resp) => resp,
        Err(err) if err.is_timeout() => return ValidationOutcome::Timeout,
        Err(err) => return ValidationOutcome::Failed(err.to_string()),
    };

    match resp.status().as_u16() {
        200..=299 => match resp.json::<ValidationBody>().await {
            Ok(body) => ValidationOutcome::Success {
                valid: body.valid,
                bot_assigned: body.bot_assigned,
                details: body.details,
                features: features_from_body(body.features),
            },
            Err(err) => ValidationOutcome::Failed(format!("bad validation body: {err}")),
        },
        429 => ValidationOutcome::RateLimited,
        code => ValidationOutcome::Failed(format!("validation returned http {code}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn success(valid: bool, bot: bool) -> ValidationOutcome {
        ValidationOutcome::Success {
            valid,
            bot_assigned: bot,
            details: Some("ok".to_string()),
            features: vec![FEATURE_NOTIFICATIONS.to_string()],
        }
    }

    #[test]
    fn verdict_transitions() {
        let mut state = LicenseState::default();
        assert_eq!(state.verdict, Verdict::Unknown);

        state.apply(success(true, true), Utc::now());
        assert_eq!(state.verdict, Verdict::Valid);
        assert!(state.notifications_enabled());

        state.apply(success(true, false), Utc::now());
        assert_eq!(state.verdict, Verdict::PartialValid);
        assert!(!state.notifications_enabled());

        state.apply(success(false, false), Utc::now());
        assert_eq!(state.verdict, Verdict::Invalid);
        assert!(!state.notifications_enabled());
    }

    #[test]
    fn rate_limited_freezes_previous_verdict() {
        let mut state = LicenseState::default();
        state.apply(success(true, true), Utc::now());
        let before = state.clone();

        state.apply(ValidationOutcome::RateLimited, Utc::now());

        // The previous triple is retained; only the error field changes.
        assert_eq!(state.valid, before.valid);
        assert_eq!(state.bot_assigned, before.bot_assigned);
        assert_eq!(state.details, before.details);
        assert_eq!(state.verdict, Verdict::Valid);
        assert_eq!(state.error, Some(LicenseErrorKind::RateLimited));
        // Gating is unchanged by a rate-limited refresh.
        assert!(state.notifications_enabled());
    }

    #[test]
    fn timeout_leaves_state_unchanged() {
        let mut state = LicenseState::default();
        state.apply(success(true, true), Utc::now());
        let checked_at = state.last_checked;

        state.apply(ValidationOutcome::Timeout, Utc::now());
        assert_eq!(state.verdict, Verdict::Valid);
        assert_eq!(state.last_checked, checked_at);
        assert_eq!(state.error, Some(LicenseErrorKind::Timeout));
    }

    #[test]
    fn repeated_hard_failures_block_notifications() {
        let mut state = LicenseState::default();
        state.apply(success(true, true), Utc::now());

        for _ in 0..HARD_FAILURE_LIMIT {
            state.apply(
                ValidationOutcome::Failed("boom".to_string()),
                Utc::now(),
            );
        }
        assert_eq!(state.verdict, Verdict::Valid);
        assert!(!state.notifications_enabled());

        // Recovery clears the failure streak.
        state.apply(success(true, true), Utc::now());
        assert!(state.notifications_enabled());
    }

    #[test]
    fn features_absent_or_non_list_means_disabled() {
        assert!(features_from_body(None).is_empty());
        assert!(features_from_body(Some(json!("notifications"))).is_empty());
        assert!(features_from_body(Some(json!({"a": 1}))).is_empty());
        assert_eq!(
            features_from_body(Some(json!(["notifications", 5, "x"]))),
            vec!["notifications".to_string(), "x".to_string()]
        );

        let mut state = LicenseState::default();
        state.apply(
            ValidationOutcome::Success {
                valid: true,
                bot_assigned: true,
                details: None,
                features: Vec::new(),
            },
            Utc::now(),
        );
        assert_eq!(state.verdict, Verdict::Valid);
        assert!(!state.feature_enabled(FEATURE_NOTIFICATIONS));
        assert!(!state.notifications_enabled());
    }

    #[test]
    fn counters_survive_transitions() {
        let counters = NotificationCounters::default();
        counters.increment(CountKind::System);
        counters.increment(CountKind::Killmail);
        counters.increment(CountKind::Killmail);

        let mut state = LicenseState::default();
        state.apply(success(false, false), Utc::now());
        state.apply(ValidationOutcome::RateLimited, Utc::now());

        let snap = counters.snapshot();
        assert_eq!(snap.system, 1);
        assert_eq!(snap.character, 0);
        assert_eq!(snap.killmail, 2);
    }

    #[test]
    fn sentinel_mode_requires_dev_and_empty_key() {
        let dev_empty = LicenseConfig {
            base: String::new(),
            license_key: String::new(),
            api_token: String::new(),
            refresh_interval: Duration::from_secs(60),
            dev_mode: true,
        };
        assert!(dev_empty.sentinel_mode());

        let prod_empty = LicenseConfig {
            dev_mode: false,
            ..dev_empty.clone()
        };
        assert!(!prod_empty.sentinel_mode());

        let dev_with_key = LicenseConfig {
            license_key: "key".to_string(),
            ..dev_empty
        };
        assert!(!dev_with_key.sentinel_mode());
    }
}
