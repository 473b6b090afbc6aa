// ABOUTME: Sliding-window rate governor keyed by role, category, and tool.
// ABOUTME: Admits or denies calls with burst protection and a background sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{GovernorError, Result};

/// Name of the rule every category falls back to.
pub const DEFAULT_RULE: &str = "default";

/// Two calls closer together than this count as a burst.
const BURST_INTERVAL: Duration = Duration::from_secs(1);

/// Floor on how long [`RateGovernor::acquire`] sleeps between attempts.
const MIN_ACQUIRE_WAIT: Duration = Duration::from_millis(10);

/// Limits applied to one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Calls admitted per window.
    pub max_requests: u32,
    /// Length of the sliding window.
    pub window_seconds: u64,
    /// In-window count at which back-to-back calls start being refused.
    pub burst_limit: u32,
}

impl RateLimitRule {
    pub const fn new(max_requests: u32, window_seconds: u64, burst_limit: u32) -> Self {
        Self {
            max_requests,
            window_seconds,
            burst_limit,
        }
    }

    fn window(&self) -> Result<Duration> {
        if self.window_seconds == 0 {
            return Err(GovernorError::Validation(
                "rate limit window must be positive".to_string(),
            ));
        }
        Ok(Duration::from_secs(self.window_seconds))
    }

    fn merge(&mut self, update: &RuleUpdate) {
        if let Some(v) = update.max_requests {
            self.max_requests = v;
        }
        if let Some(v) = update.window_seconds {
            self.window_seconds = v;
        }
        if let Some(v) = update.burst_limit {
            self.burst_limit = v;
        }
    }
}

/// A partial rule; unset fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub max_requests: Option<u32>,
    pub window_seconds: Option<u64>,
    pub burst_limit: Option<u32>,
}

impl RuleUpdate {
    pub fn max_requests(mut self, v: u32) -> Self {
        self.max_requests = Some(v);
        self
    }

    pub fn window_seconds(mut self, v: u64) -> Self {
        self.window_seconds = Some(v);
        self
    }

    pub fn burst_limit(mut self, v: u32) -> Self {
        self.burst_limit = Some(v);
        self
    }
}

/// What to do when the governor itself cannot evaluate a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the call.
    #[default]
    FailOpen,
    /// Deny the call.
    FailClosed,
}

/// Built-in rules for the categories tools are usually grouped under.
pub fn default_rules() -> HashMap<String, RateLimitRule> {
    [
        ("user_interaction", RateLimitRule::new(10, 60, 5)),
        ("web_services", RateLimitRule::new(100, 60, 20)),
        ("file_operations", RateLimitRule::new(50, 60, 10)),
        ("development_tools", RateLimitRule::new(30, 60, 5)),
        ("system_utilities", RateLimitRule::new(20, 60, 3)),
        (DEFAULT_RULE, RateLimitRule::new(30, 60, 5)),
    ]
    .into_iter()
    .map(|(name, rule)| (name.to_string(), rule))
    .collect()
}

/// Configuration for a [`RateGovernor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateGovernorConfig {
    pub rules: HashMap<String, RateLimitRule>,
    /// How often expired timestamps are swept.
    pub sweep_interval: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for RateGovernorConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            sweep_interval: Duration::from_secs(60),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl RateGovernorConfig {
    /// Set or replace the rule for a category.
    pub fn rule(mut self, category: impl Into<String>, rule: RateLimitRule) -> Self {
        self.rules.insert(category.into(), rule);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// Identifies one usage record: `role:category:tool`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TrackingKey {
    pub role: String,
    pub category: String,
    pub tool: String,
}

impl TrackingKey {
    pub fn new(role: &str, category: &str, tool: &str) -> Self {
        Self {
            role: role.to_string(),
            category: category.to_string(),
            tool: tool.to_string(),
        }
    }
}

impl std::fmt::Display for TrackingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.role, self.category, self.tool)
    }
}

/// Remaining capacity for one tracking key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaInfo {
    pub remaining: u32,
    pub total: u32,
    pub used: u32,
    /// When the oldest in-window call ages out; `None` if nothing is in the window.
    pub reset_time: Option<DateTime<Utc>>,
    /// Same moment as `reset_time`, relative to now.
    pub reset_after: Option<Duration>,
    pub window_seconds: u64,
    pub category: String,
    pub role: String,
    /// Set when the quota could not be evaluated.
    pub error: Option<String>,
}

/// When a dynamic adjustment takes effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentCondition {
    /// Wall-clock window; an unset bound is open.
    TimeWindow {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
    /// In-window calls across the whole category reach `threshold`.
    UsageAtLeast { threshold: u32 },
}

/// An override merged into a category's rule when any of its conditions holds.
///
/// An adjustment with no conditions always applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicAdjustment {
    pub conditions: Vec<AdjustmentCondition>,
    pub new_limits: RuleUpdate,
}

impl DynamicAdjustment {
    pub fn new(new_limits: RuleUpdate) -> Self {
        Self {
            conditions: Vec::new(),
            new_limits,
        }
    }

    pub fn between(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.conditions
            .push(AdjustmentCondition::TimeWindow { start, end });
        self
    }

    pub fn when_usage_at_least(mut self, threshold: u32) -> Self {
        self.conditions
            .push(AdjustmentCondition::UsageAtLeast { threshold });
        self
    }

    fn is_due(&self, now: DateTime<Utc>, category_usage: u32) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        self.conditions.iter().any(|condition| match condition {
            AdjustmentCondition::TimeWindow { start, end } => {
                start.is_none_or(|s| now >= s) && end.is_none_or(|e| now <= e)
            }
            AdjustmentCondition::UsageAtLeast { threshold } => category_usage >= *threshold,
        })
    }
}

/// Usage of one tool by one role.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStats {
    /// Calls still tracked, i.e. inside the window.
    pub total_calls: usize,
    pub recent_calls_1h: usize,
    pub last_called: Option<DateTime<Utc>>,
}

/// Category → role → tool → usage.
pub type UsageStatistics = HashMap<String, HashMap<String, HashMap<String, UsageStats>>>;

/// Snapshot of configured rules and tracked keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitInfo {
    pub rules: HashMap<String, RateLimitRule>,
    pub tracked_keys: Vec<String>,
    pub dynamic_adjustments: Vec<String>,
}

#[derive(Default)]
struct GovernorState {
    rules: HashMap<String, RateLimitRule>,
    usage: HashMap<TrackingKey, VecDeque<Instant>>,
    adjustments: HashMap<String, DynamicAdjustment>,
}

impl GovernorState {
    fn rule_for(&self, category: &str) -> RateLimitRule {
        self.rules
            .get(category)
            .or_else(|| self.rules.get(DEFAULT_RULE))
            .copied()
            .unwrap_or(RateLimitRule::new(30, 60, 5))
    }

    /// Admit `key` at `now` or say why not.
    fn try_admit(&mut self, key: &TrackingKey, now: Instant) -> Result<bool> {
        let rule = self.rule_for(&key.category);
        let window = rule.window()?;
        let record = self.usage.entry(key.clone()).or_default();
        prune(record, now, window);

        let used = record.len();
        if used >= rule.max_requests as usize {
            debug!(tracking_key = %key, used, max = rule.max_requests, "Rate limit reached");
            return Ok(false);
        }
        if used >= rule.burst_limit as usize {
            if let Some(last) = record.back() {
                if now.saturating_duration_since(*last) < BURST_INTERVAL {
                    debug!(tracking_key = %key, used, burst = rule.burst_limit, "Burst limit reached");
                    return Ok(false);
                }
            }
        }

        record.push_back(now);
        Ok(true)
    }

    /// In-window timestamps for `key`, without mutating anything.
    fn in_window(&self, key: &TrackingKey, now: Instant, window: Duration) -> Vec<Instant> {
        let cutoff = now.checked_sub(window);
        self.usage
            .get(key)
            .map(|record| {
                record
                    .iter()
                    .copied()
                    .filter(|t| cutoff.is_none_or(|c| *t > c))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn category_usage(&self, category: &str, now: Instant) -> u32 {
        let Ok(window) = self.rule_for(category).window() else {
            return 0;
        };
        let cutoff = now.checked_sub(window);
        let count: usize = self
            .usage
            .iter()
            .filter(|(key, _)| key.category == category)
            .map(|(_, record)| {
                record
                    .iter()
                    .filter(|t| cutoff.is_none_or(|c| **t > c))
                    .count()
            })
            .sum();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Drop expired timestamps and empty keys. Returns the number of keys removed.
    fn sweep(&mut self, now: Instant) -> usize {
        let rules = &self.rules;
        let before = self.usage.len();
        self.usage.retain(|key, record| {
            let rule = rules
                .get(&key.category)
                .or_else(|| rules.get(DEFAULT_RULE))
                .copied();
            // Keys under an invalid rule are kept until the rule is fixed.
            if let Some(window) = rule.and_then(|r| r.window().ok()) {
                prune(record, now, window);
            }
            !record.is_empty()
        });
        before - self.usage.len()
    }
}

/// Remove timestamps at or before `now - window`.
fn prune(record: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    let Some(cutoff) = now.checked_sub(window) else {
        return;
    };
    while record.front().is_some_and(|t| *t <= cutoff) {
        record.pop_front();
    }
}

/// Map a monotonic instant onto the wall clock.
fn wall_time(at: Instant, now: Instant, wall_now: DateTime<Utc>) -> DateTime<Utc> {
    if at <= now {
        wall_now - to_chrono(now.duration_since(at))
    } else {
        wall_now + to_chrono(at.duration_since(now))
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Sliding-window rate governor.
///
/// Calls are tracked per `role:category:tool`. A call is denied once the
/// in-window count reaches the category's `max_requests`, or once it reaches
/// `burst_limit` and the previous call landed less than a second ago.
///
/// A background task started at construction prunes expired timestamps
/// every `sweep_interval`; [`RateGovernor::shutdown`] stops it.
pub struct RateGovernor {
    state: Arc<Mutex<GovernorState>>,
    failure_policy: FailurePolicy,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(RateGovernorConfig::default())
    }
}

impl RateGovernor {
    /// Create a governor. Starts the sweep task when called inside a tokio runtime.
    pub fn new(config: RateGovernorConfig) -> Self {
        let state = Arc::new(Mutex::new(GovernorState {
            rules: config.rules,
            ..Default::default()
        }));
        let cancel = CancellationToken::new();

        let sweeper = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(sweep_loop(
                Arc::clone(&state),
                config.sweep_interval,
                cancel.clone(),
            ))),
            Err(_) => {
                debug!("No tokio runtime; rate governor sweep disabled");
                None
            }
        };

        Self {
            state,
            failure_policy: config.failure_policy,
            cancel,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Admit or deny one call. Admission records the call.
    pub fn check_rate_limit(&self, role: &str, category: &str, tool: &str) -> bool {
        let key = TrackingKey::new(role, category, tool);
        let outcome = self.state.lock().try_admit(&key, Instant::now());
        match outcome {
            Ok(allowed) => allowed,
            Err(err) => {
                let allowed = self.failure_policy == FailurePolicy::FailOpen;
                error!(
                    tracking_key = %key,
                    error = %err,
                    allowed,
                    "Rate limit check failed"
                );
                allowed
            }
        }
    }

    /// Wait until a call is admitted, or fail with `Cancelled` when `cancel` resolves first.
    pub async fn acquire<F>(&self, role: &str, category: &str, tool: &str, cancel: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(cancel);

        loop {
            if self.check_rate_limit(role, category, tool) {
                return Ok(());
            }

            let quota = self.get_remaining_quota(role, category, tool);
            let wait = quota
                .reset_after
                .unwrap_or(BURST_INTERVAL)
                .min(BURST_INTERVAL)
                .max(MIN_ACQUIRE_WAIT);

            tokio::select! {
                biased;
                () = &mut cancel => {
                    return Err(GovernorError::Cancelled);
                }
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Remaining capacity for a key. Never records a call.
    pub fn get_remaining_quota(&self, role: &str, category: &str, tool: &str) -> QuotaInfo {
        let key = TrackingKey::new(role, category, tool);
        let state = self.state.lock();
        let rule = state.rule_for(category);

        let mut info = QuotaInfo {
            remaining: 0,
            total: rule.max_requests,
            used: 0,
            reset_time: None,
            reset_after: None,
            window_seconds: rule.window_seconds,
            category: category.to_string(),
            role: role.to_string(),
            error: None,
        };

        let window = match rule.window() {
            Ok(window) => window,
            Err(err) => {
                error!(tracking_key = %key, error = %err, "Quota lookup failed");
                info.error = Some(err.to_string());
                return info;
            }
        };

        let now = Instant::now();
        let timestamps = state.in_window(&key, now, window);
        let used = u32::try_from(timestamps.len()).unwrap_or(u32::MAX);
        info.used = used;
        info.remaining = rule.max_requests.saturating_sub(used);
        if let Some(oldest) = timestamps.first() {
            let reset_at = *oldest + window;
            info.reset_after = Some(reset_at.saturating_duration_since(now));
            info.reset_time = Some(wall_time(reset_at, now, Utc::now()));
        }
        info
    }

    /// Merge `update` into a category's rule, creating it from the default rule if absent.
    pub fn update_rule(&self, category: &str, update: RuleUpdate) {
        let mut state = self.state.lock();
        let mut rule = state
            .rules
            .get(category)
            .copied()
            .unwrap_or_else(|| state.rule_for(DEFAULT_RULE));
        rule.merge(&update);
        state.rules.insert(category.to_string(), rule);
        info!(
            category,
            max_requests = rule.max_requests,
            window_seconds = rule.window_seconds,
            burst_limit = rule.burst_limit,
            "Rate limit rule updated"
        );
    }

    /// The rule that applies to `category`.
    pub fn rule(&self, category: &str) -> RateLimitRule {
        self.state.lock().rule_for(category)
    }

    /// Configured rules (all, or just `category`) plus tracked keys.
    pub fn rate_limit_info(&self, category: Option<&str>) -> RateLimitInfo {
        let state = self.state.lock();
        let rules = match category {
            Some(c) => [(c.to_string(), state.rule_for(c))].into_iter().collect(),
            None => state.rules.clone(),
        };
        let mut tracked_keys: Vec<_> = state
            .usage
            .keys()
            .filter(|k| category.is_none_or(|c| k.category == c))
            .map(|k| k.to_string())
            .collect();
        tracked_keys.sort();
        let mut dynamic_adjustments: Vec<_> = state.adjustments.keys().cloned().collect();
        dynamic_adjustments.sort();

        RateLimitInfo {
            rules,
            tracked_keys,
            dynamic_adjustments,
        }
    }

    /// Register an adjustment for `category`, replacing any existing one.
    pub fn add_dynamic_adjustment(&self, category: &str, adjustment: DynamicAdjustment) {
        self.state
            .lock()
            .adjustments
            .insert(category.to_string(), adjustment);
        info!(category, "Dynamic rate adjustment added");
    }

    /// Returns true if an adjustment was registered for `category`.
    pub fn remove_dynamic_adjustment(&self, category: &str) -> bool {
        let removed = self.state.lock().adjustments.remove(category).is_some();
        if removed {
            info!(category, "Dynamic rate adjustment removed");
        }
        removed
    }

    /// Merge every due adjustment into its category rule. Returns the adjusted categories.
    pub fn apply_dynamic_adjustments(&self) -> Vec<String> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let wall_now = Utc::now();

        let due: Vec<(String, RuleUpdate)> = state
            .adjustments
            .iter()
            .filter(|(category, adjustment)| {
                adjustment.is_due(wall_now, state.category_usage(category, now))
            })
            .map(|(category, adjustment)| (category.clone(), adjustment.new_limits))
            .collect();

        let mut applied = Vec::with_capacity(due.len());
        for (category, update) in due {
            let mut rule = state
                .rules
                .get(&category)
                .copied()
                .unwrap_or_else(|| state.rule_for(DEFAULT_RULE));
            rule.merge(&update);
            state.rules.insert(category.clone(), rule);
            info!(category = %category, "Dynamic rate adjustment applied");
            applied.push(category);
        }
        applied.sort();
        applied
    }

    /// Per category, role, and tool usage over the tracked records.
    pub fn get_usage_statistics(&self) -> UsageStatistics {
        let state = self.state.lock();
        let now = Instant::now();
        let wall_now = Utc::now();
        let hour_ago = now.checked_sub(Duration::from_secs(3600));

        let mut stats = UsageStatistics::new();
        for (key, record) in &state.usage {
            let usage = UsageStats {
                total_calls: record.len(),
                recent_calls_1h: record
                    .iter()
                    .filter(|t| hour_ago.is_none_or(|h| **t > h))
                    .count(),
                last_called: record.back().map(|t| wall_time(*t, now, wall_now)),
            };
            stats
                .entry(key.category.clone())
                .or_default()
                .entry(key.role.clone())
                .or_default()
                .insert(key.tool.clone(), usage);
        }
        stats
    }

    /// Prune expired timestamps now. Returns the number of keys removed.
    pub fn prune_expired(&self) -> usize {
        self.state.lock().sweep(Instant::now())
    }

    /// Forget all recorded calls; rules and adjustments are kept.
    pub fn reset_usage(&self) {
        self.state.lock().usage.clear();
    }

    /// Stop the sweep task and wait for it. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
            info!("Rate governor stopped");
        }
    }
}

impl Drop for RateGovernor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sweep_loop(
    state: Arc<Mutex<GovernorState>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        let removed = state.lock().sweep(Instant::now());
        if removed > 0 {
            debug!(removed, "Swept expired rate limit keys");
        }
    }
}
