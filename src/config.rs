//! Configuration types and sources.
//!
//! Rules and settings are polled from a [`ConfigSource`] on demand, so edits
//! take effect on the next message without restarting the engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::pipeline::rules::Rule;

// ── Settings ────────────────────────────────────────────────────────

/// Runtime-tunable autopilot settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub working_hours: WorkingHoursConfig,
    pub limits: RateLimits,
    /// Number of fingerprints the dedup cache remembers.
    pub dedup_capacity: usize,
    /// Messages older than this are ignored unless a switch just happened.
    pub stale_after_secs: u64,
    /// How long after a switch older messages are still accepted.
    pub switch_cooldown_secs: u64,
    /// Generate a reply when no rule matched.
    pub ai_fallback: bool,
    /// History entries handed to the decision service.
    pub history_window: usize,
    pub intent: IntentSettings,
    pub health: HealthSettings,
    /// Lead tools the autopilot may send.
    pub lead_tools: Vec<LeadTool>,
    pub timings: Timings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            working_hours: WorkingHoursConfig::default(),
            limits: RateLimits::default(),
            dedup_capacity: 100,
            stale_after_secs: 120,
            switch_cooldown_secs: 10,
            ai_fallback: false,
            history_window: 20,
            intent: IntentSettings::default(),
            health: HealthSettings::default(),
            lead_tools: Vec::new(),
            timings: Timings::default(),
        }
    }
}

impl Settings {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn switch_cooldown(&self) -> Duration {
        Duration::from_secs(self.switch_cooldown_secs)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dedup_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "dedup_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let threshold = self.intent.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidValue {
                key: "intent.confidence_threshold".to_string(),
                message: format!("{threshold} is outside 0..=1"),
            });
        }
        Ok(())
    }

    /// Whether `tool_id` is one of the configured lead tools.
    pub fn is_lead_tool(&self, tool_id: &str) -> bool {
        self.lead_tools.iter().any(|t| t.id == tool_id)
    }
}

/// Daily working-hours window in local time, `"HH:MM"` bounds.
///
/// Both bounds are inclusive. A window whose end is before its start wraps
/// past midnight (`22:00`–`06:00`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingHoursConfig {
    pub enabled: bool,
    pub start: String,
    pub end: String,
}

impl Default for WorkingHoursConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start: "09:00".to_string(),
            end: "18:00".to_string(),
        }
    }
}

impl WorkingHoursConfig {
    /// Parsed `(start, end)` bounds, or `None` when disabled or malformed.
    ///
    /// A malformed window is treated as disabled and logged.
    pub fn window(&self) -> Option<(NaiveTime, NaiveTime)> {
        if !self.enabled {
            return None;
        }
        let start = NaiveTime::parse_from_str(self.start.trim(), "%H:%M");
        let end = NaiveTime::parse_from_str(self.end.trim(), "%H:%M");
        match (start, end) {
            (Ok(start), Ok(end)) => Some((start, end)),
            _ => {
                warn!(
                    start = %self.start,
                    end = %self.end,
                    "Invalid working hours, window disabled"
                );
                None
            }
        }
    }
}

/// Daily send caps. Zero means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub daily_reply_cap: u32,
    pub per_conversation_daily_cap: u32,
}

/// Gating for intent-driven lead-tool sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentSettings {
    pub enabled: bool,
    /// Minimum confidence before an intent decision is acted on.
    pub confidence_threshold: f32,
    /// Minimum seconds between intent-driven sends to one conversation.
    pub min_resend_interval_secs: u64,
}

impl Default for IntentSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_threshold: 0.7,
            min_resend_interval_secs: 3600,
        }
    }
}

impl IntentSettings {
    pub fn min_resend_interval(&self) -> Duration {
        Duration::from_secs(self.min_resend_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Consecutive failures before a recovery is attempted.
    pub failure_threshold: u32,
    /// Recoveries allowed per run.
    pub max_recoveries: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            max_recoveries: 3,
        }
    }
}

/// A lead-generation tool the surface can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadTool {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Delays and bounded waits, in milliseconds unless noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Wait after an activation before checking where we landed.
    pub settle_delay_ms: u64,
    /// Bounded wait for the input surface and send control.
    pub element_wait_ms: u64,
    /// How long the input has to empty after a submit.
    pub verify_window_ms: u64,
    pub poll_interval_ms: u64,
    /// Pause before the queue resumes after an internal failure.
    pub queue_recovery_delay_ms: u64,
    /// Message-list poll period when the surface has no change source (seconds).
    pub backup_poll_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 800,
            element_wait_ms: 5000,
            verify_window_ms: 2000,
            poll_interval_ms: 100,
            queue_recovery_delay_ms: 1000,
            backup_poll_secs: 5,
        }
    }
}

impl Timings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn element_wait(&self) -> Duration {
        Duration::from_millis(self.element_wait_ms)
    }

    pub fn verify_window(&self) -> Duration {
        Duration::from_millis(self.verify_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn queue_recovery_delay(&self) -> Duration {
        Duration::from_millis(self.queue_recovery_delay_ms)
    }

    pub fn backup_poll(&self) -> Duration {
        Duration::from_secs(self.backup_poll_secs.max(1))
    }
}

// ── Sources ─────────────────────────────────────────────────────────

/// Where rules and settings come from. Polled on every use.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn rules(&self) -> Result<Vec<Rule>, ConfigError>;

    async fn settings(&self) -> Result<Settings, ConfigError>;
}

/// In-memory configuration that can be swapped at runtime.
#[derive(Debug, Default)]
pub struct StaticConfig {
    settings: RwLock<Settings>,
    rules: RwLock<Vec<Rule>>,
}

impl StaticConfig {
    pub fn new(settings: Settings, rules: Vec<Rule>) -> Self {
        Self {
            settings: RwLock::new(settings),
            rules: RwLock::new(rules),
        }
    }

    pub async fn set_rules(&self, rules: Vec<Rule>) {
        *self.rules.write().await = rules;
    }

    pub async fn set_settings(&self, settings: Settings) {
        *self.settings.write().await = settings;
    }
}

#[async_trait]
impl ConfigSource for StaticConfig {
    async fn rules(&self) -> Result<Vec<Rule>, ConfigError> {
        Ok(self.rules.read().await.clone())
    }

    async fn settings(&self) -> Result<Settings, ConfigError> {
        Ok(self.settings.read().await.clone())
    }
}

/// On-disk layout read by [`FileConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub settings: Settings,
    pub rules: Vec<Rule>,
}

/// JSON configuration file, re-read on every poll.
#[derive(Debug, Clone)]
pub struct FileConfig {
    path: PathBuf,
}

impl FileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<ConfigFile, ConfigError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let file: ConfigFile = serde_json::from_str(&raw).map_err(|e| {
            ConfigError::ParseError(format!("{}: {e}", self.path.display()))
        })?;
        file.settings.validate()?;
        debug!(path = %self.path.display(), rules = file.rules.len(), "Loaded config file");
        Ok(file)
    }
}

#[async_trait]
impl ConfigSource for FileConfig {
    async fn rules(&self) -> Result<Vec<Rule>, ConfigError> {
        Ok(self.load().await?.rules)
    }

    async fn settings(&self) -> Result<Settings, ConfigError> {
        Ok(self.load().await?.settings)
    }
}

// ── Process environment ─────────────────────────────────────────────

/// Process-level options for the binary, read from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// JSON config file (`REPLY_PILOT_CONFIG`). Defaults apply when unset.
    pub config_path: Option<PathBuf>,
    /// libsql database path (`REPLY_PILOT_DB_PATH`). In-memory store when unset.
    pub db_path: Option<PathBuf>,
    /// Decision service base URL (`REPLY_PILOT_DECISION_URL`).
    pub decision_url: Option<String>,
    pub decision_key: Option<secrecy::SecretString>,
    pub decision_timeout: Duration,
    /// Directory for rolling log files (`REPLY_PILOT_LOG_DIR`).
    pub log_dir: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());

        let decision_timeout_secs: u64 = std::env::var("REPLY_PILOT_DECISION_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(15);

        Self {
            config_path: non_empty("REPLY_PILOT_CONFIG").map(PathBuf::from),
            db_path: non_empty("REPLY_PILOT_DB_PATH").map(PathBuf::from),
            decision_url: non_empty("REPLY_PILOT_DECISION_URL"),
            decision_key: non_empty("REPLY_PILOT_DECISION_KEY").map(secrecy::SecretString::from),
            decision_timeout: Duration::from_secs(decision_timeout_secs),
            log_dir: non_empty("REPLY_PILOT_LOG_DIR").map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::rules::{MatchLogic, MatchType};

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.dedup_capacity, 100);
        assert_eq!(s.stale_after(), Duration::from_secs(120));
        assert_eq!(s.switch_cooldown(), Duration::from_secs(10));
        assert_eq!(s.health.failure_threshold, 5);
        assert_eq!(s.health.max_recoveries, 3);
        assert_eq!(s.timings.element_wait(), Duration::from_secs(5));
        assert!(!s.working_hours.enabled);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: Settings = serde_json::from_str(
            r#"{"limits": {"daily_reply_cap": 50}, "lead_tools": [{"id": "form-1"}]}"#,
        )
        .unwrap();
        assert_eq!(s.limits.daily_reply_cap, 50);
        assert_eq!(s.limits.per_conversation_daily_cap, 0);
        assert_eq!(s.dedup_capacity, 100);
        assert!(s.is_lead_tool("form-1"));
        assert!(!s.is_lead_tool("form-2"));
    }

    #[test]
    fn working_hours_window() {
        let mut wh = WorkingHoursConfig::default();
        assert!(wh.window().is_none());

        wh.enabled = true;
        let (start, end) = wh.window().unwrap();
        assert_eq!(start, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(end, NaiveTime::from_hms_opt(18, 0, 0).unwrap());

        wh.end = "25:99".into();
        assert!(wh.window().is_none());
    }

    #[tokio::test]
    async fn static_config_updates() {
        let config = StaticConfig::default();
        assert!(config.rules().await.unwrap().is_empty());

        config
            .set_rules(vec![Rule::keyword("r1", &["hello"], "hi there")])
            .await;
        let mut settings = Settings::default();
        settings.ai_fallback = true;
        config.set_settings(settings).await;

        assert_eq!(config.rules().await.unwrap().len(), 1);
        assert!(config.settings().await.unwrap().ai_fallback);
    }

    #[tokio::test]
    async fn file_config_reads_settings_and_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "settings": {"working_hours": {"enabled": true, "start": "22:00", "end": "06:00"}},
                "rules": [{
                    "id": "price",
                    "keywords": ["price", "cost"],
                    "matchType": "contains",
                    "matchLogic": "OR",
                    "priority": 5,
                    "response": "It is 10 dollars."
                }]
            }"#,
        )
        .unwrap();

        let config = FileConfig::new(&path);
        let rules = config.rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].match_type, MatchType::Contains);
        assert_eq!(rules[0].match_logic, MatchLogic::Or);
        assert!(rules[0].enabled);

        let settings = config.settings().await.unwrap();
        assert!(settings.working_hours.enabled);
        assert_eq!(settings.working_hours.start, "22:00");
    }

    #[tokio::test]
    async fn file_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = FileConfig::new(dir.path().join("nope.json"));
        assert!(matches!(
            missing.settings().await.unwrap_err(),
            ConfigError::Io(_)
        ));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            FileConfig::new(&path).rules().await.unwrap_err(),
            ConfigError::ParseError(_)
        ));

        let path = dir.path().join("invalid.json");
        std::fs::write(&path, r#"{"settings": {"intent": {"confidence_threshold": 1.5}}}"#).unwrap();
        assert!(matches!(
            FileConfig::new(&path).settings().await.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }
}
