use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, IntegrityViolation};
use crate::item::PartitionKind;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Transaction isolation level requested from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl FromStr for IsolationLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(ConfigError::Invalid(format!("unknown isolation level '{other}'"))),
        }
    }
}

/// Where an item attempt runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// On the processor thread; the wall-clock budget is not enforced.
    Inline,
    /// On a dedicated worker thread under supervision.
    Worker,
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inline" => Ok(ExecutionMode::Inline),
            "worker" => Ok(ExecutionMode::Worker),
            other => Err(ConfigError::Invalid(format!("unknown execution mode '{other}'"))),
        }
    }
}

/// Integrity violations that are retried instead of failing the item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityPattern {
    /// Matched as a case-insensitive substring of the violating table.
    pub table: String,
    pub codes: Vec<String>,
}

impl IntegrityPattern {
    pub fn matches(&self, violation: &IntegrityViolation) -> bool {
        violation
            .table
            .to_ascii_lowercase()
            .contains(&self.table.to_ascii_lowercase())
            && self.codes.iter().any(|c| c == &violation.code)
    }
}

/// Scheduler configuration, typically parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Items fetched per past-batch query.
    #[serde(default = "default_past_batch_size")]
    pub past_batch_size: usize,
    /// Items older than this are processed in the past phase.
    #[serde(default = "default_past_age")]
    pub past_age_secs: u64,
    /// Wall-clock budget of one item attempt.
    #[serde(default = "default_item_timeout")]
    pub item_timeout_ms: u64,
    /// Wait after each escalation step before the next one.
    #[serde(default = "default_timeout_grace")]
    pub timeout_grace_ms: u64,
    /// Internal budget handed to business steps.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_ms: u64,
    /// Added to `item_timeout_ms` by the supervisor.
    #[serde(default = "default_step_timeout_margin")]
    pub step_timeout_margin_ms: u64,
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,
    /// Denied pause requests tolerated while keeping acquired tokens.
    #[serde(default = "default_max_pause_request_attempts")]
    pub max_pause_request_attempts: u32,
    #[serde(default = "default_pause_retry_sleep")]
    pub pause_retry_sleep_ms: u64,
    #[serde(default = "default_pause_wait_timeout")]
    pub pause_wait_timeout_ms: u64,
    #[serde(default = "default_pause_poll_interval")]
    pub pause_poll_interval_ms: u64,
    #[serde(default = "default_pause_report_interval")]
    pub pause_report_interval_ms: u64,
    #[serde(default = "default_true")]
    pub cleanup_enabled: bool,
    #[serde(default = "default_cleanup_batch_size")]
    pub cleanup_batch_size: usize,
    #[serde(default = "default_cleanup_max_items")]
    pub cleanup_max_items: usize,
    #[serde(default = "default_cleanup_max_duration")]
    pub cleanup_max_duration_ms: u64,
    /// `DonePurge` items are removed once completed for this long.
    #[serde(default = "default_purge_delay")]
    pub purge_delay_secs: u64,
    /// Index materialization limit per call, as a multiple of the batch size.
    #[serde(default = "default_materialize_batch_multiplier")]
    pub materialize_batch_multiplier: usize,
    #[serde(default = "default_isolation")]
    pub global_isolation: IsolationLevel,
    #[serde(default = "default_isolation")]
    pub resource_isolation: IsolationLevel,
    #[serde(default = "default_driver_sleep")]
    pub driver_sleep_ms: u64,
    /// Deadline window of one `run_once` call.
    #[serde(default = "default_run_budget")]
    pub run_budget_secs: u64,
    /// Cooldown after a temporary-with-delay failure.
    #[serde(default = "default_temporary_delay")]
    pub temporary_delay_ms: u64,
    /// Attempts of a short scheduler transaction that fails on a conflict.
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,
    #[serde(default = "default_sub_item_attempt_warning")]
    pub sub_item_attempt_warning: u32,
    #[serde(default = "default_sub_item_attempt_fatal")]
    pub sub_item_attempt_fatal: u32,
    /// Exit as soon as a forced abort fails, without killing the connection.
    #[serde(default)]
    pub exit_on_failed_abort: bool,
    #[serde(default = "default_transient_integrity")]
    pub transient_integrity: Vec<IntegrityPattern>,
}

fn default_past_batch_size() -> usize { 8 }
fn default_past_age() -> u64 { 20 * 60 }
fn default_item_timeout() -> u64 { 2 * 60 * 1000 }
fn default_timeout_grace() -> u64 { 2000 }
fn default_step_timeout() -> u64 { 40_000 }
fn default_step_timeout_margin() -> u64 { 2000 }
fn default_execution_mode() -> ExecutionMode { ExecutionMode::Worker }
fn default_max_pause_request_attempts() -> u32 { 5 }
fn default_pause_retry_sleep() -> u64 { 100 }
fn default_pause_wait_timeout() -> u64 { 10_000 }
fn default_pause_poll_interval() -> u64 { 100 }
fn default_pause_report_interval() -> u64 { 2000 }
fn default_true() -> bool { true }
fn default_cleanup_batch_size() -> usize { 50 }
fn default_cleanup_max_items() -> usize { 500 }
fn default_cleanup_max_duration() -> u64 { 10_000 }
fn default_purge_delay() -> u64 { 24 * 3600 }
fn default_materialize_batch_multiplier() -> usize { 10 }
fn default_isolation() -> IsolationLevel { IsolationLevel::Serializable }
fn default_driver_sleep() -> u64 { 1000 }
fn default_run_budget() -> u64 { 24 * 3600 }
fn default_temporary_delay() -> u64 { 2000 }
fn default_store_retry_attempts() -> u32 { 10 }
fn default_sub_item_attempt_warning() -> u32 { 100 }
fn default_sub_item_attempt_fatal() -> u32 { 10_000 }

fn default_transient_integrity() -> Vec<IntegrityPattern> {
    vec![IntegrityPattern {
        table: "reason_slot".into(),
        codes: vec!["23514".into(), "23P01".into()],
    }]
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            past_batch_size: default_past_batch_size(),
            past_age_secs: default_past_age(),
            item_timeout_ms: default_item_timeout(),
            timeout_grace_ms: default_timeout_grace(),
            step_timeout_ms: default_step_timeout(),
            step_timeout_margin_ms: default_step_timeout_margin(),
            execution_mode: default_execution_mode(),
            max_pause_request_attempts: default_max_pause_request_attempts(),
            pause_retry_sleep_ms: default_pause_retry_sleep(),
            pause_wait_timeout_ms: default_pause_wait_timeout(),
            pause_poll_interval_ms: default_pause_poll_interval(),
            pause_report_interval_ms: default_pause_report_interval(),
            cleanup_enabled: default_true(),
            cleanup_batch_size: default_cleanup_batch_size(),
            cleanup_max_items: default_cleanup_max_items(),
            cleanup_max_duration_ms: default_cleanup_max_duration(),
            purge_delay_secs: default_purge_delay(),
            materialize_batch_multiplier: default_materialize_batch_multiplier(),
            global_isolation: default_isolation(),
            resource_isolation: default_isolation(),
            driver_sleep_ms: default_driver_sleep(),
            run_budget_secs: default_run_budget(),
            temporary_delay_ms: default_temporary_delay(),
            store_retry_attempts: default_store_retry_attempts(),
            sub_item_attempt_warning: default_sub_item_attempt_warning(),
            sub_item_attempt_fatal: default_sub_item_attempt_fatal(),
            exit_on_failed_abort: false,
            transient_integrity: default_transient_integrity(),
        }
    }
}

// ── Loading & Validation ────────────────────────────────────────────

impl SchedulerConfig {
    /// Parse config from a TOML string, then apply `SHOPFLOOR_*` overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn parse<T: FromStr>(key: &str, raw: String) -> Result<T, ConfigError> {
            raw.parse()
                .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse '{raw}'")))
        }

        if let Some(v) = lookup("SHOPFLOOR_PAST_BATCH_SIZE") {
            self.past_batch_size = parse("SHOPFLOOR_PAST_BATCH_SIZE", v)?;
        }
        if let Some(v) = lookup("SHOPFLOOR_ITEM_TIMEOUT_MS") {
            self.item_timeout_ms = parse("SHOPFLOOR_ITEM_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("SHOPFLOOR_EXECUTION_MODE") {
            self.execution_mode = v.parse()?;
        }
        if let Some(v) = lookup("SHOPFLOOR_DRIVER_SLEEP_MS") {
            self.driver_sleep_ms = parse("SHOPFLOOR_DRIVER_SLEEP_MS", v)?;
        }
        if let Some(v) = lookup("SHOPFLOOR_CLEANUP_ENABLED") {
            self.cleanup_enabled = parse("SHOPFLOOR_CLEANUP_ENABLED", v)?;
        }
        if let Some(v) = lookup("SHOPFLOOR_PURGE_DELAY_SECS") {
            self.purge_delay_secs = parse("SHOPFLOOR_PURGE_DELAY_SECS", v)?;
        }
        if let Some(v) = lookup("SHOPFLOOR_GLOBAL_ISOLATION") {
            self.global_isolation = v.parse()?;
        }
        if let Some(v) = lookup("SHOPFLOOR_RESOURCE_ISOLATION") {
            self.resource_isolation = v.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.past_batch_size == 0 {
            return Err(ConfigError::Invalid("past_batch_size must be positive".into()));
        }
        if self.cleanup_batch_size == 0 {
            return Err(ConfigError::Invalid("cleanup_batch_size must be positive".into()));
        }
        if self.materialize_batch_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "materialize_batch_multiplier must be positive".into(),
            ));
        }
        if self.store_retry_attempts == 0 {
            return Err(ConfigError::Invalid("store_retry_attempts must be positive".into()));
        }
        if self.sub_item_attempt_fatal == 0
            || self.sub_item_attempt_warning > self.sub_item_attempt_fatal
        {
            return Err(ConfigError::Invalid(format!(
                "sub_item_attempt_warning ({}) must not exceed sub_item_attempt_fatal ({})",
                self.sub_item_attempt_warning, self.sub_item_attempt_fatal
            )));
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn past_age(&self) -> Duration { Duration::from_secs(self.past_age_secs) }
    pub fn timeout_grace(&self) -> Duration { Duration::from_millis(self.timeout_grace_ms) }
    pub fn step_timeout(&self) -> Duration { Duration::from_millis(self.step_timeout_ms) }
    pub fn pause_retry_sleep(&self) -> Duration { Duration::from_millis(self.pause_retry_sleep_ms) }
    pub fn pause_wait_timeout(&self) -> Duration { Duration::from_millis(self.pause_wait_timeout_ms) }
    pub fn pause_poll_interval(&self) -> Duration { Duration::from_millis(self.pause_poll_interval_ms) }
    pub fn pause_report_interval(&self) -> Duration { Duration::from_millis(self.pause_report_interval_ms) }
    pub fn cleanup_max_duration(&self) -> Duration { Duration::from_millis(self.cleanup_max_duration_ms) }
    pub fn purge_delay(&self) -> Duration { Duration::from_secs(self.purge_delay_secs) }
    pub fn driver_sleep(&self) -> Duration { Duration::from_millis(self.driver_sleep_ms) }
    pub fn run_budget(&self) -> Duration { Duration::from_secs(self.run_budget_secs) }
    pub fn temporary_delay(&self) -> Duration { Duration::from_millis(self.temporary_delay_ms) }

    /// Wall-clock budget the supervisor enforces on one attempt.
    pub fn supervised_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms + self.step_timeout_margin_ms)
    }

    pub fn isolation_for(&self, kind: PartitionKind) -> IsolationLevel {
        match kind {
            PartitionKind::Global => self.global_isolation,
            PartitionKind::Resource => self.resource_isolation,
        }
    }

    pub fn materialize_limit(&self) -> usize {
        self.past_batch_size * self.materialize_batch_multiplier
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Scheduler config:");
        tracing::info!(
            "  queue:    past_batch_size={}, past_age={}s",
            self.past_batch_size,
            self.past_age_secs
        );
        tracing::info!(
            "  timeouts: item={}ms (+{}ms margin), grace={}ms, step={}ms, mode={:?}",
            self.item_timeout_ms,
            self.step_timeout_margin_ms,
            self.timeout_grace_ms,
            self.step_timeout_ms,
            self.execution_mode
        );
        tracing::info!(
            "  cleanup:  enabled={}, batch={}, max_items={}, max_duration={}ms, purge_delay={}s",
            self.cleanup_enabled,
            self.cleanup_batch_size,
            self.cleanup_max_items,
            self.cleanup_max_duration_ms,
            self.purge_delay_secs
        );
        tracing::info!(
            "  isolation: global={:?}, resource={:?}, store_retries={}",
            self.global_isolation,
            self.resource_isolation,
            self.store_retry_attempts
        );
    }
}
