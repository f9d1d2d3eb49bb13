use crate::error::{Result, TremorError};
use crate::extract::{ExtractionMode, ExtractionProfile};
use crate::paths;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Upper bound accepted for minute-valued settings: one year.
pub const MAX_MINUTES: i64 = 525_600;

/// Negative values count as zero; values chrono cannot hold saturate.
fn minutes_saturating(minutes: i64) -> chrono::Duration {
    chrono::Duration::try_minutes(minutes.max(0)).unwrap_or(chrono::Duration::MAX)
}

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SourceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub primary_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Repeats of an unchanged primary hash before it is considered stale.
    #[serde(default = "default_stale_after_repeats")]
    pub stale_after_repeats: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_stale_after_repeats() -> usize {
    3
}

fn default_user_agent() -> String {
    format!("tremor/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            primary_url: String::new(),
            fallback_url: None,
            timeout_secs: default_timeout_secs(),
            stale_after_repeats: default_stale_after_repeats(),
            user_agent: default_user_agent(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExtractionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "ExtractionProfile::primary_default")]
    pub primary: ExtractionProfile,
    #[serde(default = "ExtractionProfile::fallback_default")]
    pub fallback: ExtractionProfile,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            primary: ExtractionProfile::primary_default(),
            fallback: ExtractionProfile::fallback_default(),
        }
    }
}

impl ExtractionConfig {
    pub fn profile(&self, mode: ExtractionMode) -> &ExtractionProfile {
        match mode {
            ExtractionMode::Primary => &self.primary,
            ExtractionMode::Fallback => &self.fallback,
        }
    }
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_legacy_path")]
    pub legacy_path: Option<String>,
    #[serde(default = "default_seed_path")]
    pub seed_path: Option<String>,
}

fn default_store_path() -> String {
    paths::DATASET_FILE.to_string()
}

fn default_legacy_path() -> Option<String> {
    Some(paths::LEGACY_DATASET_FILE.to_string())
}

fn default_seed_path() -> Option<String> {
    Some(paths::SEED_DATASET_FILE.to_string())
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            legacy_path: default_legacy_path(),
            seed_path: default_seed_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// ServingConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_min_limit")]
    pub min_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_min_valid_rows")]
    pub min_valid_rows: usize,
    #[serde(default = "default_stale_after_minutes")]
    pub stale_after_minutes: i64,
    #[serde(default = "default_display_min")]
    pub display_min: f64,
    #[serde(default = "default_display_max")]
    pub display_max: f64,
}

fn default_limit() -> usize {
    1000
}

fn default_min_limit() -> usize {
    1
}

fn default_max_limit() -> usize {
    20_000
}

fn default_min_valid_rows() -> usize {
    10
}

fn default_stale_after_minutes() -> i64 {
    120
}

fn default_display_min() -> f64 {
    0.1
}

fn default_display_max() -> f64 {
    100.0
}

impl ServingConfig {
    /// Age after which the newest point marks the series stale.
    pub fn stale_after(&self) -> chrono::Duration {
        minutes_saturating(self.stale_after_minutes)
    }
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            min_limit: default_min_limit(),
            max_limit: default_max_limit(),
            min_valid_rows: default_min_valid_rows(),
            stale_after_minutes: default_stale_after_minutes(),
            display_min: default_display_min(),
            display_max: default_display_max(),
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduleConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    /// Wall-clock budget for a run; exceeded runs fail before merging.
    #[serde(default = "default_run_budget_secs")]
    pub run_budget_secs: u64,
    #[serde(default = "default_true")]
    pub run_on_start: bool,
}

fn default_interval_minutes() -> u64 {
    30
}

fn default_run_budget_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            run_budget_secs: default_run_budget_secs(),
            run_on_start: true,
        }
    }
}

// ---------------------------------------------------------------------------
// AlertConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// The one system-wide threshold used when a subscriber sets none.
    #[serde(default = "default_threshold")]
    pub default_threshold: f64,
    #[serde(default = "default_hysteresis_margin")]
    pub hysteresis_margin: f64,
    #[serde(default = "default_debounce_minutes")]
    pub debounce_minutes: i64,
}

fn default_threshold() -> f64 {
    2.0
}

fn default_hysteresis_margin() -> f64 {
    0.2
}

fn default_debounce_minutes() -> i64 {
    120
}

impl AlertConfig {
    pub fn debounce(&self) -> chrono::Duration {
        minutes_saturating(self.debounce_minutes)
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_threshold: default_threshold(),
            hysteresis_margin: default_hysteresis_margin(),
            debounce_minutes: default_debounce_minutes(),
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifierConfig {
    /// Log messages instead of sending them.
    #[default]
    Log,
    /// POST `{channel_id, text}` JSON to `url`.
    Webhook { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_min_send_interval_ms")]
    pub min_send_interval_ms: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_min_send_interval_ms() -> u64 {
    50
}

fn default_send_timeout_secs() -> u64 {
    10
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            notifier: NotifierConfig::default(),
            retry: RetryPolicy::default(),
            min_send_interval_ms: default_min_send_interval_ms(),
            timeout_secs: default_send_timeout_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// RunsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    /// Newest run records kept in the pipeline database.
    #[serde(default = "default_retention")]
    pub retention: usize,
}

fn default_retention() -> usize {
    500
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub source: SourceConfig,
    /// Acquisition retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub serving: ServingConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub runs: RunsConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self::new("")
    }
}

impl Config {
    pub fn new(primary_url: impl Into<String>) -> Self {
        Self {
            version: 1,
            source: SourceConfig {
                primary_url: primary_url.into(),
                ..SourceConfig::default()
            },
            retry: RetryPolicy::default(),
            extraction: ExtractionConfig::default(),
            store: StoreConfig::default(),
            serving: ServingConfig::default(),
            schedule: ScheduleConfig::default(),
            alerts: AlertConfig::default(),
            dispatch: DispatchConfig::default(),
            runs: RunsConfig::default(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(TremorError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message })
        };

        if self.source.primary_url.trim().is_empty() {
            push(WarnLevel::Error, "source.primary_url is empty".into());
        }
        if matches!(&self.source.fallback_url, Some(u) if u.trim().is_empty()) {
            push(
                WarnLevel::Warning,
                "source.fallback_url is set but empty; fallback mode is disabled".into(),
            );
        }
        if self.source.stale_after_repeats == 0 {
            push(
                WarnLevel::Warning,
                "source.stale_after_repeats=0 disables staleness detection".into(),
            );
        }

        for mode in [ExtractionMode::Primary, ExtractionMode::Fallback] {
            let p = self.extraction.profile(mode);
            if p.plot.width() == 0 || p.plot.height() == 0 {
                push(
                    WarnLevel::Error,
                    format!("extraction.{mode}.plot has zero width or height"),
                );
            }
            if !p.calibration.is_well_formed() {
                push(
                    WarnLevel::Error,
                    format!(
                        "extraction.{mode}.calibration needs positive values and upper.row < lower.row"
                    ),
                );
            }
            if !(p.span_hours.is_finite() && p.span_hours > 0.0) {
                push(
                    WarnLevel::Error,
                    format!("extraction.{mode}.span_hours must be positive"),
                );
            }
        }

        let s = &self.serving;
        if s.min_limit == 0 || s.min_limit > s.max_limit {
            push(
                WarnLevel::Error,
                format!(
                    "serving limits out of order: min_limit={} max_limit={}",
                    s.min_limit, s.max_limit
                ),
            );
        }
        if s.default_limit < s.min_limit || s.default_limit > s.max_limit {
            push(
                WarnLevel::Warning,
                format!(
                    "serving.default_limit={} lies outside [{}, {}] and will be clamped",
                    s.default_limit, s.min_limit, s.max_limit
                ),
            );
        }
        if !(s.display_min > 0.0 && s.display_min < s.display_max) {
            push(
                WarnLevel::Error,
                "serving.display_min must be positive and below display_max".into(),
            );
        }

        for (field, minutes) in [
            ("serving.stale_after_minutes", s.stale_after_minutes),
            ("alerts.debounce_minutes", self.alerts.debounce_minutes),
        ] {
            if !(0..=MAX_MINUTES).contains(&minutes) {
                push(
                    WarnLevel::Error,
                    format!("{field}={minutes} must be within [0, {MAX_MINUTES}]"),
                );
            }
        }

        let a = &self.alerts;
        if a.hysteresis_margin < 0.0 || a.hysteresis_margin >= a.default_threshold {
            push(
                WarnLevel::Warning,
                format!(
                    "alerts.hysteresis_margin={} should be in [0, default_threshold={})",
                    a.hysteresis_margin, a.default_threshold
                ),
            );
        }
        if let NotifierConfig::Webhook { url } = &self.dispatch.notifier {
            if url.trim().is_empty() {
                push(WarnLevel::Error, "dispatch.notifier.url is empty".into());
            }
        }
        if self.retry.max_attempts > 10 || self.dispatch.retry.max_attempts > 10 {
            push(
                WarnLevel::Warning,
                "retry max_attempts >10 is unusual".into(),
            );
        }

        warnings
    }

    /// Errors from `validate()` joined into one failure.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TremorError::InvalidConfig(errors.join("; ")))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::PixelFilter;
    use tempfile::TempDir;

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::new("https://charts.example/tremor.png");
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.source.primary_url, "https://charts.example/tremor.png");
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.extraction.primary, ExtractionProfile::primary_default());
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let yaml = "version: 1\nsource:\n  primary_url: https://a/b.png\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.source.timeout_secs, 20);
        assert_eq!(cfg.source.stale_after_repeats, 3);
        assert_eq!(cfg.serving.min_valid_rows, 10);
        assert_eq!(cfg.alerts.default_threshold, 2.0);
        assert_eq!(cfg.dispatch.notifier, NotifierConfig::Log);
        assert!(cfg.source.fallback_url.is_none());
    }

    #[test]
    fn notifier_yaml_tagged() {
        let n = NotifierConfig::Webhook {
            url: "https://hooks.example/send".into(),
        };
        let yaml = serde_yaml::to_string(&n).unwrap();
        assert!(yaml.contains("type: webhook"));
        let parsed: NotifierConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, n);
    }

    #[test]
    fn pixel_filter_yaml_tagged() {
        let yaml = r#"
source:
  primary_url: https://a/b.png
extraction:
  fallback:
    plot: { left: 0, top: 0, right: 200, bottom: 100 }
    filter: { type: luma, min: 0, max: 40 }
    calibration:
      upper: { row: 0, value: 10 }
      lower: { row: 100, value: 0.01 }
    span_hours: 24
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let fb = cfg.extraction.profile(ExtractionMode::Fallback);
        assert_eq!(fb.filter, PixelFilter::Luma { min: 0, max: 40 });
        assert_eq!(fb.resolution_secs, 600);
        assert_eq!(
            cfg.extraction.profile(ExtractionMode::Primary),
            &ExtractionProfile::primary_default()
        );
    }

    #[test]
    fn load_missing_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(TremorError::NotInitialized)
        ));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::new("https://a/b.png");
        cfg.source.fallback_url = Some("https://a/alt.png".into());
        cfg.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.source.fallback_url.as_deref(), Some("https://a/alt.png"));
    }

    #[test]
    fn validate_valid_config_no_warnings() {
        let cfg = Config::new("https://a/b.png");
        assert!(cfg.validate().is_empty());
        assert!(cfg.ensure_valid().is_ok());
    }

    #[test]
    fn validate_empty_primary_url_is_error() {
        let cfg = Config::default();
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("primary_url")));
        assert!(matches!(cfg.ensure_valid(), Err(TremorError::InvalidConfig(_))));
    }

    #[test]
    fn validate_inverted_calibration() {
        let mut cfg = Config::new("https://a/b.png");
        let cal = &mut cfg.extraction.fallback.calibration;
        std::mem::swap(&mut cal.upper, &mut cal.lower);
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("extraction.fallback.calibration")));
    }

    #[test]
    fn validate_margin_not_below_threshold() {
        let mut cfg = Config::new("https://a/b.png");
        cfg.alerts.hysteresis_margin = 3.0;
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("hysteresis_margin")));
    }

    #[test]
    fn validate_limits_out_of_order() {
        let mut cfg = Config::new("https://a/b.png");
        cfg.serving.min_limit = 50;
        cfg.serving.max_limit = 10;
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("serving limits out of order")));
    }

    #[test]
    fn validate_out_of_range_minutes() {
        let mut cfg = Config::new("https://a/b.png");
        cfg.alerts.debounce_minutes = i64::MAX;
        cfg.serving.stale_after_minutes = -1;
        let errors: Vec<_> = cfg
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("serving.stale_after_minutes"));
        assert!(errors[1].message.contains("alerts.debounce_minutes"));
        assert!(cfg.ensure_valid().is_err());
    }

    #[test]
    fn minute_settings_saturate_instead_of_panicking() {
        let mut cfg = Config::new("https://a/b.png");
        cfg.alerts.debounce_minutes = i64::MAX;
        cfg.serving.stale_after_minutes = i64::MIN;
        assert_eq!(cfg.alerts.debounce(), chrono::Duration::MAX);
        assert_eq!(cfg.serving.stale_after(), chrono::Duration::zero());
        assert_eq!(AlertConfig::default().debounce(), chrono::Duration::minutes(120));
    }

    #[test]
    fn validate_empty_webhook_url() {
        let mut cfg = Config::new("https://a/b.png");
        cfg.dispatch.notifier = NotifierConfig::Webhook { url: " ".into() };
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("dispatch.notifier.url")));
    }
}
