//! Session configuration: config file loading and CLI override merging.
//!
//! The file is a flat list of `key = value` lines:
//!
//! ```text
//! max_retries = 5
//! retry_initial_delay_ms = 500
//! retryable_markers = "QuotaBurst,NodeBusy" # on top of the built-in provider codes
//! bandwidth_limit_mbps = 50
//! adaptive_bandwidth = false
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::transfer::{AdaptiveBandwidthLimiter, Governor, RetryPolicy, Retryer};

/// Bytes per configured megabyte.
pub const BYTES_PER_MB: u64 = 1024 * 1024;

const CONFIG_DIR_NAME: &str = "export-transfer";

/// File-backed configuration; every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    pub max_retries: Option<u32>,
    pub retry_initial_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub retry_multiplier: Option<f64>,
    pub retry_jitter: Option<bool>,
    /// Extra error-message fragments treated as retryable.
    pub retryable_markers: Option<Vec<String>>,
    /// Fixed ceiling in MB/s; 0 means unlimited.
    pub bandwidth_limit_mbps: Option<u64>,
    pub bandwidth_burst_mb: Option<u64>,
    pub adaptive_bandwidth: Option<bool>,
    pub adaptive_min_mbps: Option<u64>,
    pub adaptive_max_mbps: Option<u64>,
}

impl FileConfig {
    /// Validates values against the ranges the CLI accepts.
    pub fn validate(&self) -> Result<()> {
        if let Some(max_retries) = self.max_retries
            && !(1..=100).contains(&max_retries)
        {
            bail!("Invalid config value for `max_retries`: {max_retries}. Expected range: 1..=100");
        }
        validate_delay_ms("retry_initial_delay_ms", self.retry_initial_delay_ms)?;
        validate_delay_ms("retry_max_delay_ms", self.retry_max_delay_ms)?;
        if let (Some(initial), Some(max)) = (self.retry_initial_delay_ms, self.retry_max_delay_ms)
            && max < initial
        {
            bail!(
                "Invalid config value for `retry_max_delay_ms`: {max}. Must be >= retry_initial_delay_ms ({initial})"
            );
        }
        if let Some(multiplier) = self.retry_multiplier
            && !(1.0..=10.0).contains(&multiplier)
        {
            bail!("Invalid config value for `retry_multiplier`: {multiplier}. Expected range: 1.0..=10.0");
        }
        if let (Some(min), Some(max)) = (self.adaptive_min_mbps, self.adaptive_max_mbps)
            && min > max
        {
            bail!(
                "Invalid config value for `adaptive_min_mbps`: {min}. Must be <= adaptive_max_mbps ({max})"
            );
        }
        Ok(())
    }
}

fn validate_delay_ms(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3_600_000).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600000");
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
    pub loaded_from_file: bool,
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/export-transfer/config.toml`
/// 2. `$HOME/.config/export-transfer/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join(CONFIG_DIR_NAME).join("config.toml"));
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR_NAME)
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from the default path if present.
pub fn load_default_file_config() -> Result<LoadedConfig> {
    let path = resolve_default_config_path();
    let Some(path_ref) = path.as_deref() else {
        return Ok(LoadedConfig {
            path,
            config: None,
            loaded_from_file: false,
        });
    };

    if !path_ref.exists() {
        return Ok(LoadedConfig {
            path,
            config: None,
            loaded_from_file: false,
        });
    }

    let config = load_file_config(path_ref)?;
    Ok(LoadedConfig {
        path,
        config: Some(config),
        loaded_from_file: true,
    })
}

/// Loads and validates a config file at an explicit path.
pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw).with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

/// Parses config text.
pub fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!(
                "Invalid config syntax on line {}: expected key = value",
                line_index + 1
            );
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let line_no = line_index + 1;

        match key {
            "max_retries" => {
                let parsed = parse_integer_u64(value)
                    .with_context(|| format!("Invalid `max_retries` value on line {line_no}"))?;
                let n = u32::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("max_retries out of range for u32"))?;
                cfg.max_retries = Some(n);
            }
            "retry_initial_delay_ms" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `retry_initial_delay_ms` value on line {line_no}")
                })?;
                cfg.retry_initial_delay_ms = Some(parsed);
            }
            "retry_max_delay_ms" => {
                let parsed = parse_integer_u64(value)
                    .with_context(|| format!("Invalid `retry_max_delay_ms` value on line {line_no}"))?;
                cfg.retry_max_delay_ms = Some(parsed);
            }
            "retry_multiplier" => {
                let parsed = parse_float(value)
                    .with_context(|| format!("Invalid `retry_multiplier` value on line {line_no}"))?;
                cfg.retry_multiplier = Some(parsed);
            }
            "retry_jitter" => {
                let parsed = parse_boolean(value)
                    .with_context(|| format!("Invalid `retry_jitter` value on line {line_no}"))?;
                cfg.retry_jitter = Some(parsed);
            }
            "retryable_markers" => {
                let parsed = parse_string_literal(value)
                    .with_context(|| format!("Invalid `retryable_markers` value on line {line_no}"))?;
                cfg.retryable_markers = Some(
                    parsed
                        .split(',')
                        .map(str::trim)
                        .filter(|marker| !marker.is_empty())
                        .map(ToString::to_string)
                        .collect(),
                );
            }
            "bandwidth_limit_mbps" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `bandwidth_limit_mbps` value on line {line_no}")
                })?;
                cfg.bandwidth_limit_mbps = Some(parsed);
            }
            "bandwidth_burst_mb" => {
                let parsed = parse_integer_u64(value)
                    .with_context(|| format!("Invalid `bandwidth_burst_mb` value on line {line_no}"))?;
                cfg.bandwidth_burst_mb = Some(parsed);
            }
            "adaptive_bandwidth" => {
                let parsed = parse_boolean(value)
                    .with_context(|| format!("Invalid `adaptive_bandwidth` value on line {line_no}"))?;
                cfg.adaptive_bandwidth = Some(parsed);
            }
            "adaptive_min_mbps" => {
                let parsed = parse_integer_u64(value)
                    .with_context(|| format!("Invalid `adaptive_min_mbps` value on line {line_no}"))?;
                cfg.adaptive_min_mbps = Some(parsed);
            }
            "adaptive_max_mbps" => {
                let parsed = parse_integer_u64(value)
                    .with_context(|| format!("Invalid `adaptive_max_mbps` value on line {line_no}"))?;
                cfg.adaptive_max_mbps = Some(parsed);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_float(raw_value: &str) -> Result<f64> {
    let value = raw_value.trim().parse::<f64>()?;
    if !value.is_finite() {
        bail!("Expected a finite number");
    }
    Ok(value)
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

/// Values given on the command line; `None` leaves the file or default value.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub max_retries: Option<u32>,
    pub retry_initial_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub no_jitter: bool,
    pub bandwidth_limit_mbps: Option<u64>,
    pub bandwidth_burst_mb: Option<u64>,
    pub adaptive_bandwidth: bool,
}

/// Fully resolved retry and bandwidth settings for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSettings {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    pub retryable_markers: Vec<String>,
    /// Bytes per second; 0 means unlimited.
    pub bandwidth_limit: u64,
    pub bandwidth_burst: Option<u64>,
    pub adaptive: bool,
    pub adaptive_min: u64,
    pub adaptive_max: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts(),
            initial_delay: policy.initial_delay(),
            max_delay: policy.max_delay(),
            multiplier: policy.multiplier(),
            jitter: policy.jitter(),
            retryable_markers: Vec::new(),
            bandwidth_limit: 0,
            bandwidth_burst: None,
            adaptive: false,
            adaptive_min: 0,
            adaptive_max: 0,
        }
    }
}

impl TransferSettings {
    /// Layers defaults, then the file config, then CLI overrides.
    #[must_use]
    pub fn resolve(file: Option<&FileConfig>, cli: &SettingsOverrides) -> Self {
        let mut settings = Self::default();

        if let Some(file) = file {
            if let Some(n) = file.max_retries {
                settings.max_attempts = n;
            }
            if let Some(ms) = file.retry_initial_delay_ms {
                settings.initial_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = file.retry_max_delay_ms {
                settings.max_delay = Duration::from_millis(ms);
            }
            if let Some(multiplier) = file.retry_multiplier {
                settings.multiplier = multiplier;
            }
            if let Some(jitter) = file.retry_jitter {
                settings.jitter = jitter;
            }
            if let Some(markers) = &file.retryable_markers {
                settings.retryable_markers.extend(markers.iter().cloned());
            }
            if let Some(mbps) = file.bandwidth_limit_mbps {
                settings.bandwidth_limit = mbps.saturating_mul(BYTES_PER_MB);
            }
            if let Some(mb) = file.bandwidth_burst_mb {
                settings.bandwidth_burst = Some(mb.saturating_mul(BYTES_PER_MB));
            }
            if let Some(adaptive) = file.adaptive_bandwidth {
                settings.adaptive = adaptive;
            }
            if let Some(mbps) = file.adaptive_min_mbps {
                settings.adaptive_min = mbps.saturating_mul(BYTES_PER_MB);
            }
            if let Some(mbps) = file.adaptive_max_mbps {
                settings.adaptive_max = mbps.saturating_mul(BYTES_PER_MB);
            }
        }

        if let Some(n) = cli.max_retries {
            settings.max_attempts = n;
        }
        if let Some(ms) = cli.retry_initial_delay_ms {
            settings.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = cli.retry_max_delay_ms {
            settings.max_delay = Duration::from_millis(ms);
        }
        if cli.no_jitter {
            settings.jitter = false;
        }
        if let Some(mbps) = cli.bandwidth_limit_mbps {
            settings.bandwidth_limit = mbps.saturating_mul(BYTES_PER_MB);
        }
        if let Some(mb) = cli.bandwidth_burst_mb {
            settings.bandwidth_burst = Some(mb.saturating_mul(BYTES_PER_MB));
        }
        if cli.adaptive_bandwidth {
            settings.adaptive = true;
        }
        settings
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.initial_delay,
            self.max_delay,
            self.multiplier,
        )
        .with_jitter(self.jitter)
        .with_retryable_markers(self.retryable_markers.iter().cloned())
    }

    #[must_use]
    pub fn retryer(&self) -> Arc<Retryer> {
        Arc::new(Retryer::new(self.retry_policy()))
    }

    /// Builds the session governor.
    ///
    /// Adaptive mode uses the configured bounds (a fixed limit, when set,
    /// becomes the upper bound); otherwise a fixed limit or none.
    #[must_use]
    pub fn governor(&self) -> Governor {
        if self.adaptive {
            let max = if self.adaptive_max > 0 {
                self.adaptive_max
            } else {
                self.bandwidth_limit
            };
            return Governor::adaptive(AdaptiveBandwidthLimiter::new(self.adaptive_min, max));
        }
        Governor::fixed(self.bandwidth_limit, self.bandwidth_burst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transfer::{FailureType, classify_message};

    // ==================== Parsing Tests ====================

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str(
            r"
max_retries = 5
retry_jitter = false
",
        )
        .unwrap();
        assert_eq!(cfg.max_retries, Some(5));
        assert_eq!(cfg.retry_jitter, Some(false));
        assert!(cfg.bandwidth_limit_mbps.is_none());
    }

    #[test]
    fn test_parse_config_supports_inline_comments() {
        let cfg = parse_config_str(
            r#"
bandwidth_limit_mbps = 40 # office uplink
retryable_markers = "SlowDown, ServerBusy,#weird" # provider words
"#,
        )
        .unwrap();
        assert_eq!(cfg.bandwidth_limit_mbps, Some(40));
        assert_eq!(
            cfg.retryable_markers,
            Some(vec![
                "SlowDown".to_string(),
                "ServerBusy".to_string(),
                "#weird".to_string()
            ])
        );
    }

    #[test]
    fn test_parse_config_all_fields() {
        let cfg = parse_config_str(
            r"
max_retries = 7
retry_initial_delay_ms = 250
retry_max_delay_ms = 10000
retry_multiplier = 1.5
retry_jitter = true
bandwidth_limit_mbps = 100
bandwidth_burst_mb = 20
adaptive_bandwidth = true
adaptive_min_mbps = 5
adaptive_max_mbps = 80
",
        )
        .unwrap();
        assert_eq!(cfg.retry_initial_delay_ms, Some(250));
        assert_eq!(cfg.retry_max_delay_ms, Some(10_000));
        assert_eq!(cfg.retry_multiplier, Some(1.5));
        assert_eq!(cfg.bandwidth_burst_mb, Some(20));
        assert_eq!(cfg.adaptive_bandwidth, Some(true));
        assert_eq!(cfg.adaptive_min_mbps, Some(5));
        assert_eq!(cfg.adaptive_max_mbps, Some(80));
    }

    #[test]
    fn test_parse_config_rejects_invalid_max_retries() {
        let err = parse_config_str("max_retries = 0").unwrap_err();
        assert!(err.to_string().contains("max_retries"));
    }

    #[test]
    fn test_parse_config_rejects_max_delay_below_initial() {
        let err = parse_config_str("retry_initial_delay_ms = 5000\nretry_max_delay_ms = 100").unwrap_err();
        assert!(err.to_string().contains("retry_max_delay_ms"));
    }

    #[test]
    fn test_parse_config_rejects_multiplier_below_one() {
        let err = parse_config_str("retry_multiplier = 0.5").unwrap_err();
        assert!(err.to_string().contains("retry_multiplier"));
    }

    #[test]
    fn test_parse_config_rejects_inverted_adaptive_bounds() {
        let err = parse_config_str("adaptive_min_mbps = 50\nadaptive_max_mbps = 10").unwrap_err();
        assert!(err.to_string().contains("adaptive_min_mbps"));
    }

    #[test]
    fn test_parse_config_rejects_trailing_tokens() {
        let err = parse_config_str("max_retries = 4 trailing").unwrap_err();
        assert!(format!("{err:#}").contains("max_retries"));
    }

    #[test]
    fn test_parse_config_rejects_unquoted_markers() {
        let err = parse_config_str("retryable_markers = SlowDown").unwrap_err();
        assert!(err.to_string().contains("retryable_markers"));
    }

    #[test]
    fn test_parse_config_rejects_unknown_keys() {
        let err = parse_config_str("unknown_key = 123").unwrap_err();
        assert!(err.to_string().contains("Unknown configuration key"));
        assert!(err.to_string().contains("unknown_key"));
    }

    #[test]
    fn test_parse_config_rejects_missing_equals() {
        let err = parse_config_str("max_retries 3").unwrap_err();
        assert!(err.to_string().contains("expected key = value"));
    }

    #[test]
    fn test_load_file_config_reports_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_retries = 2\n").unwrap();
        assert_eq!(load_file_config(&path).unwrap().max_retries, Some(2));

        let missing = dir.path().join("nope.toml");
        let err = load_file_config(&missing).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }

    // ==================== Resolution Tests ====================

    #[test]
    fn test_resolve_defaults() {
        let settings = TransferSettings::resolve(None, &SettingsOverrides::default());
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.initial_delay, Duration::from_secs(1));
        assert_eq!(settings.max_delay, Duration::from_secs(30));
        assert!(settings.jitter);
        assert_eq!(settings.bandwidth_limit, 0);
        assert!(matches!(settings.governor(), Governor::Unlimited));
        assert!(settings.retryable_markers.is_empty());
    }

    #[test]
    fn test_resolve_cli_overrides_file() {
        let file = FileConfig {
            max_retries: Some(8),
            bandwidth_limit_mbps: Some(10),
            retry_jitter: Some(true),
            ..FileConfig::default()
        };
        let cli = SettingsOverrides {
            max_retries: Some(2),
            no_jitter: true,
            ..SettingsOverrides::default()
        };

        let settings = TransferSettings::resolve(Some(&file), &cli);

        assert_eq!(settings.max_attempts, 2);
        assert!(!settings.jitter);
        assert_eq!(settings.bandwidth_limit, 10 * BYTES_PER_MB);
        assert_eq!(settings.governor().current_limit(), 10 * BYTES_PER_MB);
    }

    #[test]
    fn test_resolve_adaptive_uses_limit_as_ceiling() {
        let cli = SettingsOverrides {
            bandwidth_limit_mbps: Some(20),
            adaptive_bandwidth: true,
            ..SettingsOverrides::default()
        };
        let settings = TransferSettings::resolve(None, &cli);
        let Governor::Adaptive(adaptive) = settings.governor() else {
            panic!("expected adaptive governor");
        };
        assert_eq!(adaptive.max_speed(), 20 * BYTES_PER_MB);
    }

    #[test]
    fn test_retry_policy_carries_markers() {
        let file = FileConfig {
            retryable_markers: Some(vec!["QuotaBusy".to_string()]),
            ..FileConfig::default()
        };
        let policy = TransferSettings::resolve(Some(&file), &SettingsOverrides::default()).retry_policy();
        assert_eq!(policy.retryable_markers(), ["QuotaBusy".to_string()]);
    }

    #[test]
    fn test_custom_markers_keep_provider_throttling_retryable() {
        let file = FileConfig {
            retryable_markers: Some(vec!["QuotaBurst".to_string()]),
            ..FileConfig::default()
        };
        let policy = TransferSettings::resolve(Some(&file), &SettingsOverrides::default()).retry_policy();
        let classify = |message: &str| classify_message(message, policy.retryable_markers());

        assert_eq!(classify("ThrottlingException: Rate exceeded"), FailureType::Transient);
        assert_eq!(classify("QuotaBurst hit"), FailureType::Transient);
        assert_eq!(classify("checksum mismatch"), FailureType::Permanent);
    }
}
