//! Application configuration loading for CLI defaults.
//!
//! Settings are layered: built-in defaults, then the config file, then CLI
//! flags.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chapterdl_core::{CoordinatorConfig, DuplicatePolicy, RateLimiterConfig};

use crate::cli::Args;

/// File configuration for chapterdl defaults.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    /// Default output directory.
    pub output_dir: Option<PathBuf>,
    /// Chapters downloaded at once.
    pub jobs: Option<u8>,
    /// Page fetches per chapter.
    pub page_workers: Option<u8>,
    /// Page fetches across all chapters.
    pub global_workers: Option<u8>,
    /// Attempts per request.
    pub max_attempts: Option<u8>,
    /// Requests per second (0 disables).
    pub rate_limit: Option<u32>,
    /// Burst size of the rate limiter.
    pub burst: Option<u32>,
    /// Whole-request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Consecutive failures before a host's circuit opens.
    pub failure_threshold: Option<u32>,
    /// Seconds an open circuit waits before a probe.
    pub cool_down_secs: Option<u64>,
    /// Build CBZ archives.
    pub convert: Option<bool>,
    /// Accept a URL that is already queued.
    pub allow_duplicates: Option<bool>,
}

impl FileConfig {
    /// Validates config values against the CLI constraints.
    pub fn validate(&self) -> Result<()> {
        validate_range("jobs", self.jobs.map(u64::from), 1, 10)?;
        validate_range("page_workers", self.page_workers.map(u64::from), 1, 32)?;
        validate_range("global_workers", self.global_workers.map(u64::from), 1, 128)?;
        validate_range("max_attempts", self.max_attempts.map(u64::from), 1, 10)?;
        validate_range("rate_limit", self.rate_limit.map(u64::from), 0, 1000)?;
        validate_range("burst", self.burst.map(u64::from), 1, 1000)?;
        validate_range("timeout_secs", self.timeout_secs, 1, 3600)?;
        validate_range(
            "failure_threshold",
            self.failure_threshold.map(u64::from),
            1,
            100,
        )?;
        validate_range("cool_down_secs", self.cool_down_secs, 1, 3600)?;
        Ok(())
    }
}

fn validate_range(field: &str, value: Option<u64>, min: u64, max: u64) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(min..=max).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
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
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/chapterdl/config.toml`
/// 2. `$HOME/.config/chapterdl/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("chapterdl")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("chapterdl")
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
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(load_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
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
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "output_dir" => {
                cfg.output_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(context)?,
                ));
            }
            "jobs" => cfg.jobs = Some(parse_integer_u8(value).with_context(context)?),
            "page_workers" => {
                cfg.page_workers = Some(parse_integer_u8(value).with_context(context)?);
            }
            "global_workers" => {
                cfg.global_workers = Some(parse_integer_u8(value).with_context(context)?);
            }
            "max_attempts" => {
                cfg.max_attempts = Some(parse_integer_u8(value).with_context(context)?);
            }
            "rate_limit" => cfg.rate_limit = Some(parse_integer_u32(value).with_context(context)?),
            "burst" => cfg.burst = Some(parse_integer_u32(value).with_context(context)?),
            "timeout_secs" => {
                cfg.timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "failure_threshold" => {
                cfg.failure_threshold = Some(parse_integer_u32(value).with_context(context)?);
            }
            "cool_down_secs" => {
                cfg.cool_down_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "convert" => cfg.convert = Some(parse_boolean(value).with_context(context)?),
            "allow_duplicates" => {
                cfg.allow_duplicates = Some(parse_boolean(value).with_context(context)?);
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

fn parse_integer_u32(raw_value: &str) -> Result<u32> {
    let value = parse_integer_u64(raw_value)?;
    u32::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u32"))
}

fn parse_integer_u8(raw_value: &str) -> Result<u8> {
    let value = parse_integer_u64(raw_value)?;
    u8::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u8"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

/// Settings the binary needs beyond the coordinator config.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Coordinator settings.
    pub coordinator: CoordinatorConfig,
    /// Whether the CBZ converter stays enabled.
    pub convert: bool,
}

/// Merges defaults, the config file and CLI flags, in increasing priority.
pub fn resolve_run_settings(args: &Args, file: Option<&FileConfig>) -> Result<RunSettings> {
    let file = file.cloned().unwrap_or_default();
    let mut config = CoordinatorConfig::default();

    if let Some(dir) = args.output_dir.clone().or(file.output_dir) {
        config.output_root = dir;
    }
    if let Some(jobs) = args.jobs.or(file.jobs) {
        config.job_workers = usize::from(jobs);
    }
    if let Some(page_workers) = args.page_workers.or(file.page_workers) {
        config.page_workers_per_job = usize::from(page_workers);
    }
    if let Some(global) = args.global_workers.or(file.global_workers) {
        config.global_page_workers = usize::from(global);
    }
    // The global bound can never be smaller than one job's bound.
    config.global_page_workers = config.global_page_workers.max(config.page_workers_per_job);

    if let Some(attempts) = args.max_attempts.or(file.max_attempts) {
        config.retry.max_attempts = u32::from(attempts);
    }
    if let Some(secs) = args.timeout.or(file.timeout_secs) {
        config.request_timeout = Duration::from_secs(secs);
    }

    let burst = args.burst.or(file.burst);
    match args.rate_limit.or(file.rate_limit) {
        Some(0) => config.rate_limit = None,
        Some(rate) => {
            config.rate_limit = Some(RateLimiterConfig {
                capacity: burst.unwrap_or(rate),
                refill_per_sec: f64::from(rate),
            });
        }
        None => {
            if let (Some(burst), Some(limit)) = (burst, config.rate_limit.as_mut()) {
                limit.capacity = burst;
            }
        }
    }

    if let Some(threshold) = file.failure_threshold {
        config.circuit_breaker.failure_threshold = threshold;
    }
    if let Some(secs) = file.cool_down_secs {
        config.circuit_breaker.cool_down = Duration::from_secs(secs);
    }

    if args.allow_duplicates || file.allow_duplicates.unwrap_or(false) {
        config.duplicate_policy = DuplicatePolicy::Allow;
    }
    let convert = !args.no_convert && file.convert.unwrap_or(true);

    config
        .validate()
        .context("Invalid settings after merging config file and CLI flags")?;
    Ok(RunSettings {
        coordinator: config,
        convert,
    })
}
