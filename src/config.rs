use std::path::Path;

use serde::Deserialize;

use crate::log_warn;

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub dispatch: DispatchConfig,
    pub outbox: OutboxConfig,
    pub storage: StorageConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Global ceiling on concurrently running work items.
    pub max_parallel_jobs: u32,
    /// Bounded worker sleep between dispatch attempts.
    pub worker_poll_seconds: f64,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct OutboxConfig {
    pub backoff_base_seconds: f64,
    pub backoff_max_seconds: f64,
    /// Eviction ceiling for persisted entries, oldest-first.
    pub max_items: usize,
    /// Upper bound on operations attempted per flush.
    pub flush_max_ops: usize,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the spool, drain files, outbox document,
    /// and the instance lock.
    pub data_dir: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 5,
            worker_poll_seconds: 0.5,
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            backoff_base_seconds: 2.0,
            backoff_max_seconds: 300.0,
            max_items: 500,
            flush_max_ops: 20,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: ".scope-relay".to_string(),
        }
    }
}

pub fn validate(config: &RelayConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.dispatch.max_parallel_jobs < 1 {
        errors.push("dispatch.max_parallel_jobs must be >= 1".to_string());
    }

    if config.dispatch.worker_poll_seconds <= 0.0 {
        errors.push("dispatch.worker_poll_seconds must be > 0".to_string());
    }

    if config.outbox.backoff_base_seconds <= 0.0 {
        errors.push("outbox.backoff_base_seconds must be > 0".to_string());
    }

    if config.outbox.backoff_max_seconds < config.outbox.backoff_base_seconds {
        errors.push("outbox.backoff_max_seconds must be >= outbox.backoff_base_seconds".to_string());
    }

    if config.outbox.max_items < 1 {
        errors.push("outbox.max_items must be >= 1".to_string());
    }

    if config.outbox.flush_max_ops < 1 {
        errors.push("outbox.flush_max_ops must be >= 1".to_string());
    }

    if config.storage.data_dir.trim().is_empty() {
        errors.push("storage.data_dir must not be empty".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load configuration from `{root}/scope-relay.toml`, apply environment
/// overrides, and validate.
///
/// A missing file yields the defaults (still subject to overrides and
/// validation). Unknown keys are ignored for forward compatibility.
pub fn load_config(root: &Path) -> Result<RelayConfig, String> {
    let config_path = root.join("scope-relay.toml");

    let mut config = if config_path.exists() {
        let contents = std::fs::read_to_string(&config_path)
            .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;
        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse {}: {}", config_path.display(), e))?
    } else {
        RelayConfig::default()
    };

    apply_env_overrides(&mut config);

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

/// Environment overrides for deployments without a config file.
/// Unparsable values are ignored with a warning.
fn apply_env_overrides(config: &mut RelayConfig) {
    if let Some(n) = env_parse::<u32>("SCOPE_RELAY_MAX_PARALLEL_JOBS") {
        config.dispatch.max_parallel_jobs = n;
    }
    if let Some(v) = env_parse::<f64>("SCOPE_RELAY_BACKOFF_BASE_SECONDS") {
        config.outbox.backoff_base_seconds = v;
    }
    if let Some(v) = env_parse::<f64>("SCOPE_RELAY_BACKOFF_MAX_SECONDS") {
        config.outbox.backoff_max_seconds = v;
    }
    if let Some(n) = env_parse::<usize>("SCOPE_RELAY_MAX_OUTBOX_ITEMS") {
        config.outbox.max_items = n;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            log_warn!("Ignoring unparsable {}={}", name, raw);
            None
        }
    }
}
