//! Host configuration: `.kata/config.json`, then `KATA_*` environment
//! variables, then command-line flags.

use anyhow::{Context, Result};
use kata_core::engine::{Backoff, RetryPolicy};
use kata_core::EngineConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH: &str = ".kata/config.json";

/// Load the engine config from `path` if it exists, then apply env overrides
pub fn load(path: &Path) -> Result<EngineConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?
    } else {
        EngineConfig::default()
    };

    apply_env(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Environment overrides; `lookup` is injectable for tests
pub fn apply_env(config: &mut EngineConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(path) = lookup("KATA_DATABASE") {
        config.database_path = PathBuf::from(path);
    }
    if let Some(secs) = lookup("KATA_POLL_INTERVAL_SECS") {
        config.poll_interval_secs = secs
            .parse()
            .with_context(|| format!("KATA_POLL_INTERVAL_SECS is not a number: {}", secs))?;
    }
    if let Some(n) = lookup("KATA_MAX_CONCURRENT_DISPATCH") {
        config.max_concurrent_dispatch = n
            .parse()
            .with_context(|| format!("KATA_MAX_CONCURRENT_DISPATCH is not a number: {}", n))?;
    }
    if let Some(spec) = lookup("KATA_DEFAULT_RETRY") {
        config.default_retry = parse_retry(&spec)?;
    }
    Ok(())
}

/// `none` or `<attempts>:<fixed|linear|exponential>:<delay ms>`
pub fn parse_retry(spec: &str) -> Result<RetryPolicy> {
    if spec.trim() == "none" {
        return Ok(RetryPolicy::none());
    }

    let parts: Vec<&str> = spec.trim().split(':').collect();
    if parts.len() != 3 {
        anyhow::bail!("Expected 'none' or '<attempts>:<backoff>:<delay ms>', got '{}'", spec);
    }
    let attempts: u32 = parts[0]
        .parse()
        .with_context(|| format!("Invalid attempt count '{}'", parts[0]))?;
    let backoff = Backoff::parse(parts[1])
        .ok_or_else(|| anyhow::anyhow!("Unknown backoff '{}'", parts[1]))?;
    let delay_ms: u64 = parts[2]
        .parse()
        .with_context(|| format!("Invalid delay '{}'", parts[2]))?;

    Ok(RetryPolicy::new(attempts, backoff, Duration::from_millis(delay_ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("KATA_POLL_INTERVAL_SECS", "5"),
            ("KATA_DEFAULT_RETRY", "3:exponential:1000"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        apply_env(&mut config, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.max_concurrent_dispatch, 1);
        assert_eq!(config.default_retry.max_attempts, 3);
        assert_eq!(config.default_retry.backoff, Backoff::Exponential);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = EngineConfig::default();
        let err = apply_env(&mut config, |k| {
            (k == "KATA_MAX_CONCURRENT_DISPATCH").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("KATA_MAX_CONCURRENT_DISPATCH"));
    }

    #[test]
    fn test_parse_retry() {
        assert_eq!(parse_retry("none").unwrap(), RetryPolicy::none());
        assert!(parse_retry("3:sometimes:10").is_err());
        assert!(parse_retry("3").is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = load(Path::new("/nonexistent/kata/config.json")).unwrap();
        assert_eq!(config.database_path, EngineConfig::default().database_path);
    }
}
