use std::path::PathBuf;
use std::time::Duration;

use classify_core::DEFAULT_HISTORY_LIMIT;
use classify_stream::ReconnectPolicy;

use crate::arbiter::ArbiterConfig;

/// Tracker configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local classification service.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Base URL of the classification service (default: `http://localhost:8000`).
    pub api_base_url: String,
    /// Directory holding the persisted snapshots (default: `.classify-state`).
    pub state_dir: PathBuf,
    /// Maximum number of finished operations kept in history (default: `50`).
    pub history_limit: usize,
    /// Age past which a restored active operation counts as abandoned (default: 5 min).
    pub stale_after: Duration,
    /// Fallback completion delay after the trigger request succeeds (default: 2 s).
    pub grace_window: Duration,
    /// Hard completion deadline after the trigger request succeeds (default: 5 s).
    pub safety_timeout: Duration,
    /// Push-channel reconnect budget (default: 3 attempts, 2 s apart).
    pub reconnect: ReconnectPolicy,
    /// Ask the service for dual verification when triggering jobs (default: `false`).
    pub dual_verification: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".into(),
            state_dir: PathBuf::from(".classify-state"),
            history_limit: DEFAULT_HISTORY_LIMIT,
            stale_after: Duration::from_secs(5 * 60),
            grace_window: Duration::from_secs(2),
            safety_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            dual_verification: false,
        }
    }
}

impl TrackerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                 |
    /// |-------------------------------|-------------------------|
    /// | `CLASSIFY_API_URL`            | `http://localhost:8000` |
    /// | `CLASSIFY_STATE_DIR`          | `.classify-state`       |
    /// | `CLASSIFY_HISTORY_LIMIT`      | `50`                    |
    /// | `CLASSIFY_STALE_AFTER_SECS`   | `300`                   |
    /// | `CLASSIFY_GRACE_WINDOW_MS`    | `2000`                  |
    /// | `CLASSIFY_SAFETY_TIMEOUT_MS`  | `5000`                  |
    /// | `CLASSIFY_RECONNECT_ATTEMPTS` | `3`                     |
    /// | `CLASSIFY_RECONNECT_DELAY_MS` | `2000`                  |
    /// | `CLASSIFY_DUAL_VERIFICATION`  | `false`                 |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_base_url = lookup("CLASSIFY_API_URL").unwrap_or(defaults.api_base_url);
        let state_dir = lookup("CLASSIFY_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);

        let history_limit: usize =
            parse_var(&lookup, "CLASSIFY_HISTORY_LIMIT")?.unwrap_or(defaults.history_limit);
        if history_limit == 0 {
            return Err(ConfigError::Invalid {
                var: "CLASSIFY_HISTORY_LIMIT",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let stale_after = parse_var(&lookup, "CLASSIFY_STALE_AFTER_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.stale_after);
        let grace_window = parse_var(&lookup, "CLASSIFY_GRACE_WINDOW_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.grace_window);
        let safety_timeout = parse_var(&lookup, "CLASSIFY_SAFETY_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.safety_timeout);

        let reconnect = ReconnectPolicy {
            max_attempts: parse_var(&lookup, "CLASSIFY_RECONNECT_ATTEMPTS")?
                .unwrap_or(defaults.reconnect.max_attempts),
            delay: parse_var(&lookup, "CLASSIFY_RECONNECT_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect.delay),
        };

        let dual_verification =
            parse_var(&lookup, "CLASSIFY_DUAL_VERIFICATION")?.unwrap_or(defaults.dual_verification);

        Ok(Self {
            api_base_url,
            state_dir,
            history_limit,
            stale_after,
            grace_window,
            safety_timeout,
            reconnect,
            dual_verification,
        })
    }

    /// Timer settings for completion arbitration.
    pub fn arbiter(&self) -> ArbiterConfig {
        ArbiterConfig {
            grace_window: self.grace_window,
            safety_timeout: self.safety_timeout,
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

/// Errors raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = TrackerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.api_base_url, "http://localhost:8000");
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.stale_after, Duration::from_secs(300));
        assert_eq!(config.grace_window, Duration::from_secs(2));
        assert_eq!(config.safety_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert!(!config.dual_verification);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = TrackerConfig::from_lookup(lookup_from(&[
            ("CLASSIFY_API_URL", "http://classifier:9000"),
            ("CLASSIFY_STATE_DIR", "/var/lib/classify"),
            ("CLASSIFY_HISTORY_LIMIT", "10"),
            ("CLASSIFY_GRACE_WINDOW_MS", "500"),
            ("CLASSIFY_SAFETY_TIMEOUT_MS", " 1500 "),
            ("CLASSIFY_RECONNECT_ATTEMPTS", "5"),
            ("CLASSIFY_RECONNECT_DELAY_MS", "100"),
            ("CLASSIFY_DUAL_VERIFICATION", "true"),
        ]))
        .unwrap();

        assert_eq!(config.api_base_url, "http://classifier:9000");
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/classify"));
        assert_eq!(config.history_limit, 10);
        assert_eq!(config.grace_window, Duration::from_millis(500));
        assert_eq!(config.safety_timeout, Duration::from_millis(1500));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.delay, Duration::from_millis(100));
        assert!(config.dual_verification);
        assert_eq!(config.arbiter().grace_window, Duration::from_millis(500));
    }

    #[test]
    fn invalid_number_is_reported() {
        let result =
            TrackerConfig::from_lookup(lookup_from(&[("CLASSIFY_GRACE_WINDOW_MS", "soon")]));
        assert_matches!(
            result,
            Err(ConfigError::Invalid { var: "CLASSIFY_GRACE_WINDOW_MS", .. })
        );
    }

    #[test]
    fn zero_history_limit_is_rejected() {
        let result = TrackerConfig::from_lookup(lookup_from(&[("CLASSIFY_HISTORY_LIMIT", "0")]));
        assert_matches!(result, Err(ConfigError::Invalid { .. }));
    }
}
