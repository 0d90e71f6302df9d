use anyhow::{Context, Result};
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 8;
const DEFAULT_RECONNECT_BASE_MS: u64 = 500;
const DEFAULT_PROPOSAL_TTL_HOURS: i64 = 48;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the conversation service, e.g. `https://ecoswap.app/api`.
    pub api_base_url: String,
    /// Websocket endpoint of the realtime service.
    pub realtime_url: Option<String>,
    /// Public project key sent alongside the bearer token.
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub proposal_ttl: chrono::Duration,
    /// Gap-fill: re-ingest full history after a reconnect.
    pub refetch_on_reconnect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000/api".to_string(),
            realtime_url: None,
            api_key: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            proposal_ttl: chrono::Duration::hours(DEFAULT_PROPOSAL_TTL_HOURS),
            refetch_on_reconnect: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_base_url = get("ECOSWAP_API_URL")
            .context("ECOSWAP_API_URL must be set (for example in .env)")?
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            api_base_url,
            realtime_url: get("ECOSWAP_REALTIME_URL"),
            api_key: get("ECOSWAP_API_KEY"),
            request_timeout: Duration::from_secs(parse_or(
                get("ECOSWAP_REQUEST_TIMEOUT_SECS"),
                "ECOSWAP_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
            reconnect_max_attempts: parse_or(
                get("ECOSWAP_RECONNECT_MAX_ATTEMPTS"),
                "ECOSWAP_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect_max_attempts,
            )?,
            reconnect_base_delay: Duration::from_millis(parse_or(
                get("ECOSWAP_RECONNECT_BASE_MS"),
                "ECOSWAP_RECONNECT_BASE_MS",
                DEFAULT_RECONNECT_BASE_MS,
            )?),
            proposal_ttl: chrono::Duration::hours(parse_or(
                get("ECOSWAP_PROPOSAL_TTL_HOURS"),
                "ECOSWAP_PROPOSAL_TTL_HOURS",
                DEFAULT_PROPOSAL_TTL_HOURS,
            )?),
            refetch_on_reconnect: parse_or(
                get("ECOSWAP_REFETCH_ON_RECONNECT"),
                "ECOSWAP_REFETCH_ON_RECONNECT",
                false,
            )?,
        })
    }

    /// Delay before reconnect attempt `attempt` (1-based), doubling up to 30s.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(6);
        (self.reconnect_base_delay * factor).min(Duration::from_secs(30))
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> Result<T> {
    match value {
        None => Ok(default),
        Some(raw) => match raw.parse() {
            Ok(value) => Ok(value),
            Err(_) => anyhow::bail!("{} has an invalid value: {}", key, raw),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn api_url_is_required() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
        assert!(Config::from_lookup(lookup(&[("ECOSWAP_API_URL", "  ")])).is_err());
    }

    #[test]
    fn defaults_apply_and_trailing_slash_is_trimmed() {
        let env = [("ECOSWAP_API_URL", "https://ecoswap.test/api/")];
        let config = Config::from_lookup(lookup(&env)).unwrap();
        assert_eq!(config.api_base_url, "https://ecoswap.test/api");
        assert_eq!(config.request_timeout, Duration::from_secs(20));
        assert_eq!(config.proposal_ttl, chrono::Duration::hours(48));
        assert!(!config.refetch_on_reconnect);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("ECOSWAP_API_URL", "https://ecoswap.test/api"),
            ("ECOSWAP_REQUEST_TIMEOUT_SECS", "15"),
            ("ECOSWAP_REFETCH_ON_RECONNECT", "true"),
            ("ECOSWAP_REALTIME_URL", "wss://rt.ecoswap.test/socket"),
        ]))
        .unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert!(config.refetch_on_reconnect);
        assert_eq!(config.realtime_url.as_deref(), Some("wss://rt.ecoswap.test/socket"));

        assert!(Config::from_lookup(lookup(&[
            ("ECOSWAP_API_URL", "https://ecoswap.test/api"),
            ("ECOSWAP_REQUEST_TIMEOUT_SECS", "soon"),
        ]))
        .is_err());
    }

    #[test]
    fn reconnect_delay_backs_off_and_caps() {
        let config = Config::default();
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(500));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(1000));
        assert_eq!(config.reconnect_delay(20), Duration::from_secs(30));
    }
}
