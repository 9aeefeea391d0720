//! Server settings read once from `DONORSLOT_*` environment variables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::booking::ReservePolicy;
use crate::limits::{MAX_BACKOFF_MS, MAX_RESERVE_ATTEMPTS};
use crate::store::IsolationLevel;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{var}: {reason}")]
    OutOfRange { var: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// Per-user passwords for clinic staff, from `user:password` pairs.
    pub staff: HashMap<String, String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub policy: ReservePolicy,
    pub reserve_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "donorslot".into(),
            staff: HashMap::new(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            policy: ReservePolicy::default(),
            reserve_timeout: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; tests pass a map instead of touching
    /// the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let backoff_min = parse_or(
            &get,
            "DONORSLOT_BACKOFF_MIN_MS",
            millis(defaults.policy.backoff_min),
        )?;
        let backoff_max = parse_or(
            &get,
            "DONORSLOT_BACKOFF_MAX_MS",
            millis(defaults.policy.backoff_max),
        )?;
        if backoff_min > backoff_max {
            return Err(ConfigError::OutOfRange {
                var: "DONORSLOT_BACKOFF_MIN_MS",
                reason: format!("{backoff_min} exceeds DONORSLOT_BACKOFF_MAX_MS {backoff_max}"),
            });
        }
        if backoff_max > MAX_BACKOFF_MS {
            return Err(ConfigError::OutOfRange {
                var: "DONORSLOT_BACKOFF_MAX_MS",
                reason: format!("{backoff_max} exceeds {MAX_BACKOFF_MS}"),
            });
        }

        let max_attempts: u32 =
            parse_or(&get, "DONORSLOT_MAX_ATTEMPTS", defaults.policy.max_attempts)?;
        if !(1..=MAX_RESERVE_ATTEMPTS).contains(&max_attempts) {
            return Err(ConfigError::OutOfRange {
                var: "DONORSLOT_MAX_ATTEMPTS",
                reason: format!("{max_attempts} not in 1..={MAX_RESERVE_ATTEMPTS}"),
            });
        }

        let policy = ReservePolicy {
            max_attempts,
            backoff_min: Duration::from_millis(backoff_min),
            backoff_max: Duration::from_millis(backoff_max),
            isolation: parse_or::<IsolationLevel>(
                &get,
                "DONORSLOT_ISOLATION",
                defaults.policy.isolation,
            )?,
        };

        Ok(Self {
            port: parse_or(&get, "DONORSLOT_PORT", defaults.port)?,
            bind: get("DONORSLOT_BIND").unwrap_or(defaults.bind),
            data_dir: get("DONORSLOT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: get("DONORSLOT_PASSWORD").unwrap_or(defaults.password),
            staff: match get("DONORSLOT_STAFF") {
                Some(value) => parse_staff(&value)?,
                None => defaults.staff,
            },
            max_connections: parse_or(
                &get,
                "DONORSLOT_MAX_CONNECTIONS",
                defaults.max_connections,
            )?,
            compact_threshold: parse_or(
                &get,
                "DONORSLOT_COMPACT_THRESHOLD",
                defaults.compact_threshold,
            )?,
            metrics_port: parse_opt(&get, "DONORSLOT_METRICS_PORT")?,
            tls_cert: get("DONORSLOT_TLS_CERT"),
            tls_key: get("DONORSLOT_TLS_KEY"),
            policy,
            reserve_timeout: parse_opt::<u64>(&get, "DONORSLOT_RESERVE_TIMEOUT_MS")?
                .map(Duration::from_millis),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("donorslot.wal")
    }
}

/// `nurse:secret,doctor:other`. Names and passwords must be non-empty and a
/// name may appear once.
fn parse_staff(value: &str) -> Result<HashMap<String, String>, ConfigError> {
    const VAR: &str = "DONORSLOT_STAFF";
    let mut staff = HashMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((user, password)) = entry.split_once(':') else {
            return Err(ConfigError::Invalid {
                var: VAR,
                value: entry.to_string(),
            });
        };
        let user = user.trim();
        if user.is_empty() || password.is_empty() {
            return Err(ConfigError::Invalid {
                var: VAR,
                value: entry.to_string(),
            });
        }
        if staff.insert(user.to_string(), password.to_string()).is_some() {
            return Err(ConfigError::OutOfRange {
                var: VAR,
                reason: format!("{user} listed twice"),
            });
        }
    }
    Ok(staff)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn parse_opt<T: FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(get, var)?.unwrap_or(default))
}
