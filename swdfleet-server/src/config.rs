use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use jiff::SignedDuration;

/// Runtime settings for the backend process, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Plain-HTTP listen address.
    pub http_addr: SocketAddr,
    /// TLS listen address; used instead of `http_addr` when set.
    pub https_addr: Option<SocketAddr>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    pub operator_password: String,
    pub device_enroll_key: String,
    /// Path of the JSON state snapshot.
    pub data_file: PathBuf,
    /// Directory served at `/`.
    pub static_dir: PathBuf,
    /// Hard cap on registered devices.
    pub fleet_limit: usize,
    pub operator_token_ttl: SignedDuration,
    pub device_offline_after: SignedDuration,
    pub max_json_bytes: usize,
    pub max_artifact_bytes: usize,
    pub api_rate_per_minute: u32,
    pub login_rate_per_minute: u32,
    pub login_burst: u32,
    /// Honour X-Forwarded-For / X-Real-IP when resolving the client IP.
    pub trust_proxy_headers: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("fleet limit must be positive")]
    FleetLimitNotPositive,
    #[error("operator password must not be empty")]
    EmptyOperatorPassword,
    #[error("device enroll key must not be empty")]
    EmptyEnrollKey,
    #[error("max json bytes too small")]
    JsonBytesTooSmall,
    #[error("max artifact bytes must be >= max json bytes")]
    ArtifactBytesTooSmall,
    #[error("rate limits must be positive")]
    RatesNotPositive,
    #[error("https requires HTTPS_ADDR, TLS_CERT_FILE and TLS_KEY_FILE together")]
    TlsIncomplete,
    #[error("invalid listen address: {0}")]
    InvalidListenAddr(String),
}

impl Config {
    /// Reads process environment variables and applies defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] but with an explicit lookup, so tests
    /// never touch the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let https_addr_raw = lookup_str(&lookup, "HTTPS_ADDR", "");
        let tls_cert_raw = lookup_str(&lookup, "TLS_CERT_FILE", "");
        let tls_key_raw = lookup_str(&lookup, "TLS_KEY_FILE", "");

        // Numeric knobs parse as signed values: a garbage value falls back
        // to the default, while an explicit non-positive one is a hard
        // configuration error.
        let fleet_limit = lookup_parse(&lookup, "FLEET_LIMIT", 10i64);
        let max_json_bytes = lookup_parse(&lookup, "MAX_JSON_BYTES", 64 * 1024i64);
        let max_artifact_bytes = lookup_parse(&lookup, "MAX_ARTIFACT_BYTES", 12 * 1024 * 1024i64);
        let api_rate_per_minute = lookup_parse(&lookup, "API_RATE_PER_MINUTE", 180i64);
        let login_rate_per_minute = lookup_parse(&lookup, "LOGIN_RATE_PER_MINUTE", 20i64);
        let login_burst = lookup_parse(&lookup, "LOGIN_BURST", 5i64);

        if fleet_limit <= 0 {
            return Err(ConfigError::FleetLimitNotPositive);
        }
        if max_json_bytes < 1024 {
            return Err(ConfigError::JsonBytesTooSmall);
        }
        if max_artifact_bytes < max_json_bytes {
            return Err(ConfigError::ArtifactBytesTooSmall);
        }
        if api_rate_per_minute <= 0 || login_rate_per_minute <= 0 || login_burst <= 0 {
            return Err(ConfigError::RatesNotPositive);
        }

        let config = Config {
            http_addr: parse_listen_addr(&lookup_str(&lookup, "HTTP_ADDR", ":8080"))?,
            https_addr: match https_addr_raw.as_str() {
                "" => None,
                raw => Some(parse_listen_addr(raw)?),
            },
            tls_cert_file: non_empty_path(tls_cert_raw),
            tls_key_file: non_empty_path(tls_key_raw),
            operator_password: lookup_str(&lookup, "OPERATOR_PASSWORD", "lte_swd_admin")
                .trim()
                .to_string(),
            device_enroll_key: lookup_str(&lookup, "DEVICE_ENROLL_KEY", "r1-enroll-key")
                .trim()
                .to_string(),
            data_file: PathBuf::from(lookup_str(&lookup, "DATA_FILE", "data/state.json")),
            static_dir: PathBuf::from(lookup_str(&lookup, "STATIC_DIR", "web/panel")),
            fleet_limit: fleet_limit as usize,
            operator_token_ttl: lookup_parse(
                &lookup,
                "OPERATOR_TOKEN_TTL",
                SignedDuration::from_hours(12),
            ),
            device_offline_after: lookup_parse(
                &lookup,
                "DEVICE_OFFLINE_AFTER",
                SignedDuration::from_secs(90),
            ),
            max_json_bytes: max_json_bytes as usize,
            max_artifact_bytes: max_artifact_bytes as usize,
            api_rate_per_minute: api_rate_per_minute as u32,
            login_rate_per_minute: login_rate_per_minute as u32,
            login_burst: login_burst as u32,
            trust_proxy_headers: lookup_bool(&lookup, "TRUST_PROXY_HEADERS", false),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.operator_password.is_empty() {
            return Err(ConfigError::EmptyOperatorPassword);
        }
        if self.device_enroll_key.is_empty() {
            return Err(ConfigError::EmptyEnrollKey);
        }

        let tls_parts = [
            self.https_addr.is_some(),
            self.tls_cert_file.is_some(),
            self.tls_key_file.is_some(),
        ];
        if tls_parts.iter().any(|set| *set) && !tls_parts.iter().all(|set| *set) {
            return Err(ConfigError::TlsIncomplete);
        }

        Ok(())
    }
}

/// Parses a listen address, accepting the bare `:port` shorthand for
/// all-interfaces binds.
pub fn parse_listen_addr(raw: &str) -> Result<SocketAddr, ConfigError> {
    let normalized = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    normalized
        .parse()
        .map_err(|_| ConfigError::InvalidListenAddr(raw.to_string()))
}

fn non_empty_path(raw: String) -> Option<PathBuf> {
    if raw.is_empty() { None } else { Some(PathBuf::from(raw)) }
}

fn lookup_str(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    match lookup(key) {
        Some(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

/// Unparseable values fall back to the default rather than failing startup.
fn lookup_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn lookup_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).as_deref() {
        Some("1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON") => true,
        Some("0" | "false" | "FALSE" | "no" | "NO" | "off" | "OFF") => false,
        _ => default,
    }
}
