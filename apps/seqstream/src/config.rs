use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::{Host, Url};

use crate::flow::FlowPolicy;
use crate::reconcile::ClosePolicy;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Close polls before giving up; with the server's usual one-second hint
/// this is roughly twelve minutes.
pub const DEFAULT_MAX_CLOSE_POLLS: u32 = 720;

pub const ENV_WORKERS: &str = "SEQSTREAM_WORKERS";
pub const ENV_MAX_ATTEMPTS: &str = "SEQSTREAM_MAX_ATTEMPTS";
pub const ENV_MAX_CLOSE_POLLS: &str = "SEQSTREAM_MAX_CLOSE_POLLS";
pub const ENV_OVERLOAD_HORIZON_SECS: &str = "SEQSTREAM_OVERLOAD_HORIZON_SECS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
    #[error("invalid server url {value:?}: {reason}")]
    InvalidUrl { value: String, reason: String },
}

/// Engine tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub max_close_polls: u32,
    pub overload_horizon: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_close_polls: DEFAULT_MAX_CLOSE_POLLS,
            overload_horizon: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let overload_horizon = match env_value::<f64>(ENV_OVERLOAD_HORIZON_SECS)? {
            Some(seconds) => Some(Duration::try_from_secs_f64(seconds).map_err(|_| {
                ConfigError::InvalidValue {
                    name: ENV_OVERLOAD_HORIZON_SECS,
                    value: seconds.to_string(),
                }
            })?),
            None => defaults.overload_horizon,
        };
        Ok(Self {
            workers: env_value(ENV_WORKERS)?.unwrap_or(defaults.workers),
            max_attempts: env_value(ENV_MAX_ATTEMPTS)?.unwrap_or(defaults.max_attempts),
            max_close_polls: env_value(ENV_MAX_CLOSE_POLLS)?.unwrap_or(defaults.max_close_polls),
            overload_horizon,
        })
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_close_polls(mut self, max_close_polls: u32) -> Self {
        self.max_close_polls = max_close_polls;
        self
    }

    pub fn with_overload_horizon(mut self, horizon: Option<Duration>) -> Self {
        self.overload_horizon = horizon;
        self
    }

    pub fn flow_policy(&self) -> FlowPolicy {
        FlowPolicy::new(self.max_attempts, self.overload_horizon)
    }

    pub fn close_policy(&self) -> ClosePolicy {
        ClosePolicy {
            max_polls: self.max_close_polls,
        }
    }
}

fn env_value<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(None),
    }
}

/// Parses a server base URL. A missing scheme is inferred (`http` for local
/// and private hosts, `https` otherwise) and the path always ends in `/` so
/// relative endpoints join underneath it.
pub fn parse_server_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidUrl {
            value: raw.to_string(),
            reason: "empty".into(),
        });
    }
    // Prefer IPv4 loopback over a possible ::1 resolution.
    let mut base = match trimmed.strip_prefix("localhost") {
        Some(rest) if rest.is_empty() || rest.starts_with(':') || rest.starts_with('/') => {
            format!("127.0.0.1{rest}")
        }
        _ => trimmed.to_string(),
    };
    if !base.contains("://") {
        base = format!("{}{base}", infer_scheme(&base));
    }
    let mut url = Url::parse(&base).map_err(|err| ConfigError::InvalidUrl {
        value: raw.to_string(),
        reason: err.to_string(),
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// WebSocket endpoint living under an HTTP base URL.
pub fn websocket_url(base: &Url) -> Result<Url, ConfigError> {
    let mut url = base.join("socket").map_err(|err| ConfigError::InvalidUrl {
        value: base.to_string(),
        reason: err.to_string(),
    })?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConfigError::InvalidUrl {
                value: base.to_string(),
                reason: format!("unsupported scheme {other}"),
            });
        }
    };
    url.set_scheme(scheme).map_err(|_| ConfigError::InvalidUrl {
        value: base.to_string(),
        reason: format!("cannot switch to {scheme}"),
    })?;
    Ok(url)
}

/// Port the filter API listens on in development deployments.
pub const DEV_SERVER_PORT: u16 = 5000;

/// Scheme for a base URL typed without one. Loopback, private and `.local`
/// hosts get plain `http`, as does anything on the development port.
fn infer_scheme(base: &str) -> &'static str {
    let authority = base.split('/').next().unwrap_or(base);
    let (host, port) = split_authority(authority);
    let plain = match Host::parse(&host) {
        Ok(Host::Domain(name)) => {
            name.eq_ignore_ascii_case("localhost") || name.to_ascii_lowercase().ends_with(".local")
        }
        Ok(Host::Ipv4(addr)) => {
            addr.is_loopback() || addr.is_private() || addr.is_link_local() || addr.is_unspecified()
        }
        Ok(Host::Ipv6(addr)) => addr.is_loopback() || addr.is_unspecified(),
        Err(_) => false,
    };
    if plain || port == Some(DEV_SERVER_PORT) {
        "http://"
    } else {
        "https://"
    }
}

/// Splits `host[:port]`; IPv6 hosts come back bracketed for [`Host::parse`].
fn split_authority(authority: &str) -> (String, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').unwrap_or((rest, ""));
        let port = tail.strip_prefix(':').and_then(|port| port.parse().ok());
        return (format!("[{host}]"), port);
    }
    match authority.split_once(':') {
        Some((_, rest)) if rest.contains(':') => (format!("[{authority}]"), None),
        Some((host, port)) => (host.to_string(), port.parse().ok()),
        None => (authority.to_string(), None),
    }
}
