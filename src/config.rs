/// Swarm configuration, read from the environment.
///
/// Every knob has a default so an empty environment yields a runnable
/// (if anonymous-by-default) configuration.
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::swarm::identity::IdentityProvider;
use crate::swarm::proxy::ProxyHop;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 6667;
const DEFAULT_TARGET: usize = 100;
const DEFAULT_TOR_SOCKS: &str = "127.0.0.1:9050";
const DEFAULT_TOR_CONTROL: &str = "127.0.0.1:9051";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2500;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Keepalive and timeout thresholds applied by the I/O loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    /// Upper bound on one readiness wait.
    pub poll_timeout: Duration,
    /// Idle time after which a keepalive ping is sent.
    pub ping_after: Duration,
    /// Idle time after which the connection is dropped.
    pub timeout_after: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(10),
            ping_after: Duration::from_secs(30),
            timeout_after: Duration::from_secs(120),
        }
    }
}

/// Pacing and shape of population growth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrowthPolicy {
    /// Target number of live connections.
    pub target: usize,
    /// Most connections attempted per cycle (one circuit per cycle).
    pub batch: usize,
    /// Chains shorter than this are refused.
    pub min_chain_len: usize,
    /// Per-attempt connect timeout, handshakes included.
    pub connect_timeout: Duration,
    /// Sleep after a cycle that found the target already met.
    pub idle_interval: Duration,
    /// Sleep after a cycle that had to grow.
    pub growth_interval: Duration,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET,
            batch: 1,
            min_chain_len: 1,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            idle_interval: Duration::from_secs(1),
            growth_interval: Duration::from_secs(5),
        }
    }
}

/// Tor settings: the SOCKS hop prepended to chains and the control port
/// used to request fresh circuits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorSettings {
    pub enabled: bool,
    pub socks: ProxyHop,
    pub control_addr: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub host: String,
    pub port: u16,
    pub growth: GrowthPolicy,
    pub liveness: LivenessPolicy,
    pub tor: TorSettings,
    pub proxy_list: Option<PathBuf>,
    pub identity: IdentityProvider,
}

impl SwarmConfig {
    /// Create from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let host = get("SWARM_HOST").unwrap_or_else(|| DEFAULT_HOST.into());
        let port = parse_or("SWARM_PORT", get("SWARM_PORT"), DEFAULT_PORT)?;

        let growth = GrowthPolicy {
            target: parse_or("SWARM_TARGET", get("SWARM_TARGET"), DEFAULT_TARGET)?,
            batch: parse_or("SWARM_BATCH", get("SWARM_BATCH"), 1)?,
            min_chain_len: parse_or("SWARM_MIN_CHAIN", get("SWARM_MIN_CHAIN"), 1)?,
            connect_timeout: Duration::from_millis(parse_or(
                "SWARM_CONNECT_TIMEOUT_MS",
                get("SWARM_CONNECT_TIMEOUT_MS"),
                DEFAULT_CONNECT_TIMEOUT_MS,
            )?),
            ..GrowthPolicy::default()
        };

        let socks_raw = get("SWARM_TOR_SOCKS").unwrap_or_else(|| DEFAULT_TOR_SOCKS.into());
        let socks = ProxyHop::socks5_from_addr(&socks_raw).ok_or_else(|| ConfigError::Invalid {
            var: "SWARM_TOR_SOCKS",
            value: socks_raw.clone(),
            reason: "expected host:port".into(),
        })?;
        let tor = TorSettings {
            enabled: parse_bool("SWARM_USE_TOR", get("SWARM_USE_TOR"), true)?,
            socks,
            control_addr: get("SWARM_TOR_CONTROL").unwrap_or_else(|| DEFAULT_TOR_CONTROL.into()),
            password: get("SWARM_TOR_PASSWORD").unwrap_or_default(),
        };

        let identity = match get("SWARM_IDENTITY") {
            Some(raw) => raw.parse::<IdentityProvider>().map_err(|e| {
                ConfigError::Invalid {
                    var: "SWARM_IDENTITY",
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?,
            None => IdentityProvider::default(),
        };

        Ok(Self {
            host,
            port,
            growth,
            liveness: LivenessPolicy::default(),
            tor,
            proxy_list: get("SWARM_PROXY_LIST").map(PathBuf::from),
            identity,
        })
    }
}

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_bool(var: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let lowered = raw.as_deref().map(str::to_ascii_lowercase);
    match lowered.as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(_) => Err(ConfigError::Invalid {
            var,
            value: raw.unwrap_or_default(),
            reason: "expected true or false".into(),
        }),
    }
}
