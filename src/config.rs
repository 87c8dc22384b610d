//! Runtime configuration, read from `MATCHWIRE_*` environment variables

use std::time::Duration;

use rand::Rng;

use crate::signaling::DEFAULT_SIGNALING_PORT;

pub const DEFAULT_HTTP_PORT: u16 = 8080;

const DEFAULT_TOKEN_TTL_SECS: u64 = 180;
const DEFAULT_QUOTA_PER_SOURCE: u32 = 10;
const DEFAULT_QUOTA_RESET_SECS: u64 = 30;
const DEFAULT_MAX_ROOMS: usize = 500;
const DEFAULT_ABANDON_AFTER_SECS: u64 = 30;

const SECRET_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const SECRET_LEN: usize = 48;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host for both servers
    pub host: String,
    /// Port of the token-issuing HTTP endpoint
    pub http_port: u16,
    /// Port of the WebSocket signaling server
    pub signaling_port: u16,
    /// HMAC secret for admission tokens; random per process when unset
    pub token_secret: String,
    /// Validity window of a minted token
    pub token_ttl: Duration,
    /// Token requests allowed per source address per reset interval
    pub quota_per_source: u32,
    /// Cadence at which all source counters are cleared
    pub quota_reset_interval: Duration,
    /// Service-wide ceiling on concurrent rooms, enforced at issuance
    pub max_rooms: usize,
    /// How long an admitted session may stay unpaired before eviction
    pub abandon_after: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: env_or("MATCHWIRE_HOST", "0.0.0.0".to_string()),
            http_port: env_or("MATCHWIRE_HTTP_PORT", DEFAULT_HTTP_PORT),
            signaling_port: env_or("MATCHWIRE_SIGNALING_PORT", DEFAULT_SIGNALING_PORT),
            token_secret: std::env::var("MATCHWIRE_TOKEN_SECRET")
                .unwrap_or_else(|_| generate_secret()),
            token_ttl: Duration::from_secs(env_or(
                "MATCHWIRE_TOKEN_TTL_SECS",
                DEFAULT_TOKEN_TTL_SECS,
            )),
            quota_per_source: env_or("MATCHWIRE_QUOTA_PER_SOURCE", DEFAULT_QUOTA_PER_SOURCE),
            quota_reset_interval: Duration::from_secs(env_or(
                "MATCHWIRE_QUOTA_RESET_SECS",
                DEFAULT_QUOTA_RESET_SECS,
            )),
            max_rooms: env_or("MATCHWIRE_MAX_ROOMS", DEFAULT_MAX_ROOMS),
            abandon_after: Duration::from_secs(env_or(
                "MATCHWIRE_ABANDON_AFTER_SECS",
                DEFAULT_ABANDON_AFTER_SECS,
            )),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: DEFAULT_HTTP_PORT,
            signaling_port: DEFAULT_SIGNALING_PORT,
            token_secret: generate_secret(),
            token_ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_SECS),
            quota_per_source: DEFAULT_QUOTA_PER_SOURCE,
            quota_reset_interval: Duration::from_secs(DEFAULT_QUOTA_RESET_SECS),
            max_rooms: DEFAULT_MAX_ROOMS,
            abandon_after: Duration::from_secs(DEFAULT_ABANDON_AFTER_SECS),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn generate_secret() -> String {
    let mut rng = rand::rng();
    (0..SECRET_LEN)
        .map(|_| SECRET_CHARS[rng.random_range(0..SECRET_CHARS.len())] as char)
        .collect()
}
