//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use secp256k1::SecretKey;

use crate::{client::RelayClientConfig, comments::CommentConfig, keys};

pub const DEFAULT_RELAYS: &str = "wss://relay.damus.io,wss://nos.lol";
pub const DEFAULT_NIP46_RELAY: &str = "wss://relay.damus.io";

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory of the durability cache and block lists.
    pub store_root: PathBuf,
    /// Application relay list.
    pub relays: Vec<String>,
    /// Instance key, as `nsec` or hex.
    pub nostr_secret: Option<String>,
    /// Relay used for remote-bunker sessions.
    pub nip46_relay: String,
    pub relay_max_concurrent: usize,
    pub relay_max_reads: usize,
    pub relay_max_writes: usize,
    pub relay_timeout: Duration,
    pub relay_cache_ttl: Duration,
    pub comment_cache_ttl: Duration,
    /// Durability rows older than this are not merged into threads.
    pub local_cache_ttl: Duration,
    pub engagement_ttl: Duration,
    pub feed_limit: usize,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT").context("STORE_ROOT is not set")?);
        let relays = csv_strings(env::var("NOSTR_RELAYS").unwrap_or_else(|_| DEFAULT_RELAYS.into()));
        let nostr_secret = non_empty("NOSTR_NSEC").or_else(|| non_empty("NOSTR_SK_HEX"));
        let nip46_relay = non_empty("NIP46_RELAY").unwrap_or_else(|| DEFAULT_NIP46_RELAY.into());
        Ok(Self {
            store_root,
            relays,
            nostr_secret,
            nip46_relay,
            relay_max_concurrent: number("RELAY_MAX_CONCURRENT", 5).max(1) as usize,
            relay_max_reads: number("RELAY_MAX_READS", 5) as usize,
            relay_max_writes: number("RELAY_MAX_WRITES", 5) as usize,
            relay_timeout: secs("RELAY_TIMEOUT_SECS", 5),
            relay_cache_ttl: secs("RELAY_CACHE_TTL_SECS", 30),
            comment_cache_ttl: secs("COMMENT_CACHE_TTL_SECS", 30),
            local_cache_ttl: secs("LOCAL_CACHE_TTL_SECS", 600),
            engagement_ttl: secs("ENGAGEMENT_TTL_SECS", 300),
            feed_limit: number("FEED_LIMIT", 100) as usize,
            tor_socks: non_empty("TOR_SOCKS"),
        })
    }

    pub fn relay_config(&self) -> RelayClientConfig {
        RelayClientConfig {
            max_concurrent: self.relay_max_concurrent,
            max_relays_read: self.relay_max_reads,
            max_relays_write: self.relay_max_writes,
            timeout: self.relay_timeout,
            cache_ttl: self.relay_cache_ttl,
            tor_socks: self.tor_socks.clone(),
        }
    }

    pub fn comment_config(&self) -> CommentConfig {
        CommentConfig {
            local_cache_ttl: self.local_cache_ttl,
            thread_cache_ttl: self.comment_cache_ttl,
            limit: self.feed_limit,
            ..CommentConfig::default()
        }
    }

    /// The instance key, if one is configured.
    pub fn secret_key(&self) -> Result<Option<SecretKey>> {
        self.nostr_secret
            .as_deref()
            .map(|s| keys::load_secret_key(s).context("parsing NOSTR_NSEC / NOSTR_SK_HEX"))
            .transpose()
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn number(var: &str, default: u64) -> u64 {
    non_empty(var).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn secs(var: &str, default: u64) -> Duration {
    Duration::from_secs(number(var, default))
}

/// Non-empty entries of a comma-separated list, trimmed.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, sync::Mutex};
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 15] = [
        "STORE_ROOT",
        "NOSTR_RELAYS",
        "NOSTR_NSEC",
        "NOSTR_SK_HEX",
        "NIP46_RELAY",
        "RELAY_MAX_CONCURRENT",
        "RELAY_MAX_READS",
        "RELAY_MAX_WRITES",
        "RELAY_TIMEOUT_SECS",
        "RELAY_CACHE_TTL_SECS",
        "COMMENT_CACHE_TTL_SECS",
        "LOCAL_CACHE_TTL_SECS",
        "ENGAGEMENT_TTL_SECS",
        "FEED_LIMIT",
        "TOR_SOCKS",
    ];

    fn clear_env() {
        for v in VARS {
            env::remove_var(v);
        }
    }

    fn load(content: &str) -> Result<Settings> {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, content).unwrap();
        Settings::from_env(env_path.to_str().unwrap())
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let cfg = load(concat!(
            "STORE_ROOT=/tmp\n",
            "NOSTR_RELAYS=ws://r1,ws://r2\n",
            "NOSTR_SK_HEX=0000000000000000000000000000000000000000000000000000000000000003\n",
            "RELAY_MAX_CONCURRENT=2\n",
            "RELAY_MAX_READS=3\n",
            "RELAY_TIMEOUT_SECS=7\n",
            "LOCAL_CACHE_TTL_SECS=60\n",
            "FEED_LIMIT=20\n",
            "TOR_SOCKS=127.0.0.1:9050\n",
        ))
        .unwrap();
        assert_eq!(cfg.store_root, PathBuf::from("/tmp"));
        assert_eq!(cfg.relays, vec!["ws://r1", "ws://r2"]);
        assert!(cfg.secret_key().unwrap().is_some());
        let relay = cfg.relay_config();
        assert_eq!(relay.max_concurrent, 2);
        assert_eq!(relay.max_relays_read, 3);
        assert_eq!(relay.max_relays_write, 5);
        assert_eq!(relay.timeout, Duration::from_secs(7));
        assert_eq!(relay.tor_socks.as_deref(), Some("127.0.0.1:9050"));
        let comments = cfg.comment_config();
        assert_eq!(comments.local_cache_ttl, Duration::from_secs(60));
        assert_eq!(comments.limit, 20);
        assert_eq!(comments.max_relays, 5);
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let cfg = load("STORE_ROOT=/tmp\n").unwrap();
        assert_eq!(cfg.relays, vec!["wss://relay.damus.io", "wss://nos.lol"]);
        assert_eq!(cfg.nip46_relay, DEFAULT_NIP46_RELAY);
        assert!(cfg.nostr_secret.is_none());
        assert!(cfg.secret_key().unwrap().is_none());
        assert!(cfg.tor_socks.is_none());
        assert_eq!(cfg.relay_cache_ttl, Duration::from_secs(30));
        assert_eq!(cfg.engagement_ttl, Duration::from_secs(300));
        assert_eq!(cfg.feed_limit, 100);
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let cfg = load(concat!(
            "STORE_ROOT=/tmp\n",
            "RELAY_MAX_CONCURRENT=0\n",
            "RELAY_TIMEOUT_SECS=soon\n",
            "FEED_LIMIT=-3\n",
        ))
        .unwrap();
        assert_eq!(cfg.relay_max_concurrent, 1);
        assert_eq!(cfg.relay_timeout, Duration::from_secs(5));
        assert_eq!(cfg.feed_limit, 100);
    }

    #[test]
    fn bad_secret_is_reported() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let cfg = load("STORE_ROOT=/tmp\nNOSTR_NSEC=nsec1nope\n").unwrap();
        assert!(cfg.secret_key().is_err());
    }

    #[test]
    fn missing_store_root_errors() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        assert!(load("NOSTR_RELAYS=ws://r1\n").is_err());
    }

    #[test]
    fn relay_lists_skip_blank_entries() {
        assert_eq!(csv_strings("wss://a, wss://b , ,"), vec!["wss://a", "wss://b"]);
        assert!(csv_strings("").is_empty());
    }
}
