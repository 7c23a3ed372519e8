// Runtime settings.
//
// Loaded once at system construction: defaults, optionally overlaid with a
// TOML file and `PLEXUS_*` environment overrides. Settings are immutable
// after that; everything that varies per call travels in the invocation
// context instead.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{PlexusError, PlexusResult};

pub const DEFAULT_PORT: u16 = 2809;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Human-readable request ids (at the cost of uniqueness guarantees).
    pub debug: bool,
    /// Maximum in-flight local-sync submissions before fail-fast rejection.
    pub max_queue: usize,
    /// Worker count for the chosen backend. 0 means one per CPU.
    pub num_workers: usize,
    /// Result timeout for a single function call, seconds.
    pub call_timeout_secs: u64,
    /// Accept/liveness timeout for a remote call acknowledgement, seconds.
    pub ack_timeout_secs: u64,
    /// Overall timeout for a restricted-code program, seconds.
    pub code_timeout_secs: u64,
    /// Whether handshakes may merge remote plugins into the registry.
    pub accept_remote_plugins: bool,
    /// With servers A-B-C, whether A's plugins are visible to C through B.
    /// Usually only enabled on the main server.
    pub allow_network_relay: bool,
    /// Relayed messages visiting more nodes than this are dropped.
    pub max_hops: u8,
    pub default_port: u16,
    /// Directory holding this node's keypair and allowed peer keys.
    pub auth_key_dir: PathBuf,
    /// Local peer-discovery registry file.
    pub discovery_path: PathBuf,
    /// How long a request's context outlives its result, seconds. Side
    /// effect callbacks can arrive slightly after the return message.
    pub context_grace_secs: u64,
    pub malformed_warn_threshold: u32,
    pub malformed_refuse_threshold: u32,
    pub malformed_shutdown_threshold: u32,
    /// Overrides the node-identity derivation seed. Mostly for tests that
    /// run several nodes in one process.
    pub node_seed: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            max_queue: 10,
            num_workers: 0,
            call_timeout_secs: 30,
            ack_timeout_secs: 3,
            code_timeout_secs: 120,
            accept_remote_plugins: true,
            allow_network_relay: true,
            max_hops: 5,
            default_port: DEFAULT_PORT,
            auth_key_dir: PathBuf::from("keys"),
            discovery_path: std::env::temp_dir().join("plexus_registry.json"),
            context_grace_secs: 2,
            malformed_warn_threshold: 10,
            malformed_refuse_threshold: 25,
            malformed_shutdown_threshold: 100,
            node_seed: None,
        }
    }
}

impl Settings {
    pub fn from_toml_str(raw: &str) -> PlexusResult<Self> {
        toml::from_str(raw).map_err(|e| PlexusError::Codec(format!("invalid settings: {}", e)))
    }

    /// Defaults, then the TOML file at `PLEXUS_CONFIG` (if set), then
    /// individual `PLEXUS_*` environment overrides.
    pub fn load() -> PlexusResult<Self> {
        let mut settings = match std::env::var("PLEXUS_CONFIG") {
            Ok(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            Err(_) => Self::default(),
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PLEXUS_DEBUG") {
            self.debug = matches!(v.as_str(), "1" | "true" | "True");
        }
        if let Some(v) = env_parse("PLEXUS_MAX_QUEUE") {
            self.max_queue = v;
        }
        if let Some(v) = env_parse("PLEXUS_NUM_WORKERS") {
            self.num_workers = v;
        }
        if let Some(v) = env_parse("PLEXUS_CALL_TIMEOUT_SECS") {
            self.call_timeout_secs = v;
        }
        if let Ok(v) = std::env::var("PLEXUS_ALLOW_NETWORK_RELAY") {
            self.allow_network_relay = matches!(v.as_str(), "1" | "true" | "True");
        }
    }

    pub fn worker_count(&self) -> usize {
        if self.num_workers == 0 {
            num_cpus::get()
        } else {
            self.num_workers
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn code_timeout(&self) -> Duration {
        Duration::from_secs(self.code_timeout_secs)
    }

    pub fn context_grace(&self) -> Duration {
        Duration::from_secs(self.context_grace_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.max_queue, 10);
        assert_eq!(s.ack_timeout(), Duration::from_secs(3));
        assert!(s.worker_count() >= 1);
    }

    #[test]
    fn toml_overlay() {
        let s = Settings::from_toml_str("max_queue = 3\ndebug = true\n").unwrap();
        assert_eq!(s.max_queue, 3);
        assert!(s.debug);
        assert_eq!(s.call_timeout_secs, 30);
    }
}
