
use crate::error::{CommError, Result};

use log::warn;
use serde::Deserialize;

use std::env;
use std::fs;
use std::path::Path;

/// Top-level server configuration, normally read from a JSON file.  Every
/// field has a default so a missing file (or a sparse one) still gets you a
/// runnable server; the file only needs to say what it wants to change.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the game listener binds to.
    pub listen_addr: String,
    /// How long one trip around the event loop may wait, in milliseconds.
    pub tick_ms: u64,
    /// The channels that exist on this server.  All of them are visible to
    /// the relay bridge, if one is configured.
    pub channels: Vec<String>,
    /// Longest chat message we will pass along, in characters.
    pub max_message_len: usize,
    /// Cap on any one session's pending output, in bytes.  A session that
    /// falls this far behind gets dropped rather than eating memory forever.
    pub max_session_outbuf: usize,
    /// How many simultaneous sessions we'll hold open.
    pub max_sessions: usize,
    /// Relay bridge settings.  Absent means no bridge at all: the loop never
    /// opens the port and never spends a cycle on it.
    pub bridge: Option<BridgeConfig>,
    /// Where to serve `GET /health`, if anywhere.
    pub health_addr: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_addr: "0.0.0.0:4000".to_string(),
            tick_ms: 100,
            channels: vec!["gossip".to_string()],
            max_message_len: 512,
            max_session_outbuf: 256 * 1024,
            max_sessions: 256,
            bridge: None,
            health_addr: None,
        }
    }
}

/// Settings for the relay bridge port.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the bridge listener binds to.  Relays usually run on the same
    /// host, so the default stays on loopback.
    pub listen_addr: String,
    /// Shared secret the relay has to present before anything else.  None
    /// means any connection on the bridge port is trusted.
    pub auth_token: Option<String>,
    /// What to do when a second relay connects while one is active.
    pub takeover: TakeoverPolicy,
    /// Cap on the bridge client's input and output buffers, in bytes.
    pub max_buffer: usize,
    /// Drop a relay that has been silent this long.  Relays are expected to
    /// heartbeat well inside this window.  Zero disables the check.
    pub idle_timeout_secs: u64,
    /// How long a relay gets to authenticate before we drop it.
    pub auth_deadline_secs: u64,
    /// Most messages per second we accept from any one speaker on any one
    /// channel.  Zero disables rate limiting.
    pub rate_limit_per_channel: u32,
}

impl Default for BridgeConfig {
    fn default() -> BridgeConfig {
        BridgeConfig {
            listen_addr: "127.0.0.1:4201".to_string(),
            auth_token: None,
            takeover: TakeoverPolicy::Replace,
            max_buffer: 256 * 1024,
            idle_timeout_secs: 300,
            auth_deadline_secs: 30,
            rate_limit_per_channel: 10,
        }
    }
}

/// Policy for a relay connecting while another relay is already active.
/// `Replace` assumes the old socket is a leftover from a relay that crashed
/// and reconnected; `Reject` is first-come-first-served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TakeoverPolicy {
    Replace,
    Reject,
}

impl Config {
    /// Read a config file, falling back to defaults if it isn't there.
    /// Environment overrides are applied either way.
    pub fn load(path: &Path) -> Result<Config> {
        let mut config = if path.exists() {
            let text = fs::read_to_string(path).map_err(|e| {
                CommError::Config(format!("couldn't read {}: {}", path.display(), e))
            })?;
            serde_json::from_str(&text).map_err(|e| {
                CommError::Config(format!("couldn't parse {}: {}", path.display(), e))
            })?
        } else {
            warn!("No config file at {}; using defaults", path.display());
            Config::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Secrets prefer the environment over the file, so the file can be
    /// checked in without the token in it.
    pub fn apply_env(&mut self) {
        if let Ok(token) = env::var("BRIDGE_AUTH_TOKEN") {
            if !token.is_empty() {
                if let Some(bridge) = self.bridge.as_mut() {
                    bridge.auth_token = Some(token);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:4000");
        assert_eq!(config.tick_ms, 100);
        assert_eq!(config.channels, vec!["gossip".to_string()]);
        assert!(config.bridge.is_none());
        assert!(config.health_addr.is_none());
    }

    #[test]
    fn sparse_bridge_section_fills_in() {
        let config: Config = serde_json::from_str(
            r#"{"bridge": {"listen_addr": "127.0.0.1:9999", "takeover": "reject"}}"#,
        )
        .unwrap();
        let bridge = config.bridge.unwrap();
        assert_eq!(bridge.listen_addr, "127.0.0.1:9999");
        assert_eq!(bridge.takeover, TakeoverPolicy::Reject);
        assert_eq!(bridge.idle_timeout_secs, 300);
        assert_eq!(bridge.rate_limit_per_channel, 10);
    }

    #[test]
    fn env_token_wins_over_file_token() {
        let mut config: Config = serde_json::from_str(
            r#"{"bridge": {"auth_token": "from-the-file"}}"#,
        )
        .unwrap();
        env::set_var("BRIDGE_AUTH_TOKEN", "from-the-environment");
        config.apply_env();
        env::remove_var("BRIDGE_AUTH_TOKEN");
        assert_eq!(
            config.bridge.unwrap().auth_token.as_deref(),
            Some("from-the-environment")
        );
    }
}
