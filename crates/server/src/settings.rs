//! Server settings.

use hullsync_net::codec::{compute_schema_hash, ContentPackageList};
use hullsync_net::lifecycle::{HandshakePolicy, DEFAULT_PASSWORD_ATTEMPTS};
use hullsync_net::replication::PhysicsLimits;
use hullsync_net::PROTOCOL_VERSION;
use anyhow::Context;
use hullsync_net::LinkTimings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Default UDP port.
pub const DEFAULT_PORT: u16 = 27015;

/// Tunables of a hosted session. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the QUIC endpoint binds to.
    pub bind_addr: SocketAddr,
    /// Name shown in the server list.
    pub server_name: String,
    /// Session password; `None` for an open server.
    pub password: Option<String>,
    /// Maximum simultaneous connections, pending ones included.
    pub max_players: usize,
    /// Replication ticks per second.
    pub tick_rate: u32,
    /// Out-of-order initialization steps tolerated per connection.
    pub max_init_retries: u32,
    /// Liveness bound for relay connections, seconds.
    pub peer_timeout_secs: u64,
    /// Whether voice is relayed at all.
    pub voice_enabled: bool,
    /// Minimum interval between two flushes of one voice queue, milliseconds.
    pub voice_interval_ms: u64,
    /// Frames retained per voice queue.
    pub voice_buffer_frames: usize,
    /// Ledger flush cadence in replication ticks.
    pub ledger_sync_interval_ticks: u64,
    /// Malformed messages tolerated before disconnect.
    pub max_malformed_messages: u32,
    /// Content packages clients must match, in load order.
    pub content_packages: Vec<String>,
    /// Velocity clamps for physics snapshots.
    pub physics: PhysicsLimits,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            server_name: "hullsync server".to_string(),
            password: None,
            max_players: 16,
            tick_rate: 20,
            max_init_retries: 5,
            peer_timeout_secs: 5,
            voice_enabled: true,
            voice_interval_ms: 60,
            voice_buffer_frames: 8,
            ledger_sync_interval_ticks: 10,
            max_malformed_messages: 10,
            content_packages: vec!["Vanilla".to_string()],
            physics: PhysicsLimits::default(),
        }
    }
}

impl ServerSettings {
    /// Parse TOML and validate the result.
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let settings: ServerSettings = toml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read and validate a settings file.
    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid settings in {}", path.display()))
    }

    /// Write these settings as TOML, creating parent directories.
    pub fn save_file(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Check invariants the server relies on.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.tick_rate > 0, "tick_rate must be positive");
        anyhow::ensure!(self.max_players > 0, "max_players must be positive");
        anyhow::ensure!(self.voice_interval_ms > 0, "voice_interval_ms must be positive");
        anyhow::ensure!(self.peer_timeout_secs > 0, "peer_timeout_secs must be positive");
        anyhow::ensure!(
            self.physics.max_velocity > 0.0 && self.physics.max_angular_velocity > 0.0,
            "physics limits must be positive"
        );
        Ok(())
    }

    /// Duration of one replication tick.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.tick_rate.max(1)))
    }

    /// Minimum voice flush interval.
    pub fn voice_interval(&self) -> Duration {
        Duration::from_millis(self.voice_interval_ms.max(1))
    }

    /// Relay liveness bound.
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs.max(1))
    }

    /// QUIC liveness timings; a socket link dies after the same silence as a
    /// relay peer.
    pub fn link_timings(&self) -> LinkTimings {
        LinkTimings::from_idle_timeout(self.peer_timeout())
    }

    /// Handshake requirements derived from these settings.
    pub fn handshake_policy(&self) -> HandshakePolicy {
        HandshakePolicy {
            protocol_version: PROTOCOL_VERSION,
            schema_hash: compute_schema_hash(),
            content: ContentPackageList::new(self.content_packages.clone()),
            password: self.password.clone().filter(|password| !password.is_empty()),
            max_retries: self.max_init_retries,
            password_attempts: DEFAULT_PASSWORD_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = ServerSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.peer_timeout(), Duration::from_secs(5));
        assert_eq!(settings.physics.max_velocity, 64.0);
        assert_eq!(settings.tick_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: ServerSettings = toml::from_str(
            r#"
            server_name = "Europa Station"
            max_players = 4

            [physics]
            max_velocity = 20.0
            "#,
        )
        .unwrap();
        assert_eq!(settings.server_name, "Europa Station");
        assert_eq!(settings.max_players, 4);
        assert_eq!(settings.physics.max_velocity, 20.0);
        assert_eq!(settings.physics.max_angular_velocity, 16.0);
        assert_eq!(settings.tick_rate, ServerSettings::default().tick_rate);
    }

    #[test]
    fn test_empty_password_means_open() {
        let settings = ServerSettings {
            password: Some(String::new()),
            ..ServerSettings::default()
        };
        assert!(settings.handshake_policy().password.is_none());
    }

    #[test]
    fn test_zero_tick_rate_rejected() {
        let settings = ServerSettings {
            tick_rate: 0,
            ..ServerSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_link_timings_follow_peer_timeout() {
        let settings = ServerSettings {
            peer_timeout_secs: 9,
            ..ServerSettings::default()
        };
        let timings = settings.link_timings();
        assert_eq!(timings.idle_timeout, Duration::from_secs(9));
        assert_eq!(timings.keep_alive, Duration::from_secs(3));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep").join("server.toml");
        let settings = ServerSettings {
            server_name: "Abyss Relay".to_string(),
            content_packages: vec!["Vanilla".to_string(), "DeepSeaPack".to_string()],
            peer_timeout_secs: 12,
            ..ServerSettings::default()
        };
        settings.save_file(&path).unwrap();
        assert_eq!(ServerSettings::load_file(&path).unwrap(), settings);
    }

    #[test]
    fn test_load_file_errors_name_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "max_players = \"many\"\n").unwrap();

        let err = ServerSettings::load_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.toml"));
        assert!(ServerSettings::load_file(&dir.path().join("absent.toml")).is_err());
    }
}
