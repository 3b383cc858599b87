//! gridquota.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridQuotaConfig {
    pub server: ServerConfig,
    pub reservation: ReservationConfig,
    pub capacity: CapacityConfig,
    pub bootstrap: BootstrapConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8480,
            data_dir: PathBuf::from("/var/lib/gridquota"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// Conditional-write attempts before a ledger mutation gives up.
    pub max_conflict_retries: u32,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Interval between full inventory sweeps.
    pub sweep_interval_secs: u64,
    /// Depth of the capacity event channel.
    pub event_buffer: usize,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Create the default pool and the global default placement on startup.
    pub default_pool: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self { default_pool: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,gridquota=debug".to_string(),
        }
    }
}

impl GridQuotaConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Path of the redb database inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.server.data_dir.join("gridquota.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = GridQuotaConfig::parse("").unwrap();
        assert_eq!(config, GridQuotaConfig::default());
        assert_eq!(config.reservation.max_conflict_retries, 8);
        assert!(config.bootstrap.default_pool);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let toml_str = r#"
[server]
port = 9000

[capacity]
sweep_interval_secs = 5
"#;
        let config = GridQuotaConfig::parse(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.data_dir, PathBuf::from("/var/lib/gridquota"));
        assert_eq!(config.capacity.sweep_interval_secs, 5);
        assert_eq!(config.capacity.event_buffer, 256);
    }

    #[test]
    fn roundtrips_through_toml() {
        let mut config = GridQuotaConfig::default();
        config.logging.filter = "warn".to_string();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("max_conflict_retries"));
        assert_eq!(GridQuotaConfig::parse(&text).unwrap(), config);
    }

    #[test]
    fn database_lives_in_data_dir() {
        let mut config = GridQuotaConfig::default();
        config.server.data_dir = PathBuf::from("/tmp/gq");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/gq/gridquota.redb"));
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = std::env::temp_dir().join(format!("gridquota-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gridquota.toml");
        std::fs::write(&path, "[reservation]\nmax_conflict_retries = 3\n").unwrap();

        let config = GridQuotaConfig::from_file(&path).unwrap();
        assert_eq!(config.reservation.max_conflict_retries, 3);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
