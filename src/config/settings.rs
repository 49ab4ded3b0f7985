use super::duration::duration_or;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that overrides `bin_dir`.
pub const BIN_DIR_ENV: &str = "DBFIXTURE_BIN";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT_LOW: u16 = 20000;
pub const DEFAULT_PORT_HIGH: u16 = 21000;

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_DIR_NAME: &str = "dbfixture";
const DEFAULT_DB_FILE_NAME: &str = "registry.db";

/// Inclusive port range handed to the [`PortAllocator`](crate::port::PortAllocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn new(low: u16, high: u16) -> Result<Self> {
        let range = Self { low, high };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if self.low == 0 || self.low > self.high {
            return Err(Error::InvalidPortRange {
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }

    /// Number of ports in the range; zero when `low > high`.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            usize::from(self.high - self.low) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.low > self.high
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            low: DEFAULT_PORT_LOW,
            high: DEFAULT_PORT_HIGH,
        }
    }
}

/// Supervisor settings, usually loaded from a YAML file.
///
/// ```yaml
/// persistence_path: /tmp/fixtures/registry.db
/// bin_dir: /opt/mongodb/bin
/// releases:
///   "4.4": /opt/mongodb-4.4/bin
///   "6.0": /opt/mongodb-6.0/bin
/// default_release: "6.0"
/// port_range: { low: 27100, high: 27200 }
/// start_timeout: 45s
/// grace_period: 2s
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// SQLite file that holds registry records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence_path: Option<PathBuf>,

    /// Directory searched first for server binaries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<PathBuf>,

    /// Named releases, each a directory of server binaries, selected per
    /// instance with the `version` parameter
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub releases: BTreeMap<String, PathBuf>,

    /// Release used when an instance names none; falls back to `bin_dir`
    /// when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_release: Option<String>,

    /// Root for generated config files and data directories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default)]
    pub port_range: PortRange,

    /// Format: duration string like "10s", "30s", "1m", "500ms"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timeout: Option<String>,

    /// Time between SIGTERM and SIGKILL when stopping a server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<String>,
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        self.port_range.validate()?;
        validate_releases(&self.releases, self.default_release.as_deref())?;
        if let Some(host) = &self.host {
            if host.trim().is_empty() || host.contains(':') {
                return Err(Error::Config(format!(
                    "host must be a bare hostname or IPv4 address, got '{}'",
                    host
                )));
            }
        }
        Ok(())
    }

    /// Root directory for everything the supervisor writes, defaulting to
    /// `<tmp>/dbfixture`.
    pub fn get_work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_DIR_NAME))
    }

    pub fn get_persistence_path(&self) -> PathBuf {
        self.persistence_path
            .clone()
            .unwrap_or_else(|| self.get_work_dir().join(DEFAULT_DB_FILE_NAME))
    }

    /// Binary directory, with `DBFIXTURE_BIN` taking precedence over the file.
    pub fn get_bin_dir(&self) -> Option<PathBuf> {
        match std::env::var(BIN_DIR_ENV) {
            Ok(dir) if !dir.trim().is_empty() => Some(PathBuf::from(dir)),
            _ => self.bin_dir.clone(),
        }
    }

    pub fn get_host(&self) -> String {
        self.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    /// Timeout used by `create(.., autostart = true)`, defaulting to 30 seconds.
    pub fn get_start_timeout(&self) -> Duration {
        duration_or(
            "start_timeout",
            self.start_timeout.as_deref(),
            DEFAULT_START_TIMEOUT,
        )
    }

    /// Grace period for graceful shutdown, defaulting to 5 seconds.
    pub fn get_grace_period(&self) -> Duration {
        duration_or(
            "grace_period",
            self.grace_period.as_deref(),
            DEFAULT_GRACE_PERIOD,
        )
    }
}

/// `default_release`, when set, must name one of `releases`.
pub fn validate_releases(
    releases: &BTreeMap<String, PathBuf>,
    default_release: Option<&str>,
) -> Result<()> {
    if let Some(name) = releases.keys().find(|name| name.trim().is_empty()) {
        return Err(Error::Config(format!("Invalid release name '{}'", name)));
    }
    match default_release {
        Some(default) if !releases.contains_key(default) => Err(Error::Config(format!(
            "default_release '{}' is not one of the configured releases",
            default
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.get_host(), "127.0.0.1");
        assert_eq!(config.port_range, PortRange::new(20000, 21000).unwrap());
        assert_eq!(config.get_start_timeout(), Duration::from_secs(30));
        assert_eq!(config.get_grace_period(), Duration::from_secs(5));
        assert!(config.get_persistence_path().ends_with("dbfixture/registry.db"));
    }

    #[test]
    fn port_range_validation() {
        assert!(PortRange::new(0, 10).is_err());
        assert!(PortRange::new(30, 10).is_err());
        let single = PortRange::new(4000, 4000).unwrap();
        assert_eq!(single.len(), 1);
        assert!(single.contains(4000));
        assert!(!single.contains(4001));
    }

    #[test]
    fn unvalidated_inverted_range_is_empty() {
        let inverted = PortRange { low: 10, high: 5 };
        assert!(inverted.is_empty());
        assert_eq!(inverted.len(), 0);
        assert!(!inverted.contains(7));

        let full = PortRange { low: 1, high: u16::MAX };
        assert!(!full.is_empty());
        assert_eq!(full.len(), 65535);
    }

    #[test]
    fn default_release_must_be_configured() {
        let mut config = SupervisorConfig {
            default_release: Some("6.0".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config
            .releases
            .insert("6.0".to_string(), PathBuf::from("/opt/mongodb-6.0/bin"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_host_with_port() {
        let config = SupervisorConfig {
            host: Some("localhost:27017".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
