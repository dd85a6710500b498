//! Daemon configuration from flags and `PORTLEASE_*` environment variables.

use clap::Parser;
use std::fmt;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::DaemonError;

pub const DEFAULT_LEASE_SECS: u64 = 600;
pub const DEFAULT_SWEEP_SECS: u64 = 30;

/// Inclusive range of ports the daemon hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    low: u16,
    high: u16,
}

impl PortRange {
    pub fn new(low: u16, high: u16) -> Result<Self, String> {
        if low == 0 {
            return Err("port range must start above 0".to_string());
        }
        if low > high {
            return Err(format!("port range {}-{} is empty", low, high));
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> u16 {
        self.low
    }

    pub fn high(&self) -> u16 {
        self.high
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.low && port <= self.high
    }

    pub fn size(&self) -> usize {
        usize::from(self.high - self.low) + 1
    }

    pub fn iter(&self) -> RangeInclusive<u16> {
        self.low..=self.high
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self { low: 3000, high: 3999 }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

/// Parses `low-high` or `low,high`.
impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (low, high) = s
            .split_once('-')
            .or_else(|| s.split_once(','))
            .ok_or_else(|| format!("expected LOW-HIGH, got '{}'", s))?;
        let low = low
            .trim()
            .parse::<u16>()
            .map_err(|e| format!("invalid low port '{}': {}", low.trim(), e))?;
        let high = high
            .trim()
            .parse::<u16>()
            .map_err(|e| format!("invalid high port '{}': {}", high.trim(), e))?;
        PortRange::new(low, high)
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "portleased", author, version, about = "Local port lease daemon")]
pub struct DaemonConfig {
    /// Address the HTTP API listens on
    #[arg(long, env = "PORTLEASE_LISTEN", default_value = "127.0.0.1:5555")]
    pub listen: SocketAddr,

    /// Allocatable port range, inclusive (LOW-HIGH)
    #[arg(long, env = "PORTLEASE_RANGE", default_value = "3000-3999")]
    pub range: PortRange,

    /// Default lease duration in seconds
    #[arg(long = "lease", env = "PORTLEASE_LEASE", default_value_t = DEFAULT_LEASE_SECS)]
    pub lease_secs: u64,

    /// Seconds between reclamation sweeps
    #[arg(
        long = "sweep-interval",
        env = "PORTLEASE_SWEEP_INTERVAL",
        default_value_t = DEFAULT_SWEEP_SECS
    )]
    pub sweep_secs: u64,

    /// State database path (default: ~/.portlease/state.db)
    #[arg(long, env = "PORTLEASE_STATE")]
    pub state: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.lease_secs == 0 {
            return Err(DaemonError::Config("lease must be at least 1 second".to_string()));
        }
        if self.sweep_secs == 0 {
            return Err(DaemonError::Config(
                "sweep interval must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn state_path(&self) -> PathBuf {
        self.state.clone().unwrap_or_else(default_state_path)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs)
    }
}

/// Get the default state path (~/.portlease/state.db)
pub fn default_state_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".portlease")
        .join("state.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dash_and_comma_ranges() {
        assert_eq!("3000-3999".parse::<PortRange>().unwrap(), PortRange::default());
        assert_eq!(
            "4000, 4010".parse::<PortRange>().unwrap(),
            PortRange::new(4000, 4010).unwrap()
        );
    }

    #[test]
    fn rejects_bad_ranges() {
        assert!("4000".parse::<PortRange>().is_err());
        assert!("5000-4000".parse::<PortRange>().is_err());
        assert!("0-100".parse::<PortRange>().is_err());
        assert!("3000-70000".parse::<PortRange>().is_err());
    }

    #[test]
    fn range_size_is_inclusive() {
        let range = PortRange::new(3000, 3000).unwrap();
        assert_eq!(range.size(), 1);
        assert!(range.contains(3000));
        assert!(!range.contains(3001));
        assert_eq!(PortRange::new(1, 65535).unwrap().size(), 65535);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = DaemonConfig::parse_from(["portleased"]);
        assert_eq!(config.range, PortRange::default());
        assert_eq!(config.lease_secs, 600);
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn flags_override_defaults() {
        let config = DaemonConfig::parse_from([
            "portleased",
            "--range",
            "8000-8100",
            "--lease",
            "60",
            "--state",
            "/tmp/leases.db",
        ]);
        assert_eq!(config.range, PortRange::new(8000, 8100).unwrap());
        assert_eq!(config.lease_secs, 60);
        assert_eq!(config.state_path(), PathBuf::from("/tmp/leases.db"));
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        let config = DaemonConfig::parse_from(["portleased", "--sweep-interval", "0"]);
        assert!(matches!(config.validate(), Err(DaemonError::Config(_))));
    }
}
