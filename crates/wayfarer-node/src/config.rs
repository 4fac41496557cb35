//! Node configuration

use std::time::Duration;

use wayfarer_session::KeepAliveConfig;

/// Post-connect public IP verification
#[derive(Debug, Clone)]
pub struct IpCheckConfig {
    pub max_attempts: u32,
    pub sleep_after_check: Duration,
}

impl Default for IpCheckConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            sleep_after_check: Duration::from_secs(3),
        }
    }
}

/// Connection manager configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub ip_check: IpCheckConfig,
    pub keep_alive: KeepAliveConfig,
    pub stats_report_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ip_check: IpCheckConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            stats_report_interval: Duration::from_secs(1),
        }
    }
}
