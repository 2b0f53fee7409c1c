use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults;

/// Runtime log verbosity. Maps onto a tracing `EnvFilter` directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    Info,
    Debug,
    Verbose,
}

impl LogLevel {
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "silent" | "off" => LogLevel::Silent,
            "error" => LogLevel::Error,
            "debug" => LogLevel::Debug,
            "verbose" | "trace" => LogLevel::Verbose,
            _ => LogLevel::Info,
        }
    }

    pub fn to_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Silent => "error",
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Silent => "silent",
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
        };
        f.write_str(s)
    }
}

/// Upstream selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectRule {
    #[serde(rename = "loop")]
    Loop,
    OneByOne,
    ChangeByTime,
    Random,
}

impl fmt::Display for SelectRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SelectRule::Loop => "loop",
            SelectRule::OneByOne => "one_by_one",
            SelectRule::ChangeByTime => "change_by_time",
            SelectRule::Random => "random",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "defaults::log_level")]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceConfig {
    #[serde(default = "defaults::select_rule")]
    pub rule: SelectRule,
    /// Rotation period for the `change_by_time` rule.
    #[serde(default = "defaults::server_change_secs")]
    pub server_change_secs: u64,
}

impl BalanceConfig {
    pub fn server_change_time(&self) -> Duration {
        Duration::from_secs(self.server_change_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConfig {
    #[serde(default = "defaults::tcp_check_start_secs")]
    pub tcp_check_start_secs: u64,
    #[serde(default = "defaults::tcp_check_period_secs")]
    pub tcp_check_period_secs: u64,
    #[serde(default = "defaults::connect_check_start_secs")]
    pub connect_check_start_secs: u64,
    #[serde(default = "defaults::connect_check_period_secs")]
    pub connect_check_period_secs: u64,
    #[serde(default = "defaults::addition_check_period_secs")]
    pub addition_check_period_secs: u64,
    /// Idle-quiet window: periodic probes are suppressed when no client
    /// connection arrived within this window.
    #[serde(default = "defaults::sleep_secs")]
    pub sleep_secs: u64,
    #[serde(default = "defaults::test_remote_host")]
    pub test_remote_host: String,
    #[serde(default = "defaults::test_remote_port")]
    pub test_remote_port: u16,
}

impl CheckConfig {
    pub fn tcp_check_start(&self) -> Duration {
        Duration::from_secs(self.tcp_check_start_secs)
    }

    pub fn tcp_check_period(&self) -> Duration {
        Duration::from_secs(self.tcp_check_period_secs)
    }

    pub fn connect_check_start(&self) -> Duration {
        Duration::from_secs(self.connect_check_start_secs)
    }

    pub fn connect_check_period(&self) -> Duration {
        Duration::from_secs(self.connect_check_period_secs)
    }

    pub fn addition_check_period(&self) -> Duration {
        Duration::from_secs(self.addition_check_period_secs)
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_secs(self.sleep_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub listen: SocketAddr,
}

/// Which client-side protocols a listener accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenProtocol {
    /// Detect SOCKS5 or HTTP per connection.
    #[default]
    Auto,
    Socks5,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub host: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub protocol: ListenProtocol,
}

impl ListenerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub disable: bool,
}
