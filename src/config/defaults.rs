//! Serde default values for the config schema.

use super::types::{LogLevel, SelectRule};

pub(crate) fn log_level() -> LogLevel {
    LogLevel::Info
}

pub(crate) fn select_rule() -> SelectRule {
    SelectRule::Loop
}

pub(crate) fn server_change_secs() -> u64 {
    300
}

pub(crate) fn tcp_check_start_secs() -> u64 {
    1
}

pub(crate) fn tcp_check_period_secs() -> u64 {
    30
}

pub(crate) fn connect_check_start_secs() -> u64 {
    2
}

pub(crate) fn connect_check_period_secs() -> u64 {
    300
}

pub(crate) fn addition_check_period_secs() -> u64 {
    10
}

pub(crate) fn sleep_secs() -> u64 {
    1800
}

pub(crate) fn test_remote_host() -> String {
    "www.google.com".to_string()
}

pub(crate) fn test_remote_port() -> u16 {
    443
}
