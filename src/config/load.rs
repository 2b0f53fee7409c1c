use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

use super::defaults;
use super::types::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_general")]
    pub general: GeneralConfig,
    #[serde(default = "default_balance")]
    pub balance: BalanceConfig,
    #[serde(default = "default_check")]
    pub check: CheckConfig,
    #[serde(default)]
    pub api: Option<ApiConfig>,
    #[serde(default, rename = "listener")]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default, rename = "upstream")]
    pub upstreams: Vec<UpstreamConfig>,
}

fn default_general() -> GeneralConfig {
    GeneralConfig {
        log_level: defaults::log_level(),
    }
}

fn default_balance() -> BalanceConfig {
    BalanceConfig {
        rule: defaults::select_rule(),
        server_change_secs: defaults::server_change_secs(),
    }
}

fn default_check() -> CheckConfig {
    CheckConfig {
        tcp_check_start_secs: defaults::tcp_check_start_secs(),
        tcp_check_period_secs: defaults::tcp_check_period_secs(),
        connect_check_start_secs: defaults::connect_check_start_secs(),
        connect_check_period_secs: defaults::connect_check_period_secs(),
        addition_check_period_secs: defaults::addition_check_period_secs(),
        sleep_secs: defaults::sleep_secs(),
        test_remote_host: defaults::test_remote_host(),
        test_remote_port: defaults::test_remote_port(),
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            general: default_general(),
            balance: default_balance(),
            check: default_check(),
            api: Some(ApiConfig {
                listen: "127.0.0.1:5010".parse().expect("static addr"),
            }),
            listeners: vec![ListenerConfig {
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 1080,
                protocol: ListenProtocol::default(),
            }],
            upstreams: vec![UpstreamConfig {
                name: "local-1".to_string(),
                host: "127.0.0.1".to_string(),
                port: 11080,
                disable: false,
            }],
        }
    }
}

impl ProxyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ProxyConfig =
            toml::from_str(&raw).map_err(|e| ProxyError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(ProxyError::Config("no [[listener]] configured".to_string()));
        }
        if self.upstreams.is_empty() {
            return Err(ProxyError::Config("no [[upstream]] configured".to_string()));
        }
        for (i, l) in self.listeners.iter().enumerate() {
            if l.port == 0 {
                return Err(ProxyError::Config(format!("listener #{i}: port must not be 0")));
            }
        }
        for u in &self.upstreams {
            if u.host.is_empty() {
                return Err(ProxyError::Config(format!("upstream '{}': empty host", u.name)));
            }
            if u.port == 0 {
                return Err(ProxyError::Config(format!(
                    "upstream '{}': port must not be 0",
                    u.name
                )));
            }
        }
        let c = &self.check;
        if c.test_remote_host.is_empty() {
            return Err(ProxyError::Config("check.test_remote_host is empty".to_string()));
        }
        if c.tcp_check_period_secs == 0
            || c.connect_check_period_secs == 0
            || c.addition_check_period_secs == 0
        {
            return Err(ProxyError::Config("check periods must not be 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let raw = r#"
            [[listener]]
            host = "127.0.0.1"
            port = 1080

            [[upstream]]
            name = "u0"
            host = "10.0.0.1"
            port = 11080
        "#;
        let config: ProxyConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.balance.rule, SelectRule::Loop);
        assert_eq!(config.check.tcp_check_period_secs, 30);
        assert_eq!(config.check.test_remote_port, 443);
        assert!(!config.upstreams[0].disable);
    }

    #[test]
    fn rule_names_round_trip() {
        for (name, rule) in [
            ("loop", SelectRule::Loop),
            ("one_by_one", SelectRule::OneByOne),
            ("change_by_time", SelectRule::ChangeByTime),
            ("random", SelectRule::Random),
        ] {
            let raw = format!(
                "[balance]\nrule = \"{name}\"\n\n[[listener]]\nhost = \"0.0.0.0\"\nport = 1\n\n[[upstream]]\nname = \"u\"\nhost = \"h\"\nport = 1\n"
            );
            let config: ProxyConfig = toml::from_str(&raw).unwrap();
            assert_eq!(config.balance.rule, rule);
            assert_eq!(rule.to_string(), name);
        }
    }

    #[test]
    fn empty_pool_is_rejected() {
        let raw = "[[listener]]\nhost = \"127.0.0.1\"\nport = 1080\n";
        let config: ProxyConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_is_valid_and_serializes() {
        let config = ProxyConfig::default();
        config.validate().unwrap();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: ProxyConfig = toml::from_str(&text).unwrap();
        back.validate().unwrap();
        assert_eq!(back.upstreams, config.upstreams);
    }
}
