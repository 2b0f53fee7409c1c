//! Crate-wide error type.

use std::io;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("resolve failed for {0}")]
    Resolve(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connection to {addr} timed out")]
    ConnectionTimeout { addr: String },

    #[error("socks5 protocol error: {0}")]
    Socks5(String),

    #[error("http parse error: {0}")]
    HttpParse(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("no eligible upstream")]
    NoEligibleUpstream,
}

impl ProxyError {
    /// Short reason string for probe outcome reporting.
    pub fn short(&self) -> String {
        match self {
            ProxyError::ConnectionTimeout { .. } => "connect timeout".to_string(),
            ProxyError::Resolve(host) => format!("resolve: {host}"),
            ProxyError::Socks5(e) => format!("socks5: {e}"),
            ProxyError::HttpParse(e) => format!("http: {e}"),
            ProxyError::Tls(e) => format!("tls: {e}"),
            ProxyError::Io(e) => format!("io: {e}"),
            other => format!("{other}"),
        }
    }
}
