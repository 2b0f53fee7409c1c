//! socksbal - TCP load balancer for SOCKS5 proxy backends

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

mod api;
mod config;
mod error;
mod pool;
mod proxy;
mod stats;
mod stream;
mod transport;

use crate::config::{LogLevel, ProxyConfig};
use crate::pool::{HealthChecker, UpstreamPool};
use crate::proxy::{handle_client, SessionContext};
use crate::stats::StatisticsRegistry;
use crate::stream::BufferPool;

/// Cadence of the statistics delta snapshot.
const STATS_TICK: Duration = Duration::from_secs(1);
/// Expired weak session handles are swept every this many ticks.
const PRUNE_EVERY_TICKS: u32 = 30;

fn parse_cli() -> (String, bool, Option<String>) {
    let mut config_path = "config.toml".to_string();
    let mut silent = false;
    let mut log_level: Option<String> = None;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--silent" | "-s" => {
                silent = true;
            }
            "--log-level" => {
                i += 1;
                if i < args.len() {
                    log_level = Some(args[i].clone());
                }
            }
            s if s.starts_with("--log-level=") => {
                log_level = Some(s.trim_start_matches("--log-level=").to_string());
            }
            "--help" | "-h" => {
                eprintln!("Usage: socksbal [config.toml] [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --silent, -s            Suppress info logs");
                eprintln!("  --log-level <LEVEL>     silent|error|info|debug|verbose");
                eprintln!("  --help, -h              Show this help");
                std::process::exit(0);
            }
            s if !s.starts_with('-') => {
                config_path = s.to_string();
            }
            other => {
                eprintln!("Unknown option: {other}");
            }
        }
        i += 1;
    }

    (config_path, silent, log_level)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (config_path, cli_silent, cli_log_level) = parse_cli();

    let config = match ProxyConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            if std::path::Path::new(&config_path).exists() {
                eprintln!("[socksbal] Error: {e}");
                std::process::exit(1);
            } else {
                let default = ProxyConfig::default();
                std::fs::write(
                    &config_path,
                    toml::to_string_pretty(&default).expect("default config serializes"),
                )?;
                eprintln!("[socksbal] Created default config at {config_path}");
                default
            }
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("[socksbal] Invalid config: {e}");
        std::process::exit(1);
    }

    let has_rust_log = std::env::var("RUST_LOG").is_ok();
    let effective_log_level = if cli_silent {
        LogLevel::Silent
    } else if let Some(ref s) = cli_log_level {
        LogLevel::from_str_loose(s)
    } else {
        config.general.log_level.clone()
    };

    // Start with INFO so startup messages are always visible, then switch
    // to the user-configured level.
    let (filter_layer, filter_handle) = reload::Layer::new(EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::Layer::default())
        .init();

    info!("socksbal v{}", env!("CARGO_PKG_VERSION"));
    info!("Selection rule: {}", config.balance.rule);
    info!(
        "Health checks: tcp every {}s, end-to-end every {}s via {}:{}",
        config.check.tcp_check_period_secs,
        config.check.connect_check_period_secs,
        config.check.test_remote_host,
        config.check.test_remote_port
    );

    let pool = UpstreamPool::new(&config);
    for s in pool.servers() {
        info!(
            "  upstream {}: {} = {}:{}{}",
            s.index,
            s.name,
            s.host,
            s.port,
            if s.disable { " (disabled)" } else { "" }
        );
    }

    let stats = Arc::new(StatisticsRegistry::new());
    let buffers = Arc::new(BufferPool::new());

    let checker = match HealthChecker::new(pool.clone(), config.check.clone()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to set up health checker: {e}");
            std::process::exit(1);
        }
    };
    checker.spawn_timers();

    // Statistics cadence: delta snapshot every second, sweep every 30.
    let tick_stats = stats.clone();
    tokio::spawn(async move {
        let mut ticks = 0u32;
        loop {
            tokio::time::sleep(STATS_TICK).await;
            tick_stats.tick();
            ticks += 1;
            if ticks % PRUNE_EVERY_TICKS == 0 {
                tick_stats.prune();
            }
        }
    });

    if let Some(api_config) = &config.api {
        let _ = api::spawn(
            api_config.listen,
            api::AppState {
                pool: pool.clone(),
                stats: stats.clone(),
                checker: checker.clone(),
            },
        );
    }

    // Hot reload of log level, balance rule and the upstream list.
    {
        let handle = filter_handle.clone();
        let reload_pool = pool.clone();
        let apply = move |level: &LogLevel| {
            if std::env::var("RUST_LOG").is_ok() {
                return;
            }
            let _ = handle.reload(EnvFilter::new(level.to_filter_str()));
        };
        if let Err(e) = config::hot_reload::spawn(PathBuf::from(&config_path), reload_pool, apply) {
            warn!(error = %e, "config hot reload unavailable");
        }
    }

    let ctx = Arc::new(SessionContext {
        pool: pool.clone(),
        stats: stats.clone(),
        buffers,
    });

    let mut bound = 0usize;
    for listener_config in &config.listeners {
        let addr = listener_config.socket_addr();
        let protocol = listener_config.protocol;
        let listener = match transport::create_listener(addr) {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind to {addr}: {e}");
                continue;
            }
        };
        info!("Listening on {addr}");
        bound += 1;

        let pool = pool.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        pool.note_client_come();
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, peer, addr, protocol, ctx).await {
                                debug!(peer = %peer, error = %e, "session ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
    }

    if bound == 0 {
        error!("No listeners. Exiting.");
        std::process::exit(1);
    }

    // Switch to the user-configured log level after startup.
    let runtime_filter = if has_rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(effective_log_level.to_filter_str())
    };
    filter_handle
        .reload(runtime_filter)
        .expect("Failed to switch log filter");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Signal error: {e}"),
    }

    Ok(())
}
