//! Hot-reload: watches the config file via the `notify` crate and
//! re-applies fields that are safe to swap at runtime.
//!
//! Hot fields: `general.log_level`, the `[balance]` section and the
//! upstream list (the pool is rebuilt, which resets health state until
//! the next probe cycle). Listener, api and check-timer changes require
//! a restart; a warning is emitted for those.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{recommended_watcher, EventKind, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::error::{ProxyError, Result};
use crate::pool::UpstreamPool;

use super::load::ProxyConfig;
use super::types::LogLevel;

const DEBOUNCE: Duration = Duration::from_millis(200);

fn warn_non_hot_changes(old: &ProxyConfig, new: &ProxyConfig) {
    if old.listeners != new.listeners {
        warn!("config reload: [[listener]] changed; restart required");
    }
    if old.api != new.api {
        warn!("config reload: [api] changed; restart required");
    }
    if old.check != new.check {
        warn!("config reload: [check] changed; restart required");
    }
}

/// Watch `path` and apply hot changes until the process exits. The
/// watcher thread is owned by the spawned task.
pub fn spawn<F>(path: PathBuf, pool: Arc<UpstreamPool>, apply_log_level: F) -> Result<()>
where
    F: Fn(&LogLevel) + Send + 'static,
{
    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(8);

    let mut watcher = recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                let _ = tx.blocking_send(());
            }
        }
    })
    .map_err(|e| ProxyError::Config(e.to_string()))?;
    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .map_err(|e| ProxyError::Config(e.to_string()))?;

    tokio::spawn(async move {
        // The watcher must stay alive as long as this task runs.
        let _watcher = watcher;
        let mut current = match ProxyConfig::load(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "hot reload disabled: cannot re-read config");
                return;
            }
        };

        while rx.recv().await.is_some() {
            tokio::time::sleep(DEBOUNCE).await;
            while rx.try_recv().is_ok() {}

            let new = match ProxyConfig::load(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "config reload: parse failed, keeping old config");
                    continue;
                }
            };
            if let Err(e) = new.validate() {
                warn!(error = %e, "config reload: invalid, keeping old config");
                continue;
            }

            warn_non_hot_changes(&current, &new);

            if new.general.log_level != current.general.log_level {
                info!(level = %new.general.log_level, "config reload: log level");
                apply_log_level(&new.general.log_level);
            }

            let pool_changed = new.upstreams != current.upstreams
                || new.balance.rule != current.balance.rule
                || new.balance.server_change_secs != current.balance.server_change_secs;
            if pool_changed {
                info!(
                    upstreams = new.upstreams.len(),
                    rule = %new.balance.rule,
                    "config reload: rebuilding upstream pool"
                );
                pool.set_config(&new);
            }

            current = new;
        }
    });

    Ok(())
}
