//! Admin HTTP endpoint: read-only status snapshot plus the control verbs
//! the pool and registry expose.

pub mod models;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::info;

use crate::pool::{HealthChecker, UpstreamPool};
use crate::stats::{Info, StatisticsRegistry};

use models::*;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<UpstreamPool>,
    pub stats: Arc<StatisticsRegistry>,
    pub checker: Arc<HealthChecker>,
}

pub fn spawn(listen: SocketAddr, state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let app = axum::Router::new()
            .route("/status", get(get_status))
            .route("/delays", get(get_delays))
            .route("/op", post(post_op))
            .with_state(state);

        match tokio::net::TcpListener::bind(listen).await {
            Ok(listener) => {
                info!("admin api listening on {listen}");
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "admin api server stopped");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bind admin api on {listen}");
            }
        }
    })
}

fn epoch_secs(t: Option<SystemTime>) -> Option<u64> {
    t.and_then(|t| t.duration_since(UNIX_EPOCH).ok()).map(|d| d.as_secs())
}

fn bucket_status(key: String, info: &Arc<Info>) -> BucketStatus {
    let w = info.window();
    BucketStatus {
        key,
        byte_up: info.byte_up.load(Ordering::Relaxed),
        byte_down: info.byte_down.load(Ordering::Relaxed),
        byte_up_change: w.up_change,
        byte_down_change: w.down_change,
        byte_up_change_max: w.up_change_max,
        byte_down_change_max: w.down_change_max,
        connect_count: info.connect_count.load(Ordering::Relaxed),
        last_use_upstream_index: info.last_use_upstream_index.load(Ordering::Relaxed),
    }
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let upstreams = state
        .pool
        .servers()
        .iter()
        .map(|s| UpstreamStatus {
            index: s.index,
            name: s.name.clone(),
            host: s.host.clone(),
            port: s.port,
            eligible: s.eligible(),
            offline: s.is_offline(),
            last_connect_failed: s.last_connect_failed(),
            manual_disable: s.is_manual_disable(),
            connect_count: s.connect_count.load(Ordering::Relaxed),
            last_online_time: epoch_secs(s.last_online_time()),
            last_connect_time: epoch_secs(s.last_connect_time()),
            last_connect_check_result: s.last_connect_check_result(),
            last_tcp_ping_ms: s.delays.last_tcp_ping().map(|d| d.as_millis()),
            last_http_ping_ms: s.delays.last_http_ping().map(|d| d.as_millis()),
            last_relay_first_delay_ms: s.delays.last_relay_first_delay().map(|d| d.as_millis()),
        })
        .collect();

    let upstream_buckets = state
        .stats
        .upstream_buckets()
        .into_iter()
        .map(|(idx, info)| bucket_status(idx.to_string(), &info))
        .collect();
    let client_buckets = state
        .stats
        .client_buckets()
        .into_iter()
        .map(|(addr, info)| bucket_status(addr, &info))
        .collect();
    let listen_buckets = state
        .stats
        .listen_buckets()
        .into_iter()
        .map(|(addr, info)| bucket_status(addr, &info))
        .collect();

    let now = SystemTime::now();
    let mut sessions = Vec::new();
    for (_, info) in state.stats.upstream_buckets() {
        for entry in info.sessions() {
            sessions.push(SessionStatus {
                upstream_index: entry.upstream_index,
                client: entry.client_addr.clone(),
                listen: entry.listen_addr.clone(),
                target: entry.target_addr.clone(),
                age_secs: now
                    .duration_since(entry.start_time)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                live: entry.session.strong_count() > 0,
            });
        }
    }

    Json(StatusResponse {
        rule: state.pool.rule().to_string(),
        last_use_upstream_index: state.pool.last_use_index(),
        rescue_in_flight: state.checker.rescue_in_flight(),
        upstreams,
        upstream_buckets,
        client_buckets,
        listen_buckets,
        sessions,
    })
}

#[derive(Debug, Deserialize)]
struct DelayQuery {
    i: usize,
}

fn delay_samples(history: Vec<crate::stats::delay::DelayInfo>) -> Vec<DelaySample> {
    history
        .into_iter()
        .map(|s| DelaySample {
            at: s
                .at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            delay_ms: s.delay.as_millis(),
        })
        .collect()
}

async fn get_delays(
    State(state): State<AppState>,
    Query(q): Query<DelayQuery>,
) -> Result<Json<DelayResponse>, StatusCode> {
    let server = state.pool.server(q.i).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(DelayResponse {
        index: server.index,
        tcp_ping: delay_samples(server.delays.history_tcp_ping()),
        http_ping: delay_samples(server.delays.history_http_ping()),
        relay_first_delay: delay_samples(server.delays.history_relay_first_delay()),
    }))
}

#[derive(Debug, Deserialize)]
struct OpQuery {
    cmd: String,
    i: Option<usize>,
    client: Option<String>,
    listen: Option<String>,
}

async fn post_op(State(state): State<AppState>, Query(op): Query<OpQuery>) -> (StatusCode, &'static str) {
    let bad = (StatusCode::BAD_REQUEST, "bad request");
    match op.cmd.as_str() {
        "disable" | "enable" => {
            let Some(server) = op.i.and_then(|i| state.pool.server(i)) else {
                return bad;
            };
            server.set_manual_disable(op.cmd == "disable");
        }
        "check" => state.checker.force_check_now(),
        "check_one" => {
            let Some(i) = op.i else { return bad };
            state.checker.force_check_one(i);
        }
        "use" => {
            let Some(i) = op.i else { return bad };
            state.pool.force_set_last_index(i);
        }
        "close" => {
            if let Some(i) = op.i {
                state.stats.close_all_upstream(i);
            } else if let Some(client) = &op.client {
                state.stats.close_all_client(client);
            } else if let Some(listen) = &op.listen {
                state.stats.close_all_listen(listen);
            } else {
                return bad;
            }
        }
        _ => return bad,
    }
    (StatusCode::OK, "ok")
}
