//! JSON shapes served by the admin endpoint.

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub rule: String,
    pub last_use_upstream_index: usize,
    pub rescue_in_flight: bool,
    pub upstreams: Vec<UpstreamStatus>,
    pub upstream_buckets: Vec<BucketStatus>,
    pub client_buckets: Vec<BucketStatus>,
    pub listen_buckets: Vec<BucketStatus>,
    pub sessions: Vec<SessionStatus>,
}

#[derive(Debug, Serialize)]
pub struct UpstreamStatus {
    pub index: usize,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub eligible: bool,
    pub offline: bool,
    pub last_connect_failed: bool,
    pub manual_disable: bool,
    pub connect_count: usize,
    /// Unix seconds; absent until the first probe success.
    pub last_online_time: Option<u64>,
    pub last_connect_time: Option<u64>,
    pub last_connect_check_result: String,
    pub last_tcp_ping_ms: Option<u128>,
    pub last_http_ping_ms: Option<u128>,
    pub last_relay_first_delay_ms: Option<u128>,
}

#[derive(Debug, Serialize)]
pub struct BucketStatus {
    pub key: String,
    pub byte_up: u64,
    pub byte_down: u64,
    pub byte_up_change: u64,
    pub byte_down_change: u64,
    pub byte_up_change_max: u64,
    pub byte_down_change_max: u64,
    pub connect_count: usize,
    pub last_use_upstream_index: usize,
}

#[derive(Debug, Serialize)]
pub struct DelaySample {
    /// Unix milliseconds of the sample.
    pub at: u64,
    pub delay_ms: u128,
}

#[derive(Debug, Serialize)]
pub struct DelayResponse {
    pub index: usize,
    pub tcp_ping: Vec<DelaySample>,
    pub http_ping: Vec<DelaySample>,
    pub relay_first_delay: Vec<DelaySample>,
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub upstream_index: usize,
    pub client: String,
    pub listen: String,
    pub target: String,
    pub age_secs: u64,
    pub live: bool,
}
