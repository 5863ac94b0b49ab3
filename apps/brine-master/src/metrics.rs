//! Prometheus metrics for brine-master.
//!
//! Nothing is exported unless `metrics_addr` is set; the macros are no-ops
//! until a recorder is installed.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the recorder and serve `/metrics` on `addr`.
///
/// Must be called from inside the tokio runtime, once.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    describe_counter!("brine_auth_total", "Key handshakes by outcome");
    describe_counter!("brine_publish_total", "Jobs published by outcome");
    describe_counter!("brine_returns_total", "Minion returns received");
    describe_histogram!(
        "brine_request_duration_seconds",
        "Time a worker spent on one request"
    );
    describe_gauge!("brine_session_version", "Current session key version");
    describe_gauge!("brine_minions_present", "Minions seen inside the presence window");

    Ok(())
}

pub fn record_auth(outcome: &'static str) {
    counter!("brine_auth_total", "outcome" => outcome).increment(1);
}

pub fn record_publish(outcome: &'static str) {
    counter!("brine_publish_total", "outcome" => outcome).increment(1);
}

pub fn record_return(source: &'static str) {
    counter!("brine_returns_total", "source" => source).increment(1);
}

pub fn record_session_version(version: u64) {
    gauge!("brine_session_version").set(version as f64);
}

pub fn record_present(count: usize) {
    gauge!("brine_minions_present").set(count as f64);
}

/// Times one request and records it on completion.
pub struct RequestTimer {
    kind: &'static str,
    start: Instant,
}

impl RequestTimer {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            start: Instant::now(),
        }
    }

    pub fn finish(self, status: &'static str) {
        histogram!(
            "brine_request_duration_seconds",
            "kind" => self.kind,
            "status" => status
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_harmless() {
        let timer = RequestTimer::new("auth");
        record_auth("pending");
        record_session_version(3);
        timer.finish("ok");
    }
}
