// Prometheus metrics for the agentgate control plane
//
// Exposed on the optional /metrics listener:
// - Command outcomes by endpoint/action (counter)
// - Authentication and replay rejections (counter)
// - Circuit breaker trips (counter)
// - Script run time (histogram)
// - Certificate rotations and TLS reloads (counter)
// - Remembered nonces (gauge)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Request metrics
    pub static ref COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("agentgate_commands_total", "Command requests by endpoint, action and outcome"),
        &["endpoint", "action", "outcome"]
    ).expect("Failed to create commands total metric");

    pub static ref AUTH_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("agentgate_auth_failures_total", "Requests rejected by the authenticator"),
        &["endpoint"]
    ).expect("Failed to create auth failures metric");

    pub static ref REPLAY_REJECTIONS_TOTAL: IntCounter = IntCounter::new(
        "agentgate_replay_rejections_total",
        "Requests rejected for stale timestamp or reused nonce"
    ).expect("Failed to create replay rejections metric");

    pub static ref NONCE_STORE_SIZE: IntGauge = IntGauge::new(
        "agentgate_nonce_store_size",
        "Nonces currently remembered by the replay guard"
    ).expect("Failed to create nonce store size metric");

    // Execution metrics
    pub static ref CIRCUIT_TRIPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("agentgate_circuit_trips_total", "Auto-executions denied by the circuit breaker"),
        &["action"]
    ).expect("Failed to create circuit trips metric");

    pub static ref SCRIPT_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("agentgate_script_duration_seconds", "Whitelisted script run time")
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0]),
        &["action", "status"]
    ).expect("Failed to create script duration metric");

    // Rotation metrics
    pub static ref ROTATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("agentgate_cert_rotations_total", "Certificate rotations by outcome"),
        &["outcome"]
    ).expect("Failed to create rotations metric");

    pub static ref TLS_RELOADS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("agentgate_tls_reloads_total", "TLS context reloads by outcome"),
        &["outcome"]
    ).expect("Failed to create TLS reloads metric");
}

/// Register every metric with [`REGISTRY`]
///
/// Safe to call more than once; already-registered collectors are skipped.
pub fn init() -> prometheus::Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(COMMANDS_TOTAL.clone()),
        Box::new(AUTH_FAILURES_TOTAL.clone()),
        Box::new(REPLAY_REJECTIONS_TOTAL.clone()),
        Box::new(NONCE_STORE_SIZE.clone()),
        Box::new(CIRCUIT_TRIPS_TOTAL.clone()),
        Box::new(SCRIPT_DURATION_SECONDS.clone()),
        Box::new(ROTATIONS_TOTAL.clone()),
        Box::new(TLS_RELOADS_TOTAL.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

/// Count a finished command request
pub fn record_command(endpoint: &str, action: &str, outcome: &str) {
    COMMANDS_TOTAL
        .with_label_values(&[endpoint, action, outcome])
        .inc();
}

/// Record how long a script ran
pub fn observe_script(action: &str, success: bool, secs: f64) {
    let status = if success { "success" } else { "failure" };
    SCRIPT_DURATION_SECONDS
        .with_label_values(&[action, status])
        .observe(secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_gather_contains_recorded_command() {
        init().unwrap();
        record_command("handshake", "fetch_logs", "suggested");
        observe_script("fetch_logs", true, 0.2);
        REPLAY_REJECTIONS_TOTAL.inc();

        let text = gather_metrics().unwrap();
        assert!(text.contains("agentgate_commands_total"));
        assert!(text.contains("endpoint=\"handshake\""));
        assert!(text.contains("agentgate_script_duration_seconds"));
        assert!(text.contains("agentgate_replay_rejections_total"));
    }
}
