//! Prometheus metrics for the bridge.
//!
//! Covers the poll loop, the PLC session, the command path and the realtime channel.

use batch_core::SessionState;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Header, Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Poll Loop Metrics
// ============================================================================

/// Poll ticks executed
pub static POLL_TICKS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter =
        IntCounter::new("batchplant_poll_ticks_total", "Poll ticks executed").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Timer ticks skipped because the previous tick was still running
pub static POLL_TICKS_SKIPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "batchplant_poll_ticks_skipped_total",
        "Timer ticks skipped because a poll overran the interval",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Ticks that published a degraded snapshot
pub static POLL_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "batchplant_poll_failures_total",
        "Poll ticks that published an all-ERROR snapshot",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Ticks where the device left some tags out of the batch
pub static PARTIAL_READS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "batchplant_partial_reads_total",
        "Poll reads where at least one tag was missing from the response",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Poll duration in milliseconds
pub static POLL_DURATION_MS: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "batchplant_poll_duration_ms",
            "Time spent connecting and reading per poll tick",
        )
        .buckets(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0,
        ]),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

// ============================================================================
// Session Metrics
// ============================================================================

/// Session state (0=disconnected,1=connecting,2=ready,3=faulted)
pub static SESSION_STATE: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        "batchplant_session_state",
        "PLC session state (0=disconnected,1=connecting,2=ready,3=faulted)",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static CONNECT_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "batchplant_connect_failures_total",
        "Failed or timed-out PLC connection attempts",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static READ_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "batchplant_read_failures_total",
        "Batched reads that failed or timed out",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static WRITE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "batchplant_write_failures_total",
        "Writes that failed or timed out",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

// ============================================================================
// Command Metrics
// ============================================================================

/// Commands written to the PLC, by kind
pub static COMMANDS_ACCEPTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("batchplant_commands_accepted_total", "Commands written to the PLC"),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Commands that failed, by error kind
pub static COMMANDS_REJECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "batchplant_commands_rejected_total",
            "Commands rejected or failed, by error kind",
        ),
        &["error"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Pulse release writes (`false`) that failed
pub static PULSE_RELEASE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "batchplant_pulse_release_failures_total",
        "Pulse outputs whose release write failed",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Holds released by the watchdog rather than by the operator
pub static HOLD_WATCHDOG_RELEASES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "batchplant_hold_watchdog_releases_total",
        "Hold outputs forced off by the hold watchdog",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Authentication failures on commands
pub static AUTH_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "batchplant_auth_failures_total",
        "Commands rejected due to invalid auth tokens",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Missing authentication tokens when required
pub static AUTH_MISSING: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "batchplant_auth_missing_total",
        "Commands rejected due to missing auth tokens",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

// ============================================================================
// Realtime Channel Metrics
// ============================================================================

pub static SUBSCRIBERS: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(
        "batchplant_ws_subscribers",
        "Connected WebSocket subscribers",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Frames skipped by subscribers that fell behind
pub static FRAMES_LAGGED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "batchplant_ws_frames_lagged_total",
        "Frames skipped by lagging WebSocket subscribers",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static MALFORMED_MESSAGES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "batchplant_ws_malformed_messages_total",
        "Inbound WebSocket messages that could not be parsed",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

// ============================================================================
// Metrics HTTP Server
// ============================================================================

fn is_ready(state_code: f64) -> bool {
    state_code == SessionState::Ready.code()
}

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(addr = %bind_addr, error = %e, "failed to start metrics server");
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            match request.url() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
                        tracing::warn!(error = %e, "failed to encode metrics");
                        let _ = request.respond(
                            Response::from_string("Internal Server Error").with_status_code(500),
                        );
                        continue;
                    }
                    let mut response = Response::from_data(buffer);
                    if let Ok(header) =
                        Header::from_bytes(&b"Content-Type"[..], encoder.format_type().as_bytes())
                    {
                        response.add_header(header);
                    }
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    if is_ready(SESSION_STATE.get()) {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("PLC not connected").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = POLL_TICKS.get();
    let _ = POLL_TICKS_SKIPPED.get();
    let _ = POLL_FAILURES.get();
    let _ = PARTIAL_READS.get();
    let _ = POLL_DURATION_MS.get_sample_count();
    let _ = SESSION_STATE.get();
    let _ = CONNECT_FAILURES.get();
    let _ = READ_FAILURES.get();
    let _ = WRITE_FAILURES.get();
    let _ = COMMANDS_ACCEPTED.with_label_values(&["set_point"]).get();
    let _ = COMMANDS_REJECTED.with_label_values(&["validation"]).get();
    let _ = PULSE_RELEASE_FAILURES.get();
    let _ = HOLD_WATCHDOG_RELEASES.get();
    let _ = AUTH_FAILURES.get();
    let _ = AUTH_MISSING.get();
    let _ = SUBSCRIBERS.get();
    let _ = FRAMES_LAGGED.get();
    let _ = MALFORMED_MESSAGES.get();
}
