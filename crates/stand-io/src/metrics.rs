//! Prometheus metrics for the thrust stand.
//!
//! Gauges mirror the latest telemetry snapshot; counters track commands,
//! interlock trips and emitted records.

use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use stand_core::{InterlockState, PowerSample, StandSnapshot};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn gauge(name: &str, help: &str) -> Gauge {
    let gauge = Gauge::new(name, help).unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
}

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
}

// ============================================================================
// Loop Metrics
// ============================================================================

pub static LOOP_ITERATIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "thrust_stand_loop_iterations_total",
        "Control loop iterations executed",
    )
});

/// Wall time of one loop iteration in microseconds
pub static ITERATION_US: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "thrust_stand_iteration_us",
            "Control loop iteration time in microseconds",
        )
        .buckets(vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

pub static TELEMETRY_RECORDS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "thrust_stand_telemetry_records_total",
        "Telemetry records written to the link",
    )
});

pub static COMMANDS_APPLIED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "thrust_stand_commands_applied_total",
        "Operator commands parsed and applied",
    )
});

pub static COMMANDS_REJECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "thrust_stand_commands_rejected_total",
        "Operator commands rejected as malformed or invalid",
    )
});

// ============================================================================
// Interlock Metrics
// ============================================================================

pub static INTERLOCK_TRIPS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "thrust_stand_interlock_trips_total",
        "Low-voltage cutoffs that forced the output to neutral",
    )
});

/// Interlock state (0=disarmed, 1=armed)
pub static INTERLOCK_ARMED: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "thrust_stand_interlock_armed",
        "Low-voltage interlock state (0=disarmed,1=armed)",
    )
});

// ============================================================================
// Measurement Metrics
// ============================================================================

pub static THRUST_GRAMS: LazyLock<Gauge> =
    LazyLock::new(|| gauge("thrust_stand_thrust_grams", "Averaged thrust in grams"));

pub static CURRENT_AMPS: LazyLock<Gauge> =
    LazyLock::new(|| gauge("thrust_stand_current_amps", "Averaged motor current in amps"));

pub static VOLTAGE_VOLTS: LazyLock<Gauge> =
    LazyLock::new(|| gauge("thrust_stand_voltage_volts", "Averaged pack voltage in volts"));

pub static SHAFT_RPM: LazyLock<Gauge> =
    LazyLock::new(|| gauge("thrust_stand_shaft_rpm", "Averaged shaft speed in RPM"));

pub static POWER_WATTS: LazyLock<Gauge> =
    LazyLock::new(|| gauge("thrust_stand_power_watts", "Electrical input power in watts"));

pub static EFFICIENCY_G_PER_W: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "thrust_stand_efficiency_grams_per_watt",
        "Thrust per watt of input power",
    )
});

pub static PULSE_WIDTH_US: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "thrust_stand_pulse_width_us",
        "Pulse width currently driven to the ESC",
    )
});

/// Link client connection status (1 = connected, 0 = disconnected)
pub static BRIDGE_CONNECTED: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "thrust_stand_bridge_connected",
        "Link client connection status (1=connected, 0=disconnected)",
    )
});

/// Mirror the latest snapshot into the measurement gauges.
pub fn observe_snapshot(snapshot: &StandSnapshot) {
    let record = &snapshot.record;
    let power = PowerSample::from_record(record);
    THRUST_GRAMS.set(record.load_g);
    CURRENT_AMPS.set(record.current_a);
    VOLTAGE_VOLTS.set(record.voltage_v);
    SHAFT_RPM.set(record.rpm);
    POWER_WATTS.set(power.power_w);
    EFFICIENCY_G_PER_W.set(power.efficiency_g_per_w);
    PULSE_WIDTH_US.set(snapshot.pulse_width_us as f64);
    INTERLOCK_ARMED.set(match snapshot.interlock {
        InterlockState::Disarmed => 0.0,
        InterlockState::Armed => 1.0,
    });
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let response = match request.url() {
                "/metrics" => match encode() {
                    Ok(buffer) => Response::from_data(buffer).with_header(
                        tiny_http::Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/plain; version=0.0.4"[..],
                        )
                        .unwrap(),
                    ),
                    Err(e) => {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        Response::from_string("Internal Server Error").with_status_code(500)
                    }
                },
                "/health" => Response::from_string("OK"),
                // Ready once the loop has published at least one record.
                "/ready" if TELEMETRY_RECORDS.get() > 0 => Response::from_string("Ready"),
                "/ready" => Response::from_string("Not Ready").with_status_code(503),
                _ => Response::from_string("Not Found").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    })
}

fn encode() -> Result<Vec<u8>, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = LOOP_ITERATIONS.get();
    let _ = ITERATION_US.get_sample_count();
    let _ = TELEMETRY_RECORDS.get();
    let _ = COMMANDS_APPLIED.get();
    let _ = COMMANDS_REJECTED.get();
    let _ = INTERLOCK_TRIPS.get();
    let _ = INTERLOCK_ARMED.get();
    let _ = THRUST_GRAMS.get();
    let _ = CURRENT_AMPS.get();
    let _ = VOLTAGE_VOLTS.get();
    let _ = SHAFT_RPM.get();
    let _ = POWER_WATTS.get();
    let _ = EFFICIENCY_G_PER_W.get();
    let _ = PULSE_WIDTH_US.get();
    let _ = BRIDGE_CONNECTED.get();
}
