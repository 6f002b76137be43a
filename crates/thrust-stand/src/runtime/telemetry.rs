use stand_core::TelemetryExchange;
use stand_io::metrics::{
    init_metrics, observe_snapshot, serve_metrics, INTERLOCK_TRIPS, ITERATION_US, LOOP_ITERATIONS,
};
use std::sync::{atomic::AtomicBool, Arc};
use std::thread;
use std::time::Duration;
use tracing::info;

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Mirror loop snapshots into the metrics registry until `stop` is raised.
pub fn start_metrics_updater(
    exchange: Arc<TelemetryExchange>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last_iteration = 0u64;
        let mut last_trips = 0u64;
        while !stop.load(std::sync::atomic::Ordering::Relaxed) {
            let snapshot = exchange.latest();
            observe_snapshot(&snapshot);
            if snapshot.iteration > last_iteration {
                LOOP_ITERATIONS.inc_by(snapshot.iteration - last_iteration);
                ITERATION_US.observe(snapshot.iteration_us as f64);
                last_iteration = snapshot.iteration;
            }
            if snapshot.interlock_trips > last_trips {
                INTERLOCK_TRIPS.inc_by(snapshot.interlock_trips - last_trips);
                last_trips = snapshot.interlock_trips;
            }
            thread::sleep(Duration::from_millis(200));
        }
    })
}
