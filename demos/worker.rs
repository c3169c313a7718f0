//! Run several copies of this demo at once to see them share one set of counters.
//!
//! The first copy to start becomes the leader and prints the shared exposition text every few
//! seconds; every other copy forwards its increments to it. Each copy counts its own "requests"
//! through the `metrics` facade, labelled with its pid. Press Ctrl+C to stop a copy.
//!
//! Lock and socket paths default to `/tmp` and can be overridden with
//! `MULTIPROC_METRICS_LOCK_PATH` and `MULTIPROC_METRICS_SOCK_PATH`.

use multiproc_metrics::{Collector, CollectorConfig, CollectorRecorder, Role};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

fn main() {
    let collector = Collector::new(CollectorConfig::from_env().namespace("demo"));
    if let Err(e) = collector.start() {
        eprintln!("Failed to start metrics collector: {}", e);
        return;
    }
    let role = match collector.wait_ready(Some(Duration::from_secs(15))) {
        Ok(role) => role,
        Err(e) => {
            eprintln!("Metrics collector never became ready: {}", e);
            return;
        }
    };
    println!("Running as {:?} (pid {}).", role, std::process::id());

    if let Err(e) = CollectorRecorder::install(collector.clone()) {
        eprintln!("Failed to install recorder: {}", e);
        return;
    }
    metrics::describe_counter!("requests_total", "Requests handled by this demo.");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Handle Ctrl+C to exit gracefully.
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let pid = std::process::id().to_string();
    let mut ticks = 0u64;
    while running.load(Ordering::SeqCst) {
        metrics::counter!("requests_total", "pid" => pid.clone()).increment(1);
        ticks += 1;

        if role == Role::Leader && ticks % 30 == 0 {
            match collector.query() {
                Ok(text) => println!("{text}"),
                Err(e) => eprintln!("Query failed: {}", e),
            }
        }
        thread::sleep(Duration::from_millis(100));
    }

    println!("Shutting down metrics collector.");
    if let Err(e) = collector.stop() {
        eprintln!("Failed to stop metrics collector: {}", e);
    }
}
