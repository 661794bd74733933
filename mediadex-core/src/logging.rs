use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::worker::flight_log::FlightLog;

/// Install the process-wide subscriber: console output (WARN+ unless
/// `--verbose` or RUST_LOG says otherwise) plus the flight-log ring, which
/// captures everything down to DEBUG.
pub fn init(verbose: bool, forensics_dir: &Path) -> FlightLog {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "info" } else { "warn" }));
    let flight = FlightLog::new(forensics_dir);
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(console_filter),
        )
        .with(flight.layer())
        .try_init();
    flight
}
