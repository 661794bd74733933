//! The flight log: a bounded in-memory ring of recent log lines per worker.
//! Nothing below WARN touches disk in steady state; the ring is flushed to
//! the forensics directory on `forensic_dump` or when an attempt fails, so
//! only the context around failures is ever persisted.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub const FLIGHT_LOG_CAPACITY: usize = 50_000;

#[derive(Clone)]
pub struct FlightLog {
    entries: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    forensics_dir: PathBuf,
}

impl FlightLog {
    pub fn new(forensics_dir: impl Into<PathBuf>) -> Self {
        Self::with_capacity(forensics_dir, FLIGHT_LOG_CAPACITY)
    }

    pub fn with_capacity(forensics_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(1024))),
            capacity,
            forensics_dir: forensics_dir.into(),
        }
    }

    pub fn push(&self, line: String) {
        let mut entries = self.entries.lock().expect("flight log lock");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("flight log lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain-free atomic dump: the buffer is copied under the lock and
    /// written outside it, so logging never blocks on file IO.
    pub fn dump(&self, worker_id: &str) -> std::io::Result<PathBuf> {
        let snapshot: Vec<String> = {
            let entries = self.entries.lock().expect("flight log lock");
            entries.iter().cloned().collect()
        };
        fs::create_dir_all(&self.forensics_dir)?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = self.forensics_dir.join(format!("{worker_id}_{timestamp}.log"));
        let mut file = fs::File::create(&path)?;
        for line in &snapshot {
            writeln!(file, "{line}")?;
        }
        Ok(path)
    }

    pub fn layer(&self) -> FlightLogLayer {
        FlightLogLayer { log: self.clone() }
    }

    pub fn forensics_dir(&self) -> &Path {
        &self.forensics_dir
    }
}

pub struct FlightLogLayer {
    log: FlightLog,
}

struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for FlightLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = LineVisitor {
            message: String::new(),
            fields: String::new(),
        };
        event.record(&mut visitor);
        self.log.push(format!(
            "{} [{}] {}: {}{}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            meta.level(),
            meta.target(),
            visitor.message,
            visitor.fields,
        ));
    }
}
