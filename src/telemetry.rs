//! Export events and the sinks that record them.
//!
//! Every component that reports progress receives an `Arc<dyn Telemetry>`.
//! Disabling telemetry means injecting [`NoopTelemetry`].

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Event {
	/// The service finished its startup.
	Started,
	/// A notification entered the export pipeline.
	Request,
	/// Number of bytes read from the source for one instance.
	Bytes(u64),
	/// A notification was rejected.
	Error,
}

impl Display for Event {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Started => write!(f, "STARTED"),
			Self::Request => write!(f, "REQUEST"),
			Self::Bytes(_) => write!(f, "BYTES"),
			Self::Error => write!(f, "ERROR"),
		}
	}
}

/// Fire-and-forget sink for export events.
pub trait Telemetry: Send + Sync {
	fn emit(&self, event: Event);

	/// Running totals, if the sink keeps any.
	fn totals(&self) -> Option<Totals> {
		None
	}
}

pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
	fn emit(&self, _event: Event) {}
}

/// Logs every event and keeps running totals per event kind.
#[derive(Debug, Default)]
pub struct TracingTelemetry {
	started: AtomicU64,
	requests: AtomicU64,
	bytes: AtomicU64,
	errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
	pub started: u64,
	pub requests: u64,
	pub bytes: u64,
	pub errors: u64,
}

impl Telemetry for TracingTelemetry {
	fn emit(&self, event: Event) {
		match event {
			Event::Started => self.started.fetch_add(1, Ordering::Relaxed),
			Event::Request => self.requests.fetch_add(1, Ordering::Relaxed),
			Event::Bytes(count) => self.bytes.fetch_add(count, Ordering::Relaxed),
			Event::Error => self.errors.fetch_add(1, Ordering::Relaxed),
		};

		match event {
			Event::Bytes(count) => debug!(event = %event, value = count, "Recorded telemetry event"),
			_ => debug!(event = %event, "Recorded telemetry event"),
		}
	}

	fn totals(&self) -> Option<Totals> {
		Some(Totals {
			started: self.started.load(Ordering::Relaxed),
			requests: self.requests.load(Ordering::Relaxed),
			bytes: self.bytes.load(Ordering::Relaxed),
			errors: self.errors.load(Ordering::Relaxed),
		})
	}
}

pub fn from_config(enabled: bool) -> Arc<dyn Telemetry> {
	if enabled {
		Arc::new(TracingTelemetry::default())
	} else {
		Arc::new(NoopTelemetry)
	}
}

/// Keeps every emitted event in order.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingTelemetry(std::sync::Mutex<Vec<Event>>);

#[cfg(test)]
impl RecordingTelemetry {
	pub fn events(&self) -> Vec<Event> {
		self.0.lock().unwrap().clone()
	}
}

#[cfg(test)]
impl Telemetry for RecordingTelemetry {
	fn emit(&self, event: Event) {
		self.0.lock().unwrap().push(event);
	}
}
