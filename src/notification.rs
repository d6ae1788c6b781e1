use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use tokio::sync::oneshot;

/// WADO-RS locator of exactly one instance, e.g. `studies/1/series/2/instances/3`.
///
/// The last path segment is the SOP Instance UID, the parent path addresses the series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetrievalLocator(String);

impl RetrievalLocator {
	pub fn new(locator: impl AsRef<str>) -> Self {
		Self(locator.as_ref().trim().to_owned())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Display for RetrievalLocator {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

/// One delivery of a "new instance available" event.
#[derive(Debug, Clone)]
pub struct Notification {
	pub locator: RetrievalLocator,
	/// Provider supplied metadata.
	pub attributes: HashMap<String, String>,
	/// Unique per delivery attempt, repeated on redelivery of the same event.
	pub delivery_id: String,
}

/// Terminal outcome of a notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Decision {
	/// The notification is consumed and will not be redelivered.
	Ack,
	/// The transport should redeliver the notification.
	Nack,
}

/// Reply handle of the notification transport.
///
/// Both methods consume the handle, so a notification can be settled only once.
pub trait AckReply: Send {
	fn ack(self);
	fn nack(self);
}

impl AckReply for oneshot::Sender<Decision> {
	fn ack(self) {
		// The receiving side may have given up waiting, nothing left to settle then.
		let _ = self.send(Decision::Ack);
	}

	fn nack(self) {
		let _ = self.send(Decision::Nack);
	}
}
