use crate::export::{ExportError, Fault, Forwarder};
use crate::notification::{AckReply, Decision, Notification};
use crate::telemetry::{Event, Telemetry};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Runs the export pipeline for each notification and settles it with the transport.
///
/// Every notification gets exactly one terminal reply: `ack` after a successful send and `nack`
/// otherwise, including when the forwarder panics.
#[derive(Clone)]
pub struct NotificationHandler {
	forwarder: Arc<dyn Forwarder>,
	telemetry: Arc<dyn Telemetry>,
}

impl NotificationHandler {
	pub fn new(forwarder: Arc<dyn Forwarder>, telemetry: Arc<dyn Telemetry>) -> Self {
		Self {
			forwarder,
			telemetry,
		}
	}

	#[instrument(skip_all, fields(delivery_id = %notification.delivery_id, locator = %notification.locator))]
	pub async fn handle(&self, notification: &Notification, reply: impl AckReply) -> Decision {
		self.telemetry.emit(Event::Request);

		let result = AssertUnwindSafe(self.forwarder.send(notification))
			.catch_unwind()
			.await
			.unwrap_or_else(|panic| {
				Err(ExportError::Internal {
					message: panic_message(&*panic),
				})
			});

		match result {
			Ok(()) => {
				reply.ack();
				info!("Acknowledged notification");
				Decision::Ack
			}
			Err(err) => {
				self.telemetry.emit(Event::Error);
				match err.fault() {
					Fault::Permanent => error!("Rejected malformed notification: {err}"),
					Fault::DataQuality => error!("Rejected notification with incomplete metadata: {err}"),
					Fault::Transient => warn!("Rejected notification: {err}"),
					Fault::Internal => error!("Rejected notification after internal error: {err}"),
				}
				reply.nack();
				Decision::Nack
			}
		}
	}
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
	if let Some(message) = panic.downcast_ref::<&str>() {
		(*message).to_owned()
	} else if let Some(message) = panic.downcast_ref::<String>() {
		message.clone()
	} else {
		String::from("forwarder panicked")
	}
}
