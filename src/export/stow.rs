use super::fetch::{ObjectFetcher, ObjectStream};
use super::{ExportError, Forwarder};
use crate::notification::Notification;
use crate::telemetry::{Event, Telemetry};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument};

/// Destination of a STOW-RS upload.
#[async_trait]
pub trait StowClient: Send + Sync {
	/// Uploads a single instance. Returns once the destination accepted it.
	async fn upload(&self, stream: ObjectStream) -> anyhow::Result<()>;
}

/// Exports instances to a DICOMweb server.
/// Unlike C-STORE, STOW-RS needs no identifiers up front, so no metadata is queried.
pub struct StowForwarder {
	fetcher: ObjectFetcher,
	stow: Arc<dyn StowClient>,
	destination: String,
	telemetry: Arc<dyn Telemetry>,
}

impl StowForwarder {
	pub fn new(
		fetcher: ObjectFetcher,
		stow: Arc<dyn StowClient>,
		destination: String,
		telemetry: Arc<dyn Telemetry>,
	) -> Self {
		Self {
			fetcher,
			stow,
			destination,
			telemetry,
		}
	}
}

#[async_trait]
impl Forwarder for StowForwarder {
	#[instrument(skip_all, fields(destination = %self.destination, locator = %notification.locator))]
	async fn send(&self, notification: &Notification) -> Result<(), ExportError> {
		let stream = self.fetcher.open(&notification.locator).await?;
		let stats = stream.stats();

		let result = self.stow.upload(stream).await;
		self.telemetry.emit(Event::Bytes(stats.bytes_read()));

		match result {
			Ok(()) => {
				info!(bytes = stats.bytes_read(), "Exported instance");
				Ok(())
			}
			Err(source) if stats.source_failed() => Err(ExportError::Retrieval {
				locator: notification.locator.to_string(),
				source,
			}),
			Err(source) => Err(ExportError::Forwarding {
				destination: self.destination.clone(),
				source,
			}),
		}
	}
}
