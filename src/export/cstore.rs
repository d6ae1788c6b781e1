use super::diagnostics::MessageDump;
use super::fetch::ObjectFetcher;
use super::resolver::IdentifierResolver;
use super::{ExportError, Forwarder};
use crate::backend::dimse::{next_message_id, DimsePeer, StoreRequest, StoreTransport};
use crate::notification::Notification;
use crate::telemetry::{Event, Telemetry};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument};

/// Exports instances to a DIMSE peer.
///
/// The SOP Class UID and SOP Instance UID are resolved from the metadata service before the
/// instance is opened, because the C-STORE command set must carry both.
pub struct DimseForwarder {
	resolver: IdentifierResolver,
	fetcher: ObjectFetcher,
	transport: Arc<dyn StoreTransport>,
	peer: DimsePeer,
	dump: Option<MessageDump>,
	telemetry: Arc<dyn Telemetry>,
}

impl DimseForwarder {
	pub fn new(
		resolver: IdentifierResolver,
		fetcher: ObjectFetcher,
		transport: Arc<dyn StoreTransport>,
		peer: DimsePeer,
		telemetry: Arc<dyn Telemetry>,
	) -> Self {
		Self {
			resolver,
			fetcher,
			transport,
			peer,
			dump: None,
			telemetry,
		}
	}

	/// Writes every notification next to its message id into the given dump.
	#[must_use]
	pub fn with_dump(mut self, dump: MessageDump) -> Self {
		self.dump = Some(dump);
		self
	}
}

#[async_trait]
impl Forwarder for DimseForwarder {
	#[instrument(skip_all, fields(peer = %self.peer, locator = %notification.locator))]
	async fn send(&self, notification: &Notification) -> Result<(), ExportError> {
		let identity = self.resolver.resolve(&notification.locator).await?;

		let message_id = next_message_id();
		if let Some(dump) = &self.dump {
			dump.spawn(message_id, notification);
		}

		let stream = self.fetcher.open(&notification.locator).await?;
		let stats = stream.stats();

		let request = StoreRequest {
			message_id,
			sop_class_uid: identity.sop_class_uid,
			sop_instance_uid: identity.sop_instance_uid,
		};
		let result = self.transport.store(&self.peer, request, stream).await;
		self.telemetry.emit(Event::Bytes(stats.bytes_read()));

		match result {
			Ok(()) => {
				info!(message_id, bytes = stats.bytes_read(), "Exported instance");
				Ok(())
			}
			Err(err) if stats.source_failed() => Err(ExportError::Retrieval {
				locator: notification.locator.to_string(),
				source: err.into(),
			}),
			Err(err) => Err(ExportError::Forwarding {
				destination: self.peer.to_string(),
				source: err.into(),
			}),
		}
	}
}
