use crate::backend::dicomweb::{DicomWebClient, DicomWebError};
use crate::backend::dimse::{DimsePeer, StoreServiceClassUser};
use crate::config::{AppConfig, DicomWebConfig, DimsePeerConfig, ExportConfig, StowPeerConfig};
use crate::export::diagnostics::MessageDump;
use crate::export::fetch::ObjectFetcher;
use crate::export::resolver::IdentifierResolver;
use crate::export::{DimseForwarder, Forwarder, StowForwarder};
use crate::telemetry::Telemetry;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AssemblyError {
	#[error("Both [export.dimse] and [export.dicomweb] are configured, but only one destination is supported")]
	ConflictingTargets,
	#[error("No destination configured, either [export.dimse] or [export.dicomweb] is required")]
	NoTarget,
	#[error("Failed to create DICOMweb client: {0}")]
	Client(#[from] DicomWebError),
}

/// The single destination every notification is forwarded to.
#[derive(Debug, Clone)]
pub enum ExportTarget<'a> {
	Dimse(&'a DimsePeerConfig),
	DicomWeb(&'a StowPeerConfig),
}

impl<'a> ExportTarget<'a> {
	pub fn select(config: &'a ExportConfig) -> Result<Self, AssemblyError> {
		match (&config.dimse, &config.dicomweb) {
			(Some(_), Some(_)) => Err(AssemblyError::ConflictingTargets),
			(Some(dimse), None) => Ok(Self::Dimse(dimse)),
			(None, Some(dicomweb)) => Ok(Self::DicomWeb(dicomweb)),
			(None, None) => Err(AssemblyError::NoTarget),
		}
	}
}

/// Builds the forwarder for the configured destination.
///
/// The destination is validated before any client is created.
pub fn assemble(
	config: &AppConfig,
	telemetry: Arc<dyn Telemetry>,
) -> Result<Arc<dyn Forwarder>, AssemblyError> {
	let target = ExportTarget::select(&config.export)?;
	let source = Arc::new(DicomWebClient::new(&config.source)?);
	let fetcher = ObjectFetcher::new(source.clone());

	let forwarder: Arc<dyn Forwarder> = match target {
		ExportTarget::Dimse(peer_config) => {
			let peer = DimsePeer::from(peer_config);
			info!(peer = %peer, "Exporting via C-STORE");

			let transport = StoreServiceClassUser::new(
				peer_config.calling_aet.clone(),
				Duration::from_millis(peer_config.timeout),
				peer_config.priority,
			);
			let forwarder = DimseForwarder::new(
				IdentifierResolver::new(source),
				fetcher,
				Arc::new(transport),
				peer,
				telemetry,
			);
			match &config.export.shared_folder {
				Some(folder) => Arc::new(forwarder.with_dump(MessageDump::new(folder.clone()))),
				None => Arc::new(forwarder),
			}
		}
		ExportTarget::DicomWeb(peer_config) => {
			let stow = DicomWebClient::new(&DicomWebConfig::from(peer_config))?;
			let destination = stow.address().to_owned();
			info!(destination, "Exporting via STOW-RS");

			Arc::new(StowForwarder::new(
				fetcher,
				Arc::new(stow),
				destination,
				telemetry,
			))
		}
	};

	Ok(forwarder)
}
