//! The export pipeline.
//! - The DIMSE exporter resolves SOP Class/Instance UIDs via QIDO-RS, retrieves the instance via
//!   WADO-RS and pushes it to a peer via C-STORE.
//! - The DICOMweb exporter retrieves the instance via WADO-RS and pushes it via STOW-RS.

pub mod cstore;
pub mod diagnostics;
pub mod fetch;
pub mod resolver;
pub mod stow;

use crate::notification::Notification;
use async_trait::async_trait;
use thiserror::Error;

pub use cstore::DimseForwarder;
pub use stow::StowForwarder;

/// Forwards the instance referenced by a notification to the configured destination.
#[async_trait]
pub trait Forwarder: Send + Sync {
	async fn send(&self, notification: &Notification) -> Result<(), ExportError>;
}

#[derive(Debug, Error)]
pub enum ExportError {
	#[error("Locator '{locator}' cannot be split into a parent path and an instance UID")]
	MalformedLocator { locator: String },
	#[error("Expected exactly one metadata record, but found {count}")]
	AmbiguousMetadata { count: usize },
	#[error("Metadata record lacks the mandatory attribute {field}")]
	MissingField { field: &'static str },
	#[error("Failed to retrieve {locator}: {source:#}")]
	Retrieval {
		locator: String,
		source: anyhow::Error,
	},
	#[error("Failed to forward to {destination}: {source:#}")]
	Forwarding {
		destination: String,
		source: anyhow::Error,
	},
	#[error("Unexpected failure: {message}")]
	Internal { message: String },
}

/// How a failed export should be treated by operators.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fault {
	/// The same notification will always fail.
	Permanent,
	/// The source holds incomplete data for the instance.
	DataQuality,
	/// Might succeed on redelivery.
	Transient,
	/// A bug.
	Internal,
}

impl ExportError {
	pub const fn fault(&self) -> Fault {
		match self {
			Self::MalformedLocator { .. } => Fault::Permanent,
			Self::MissingField { .. } => Fault::DataQuality,
			Self::AmbiguousMetadata { .. } | Self::Retrieval { .. } | Self::Forwarding { .. } => {
				Fault::Transient
			}
			Self::Internal { .. } => Fault::Internal,
		}
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fault_classification() {
		let malformed = ExportError::MalformedLocator {
			locator: String::from("3"),
		};
		let missing = ExportError::MissingField {
			field: "SOPClassUID",
		};
		let ambiguous = ExportError::AmbiguousMetadata { count: 0 };

		assert_eq!(malformed.fault(), Fault::Permanent);
		assert_eq!(missing.fault(), Fault::DataQuality);
		assert_eq!(ambiguous.fault(), Fault::Transient);
	}
}
