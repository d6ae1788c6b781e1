//! This module contains the DIMSE backend.
//! - Exports are implemented as a store service class user (C-STORE service) that streams
//!   the data set of a DICOM file to the peer without buffering it.
//!

pub mod cstore;

use crate::config::DimsePeerConfig;
use crate::export::fetch::ObjectStream;
use crate::types::{AE, UI, US};
use async_trait::async_trait;
use dicom::object::Tag;
use dicom::ul::Pdu;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU16, Ordering};
use thiserror::Error;

pub use cstore::storescu::StoreServiceClassUser;

/// Should be set for [`dicom::dictionary_std::tags::COMMAND_DATA_SET_TYPE`] if a DICOM message contains a data set.
/// This is the recommended value when creating new command sets for compatibility reasons.
pub const DATA_SET_EXISTS: US = 0x0102;

/// Status types supported by the DIMSE services.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF | 0xC000..=0xCFFF => {
				Ok(Self::Failure)
			}
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

/// Returns a new message id by incrementing a global counter.
/// Message ids only pair requests and responses within one association, so wrapping is fine.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(1);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}

/// Network address and title of a DIMSE peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimsePeer {
	pub aet: AE,
	pub host: String,
	pub port: u16,
}

impl Display for DimsePeer {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}@{}:{}", self.aet, self.host, self.port)
	}
}

impl From<&DimsePeerConfig> for DimsePeer {
	fn from(config: &DimsePeerConfig) -> Self {
		Self {
			aet: config.aet.clone(),
			host: config.host.clone(),
			port: config.port,
		}
	}
}

/// Identifiers needed to open a C-STORE operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
}

/// Pushes a single DICOM file to a peer.
///
/// On `Ok` the peer received the complete data set and confirmed it with a non-failure status.
#[async_trait]
pub trait StoreTransport: Send + Sync {
	async fn store(
		&self,
		peer: &DimsePeer,
		request: StoreRequest,
		stream: ObjectStream,
	) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("Failed to read from the instance stream: {0}")]
	Io(#[from] std::io::Error),
	#[error("Failed to read file meta group: {0}")]
	FileMeta(#[from] dicom::object::meta::Error),
	#[error("Association failed: {0}")]
	Association(#[from] dicom::ul::association::Error),
	#[error("Peer accepted no presentation context for {sop_class_uid} in transfer syntax {transfer_syntax}")]
	NoPresentationContext {
		sop_class_uid: UI,
		transfer_syntax: UI,
	},
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Box<Pdu>),
	#[error("Mandatory attribute is missing")]
	MissingAttribute(Tag),
	#[error("Expected C-STORE-RSP, received command {0:#06X}")]
	UnexpectedCommand(US),
	#[error("Peer responded with failure status {0:#06X}")]
	Status(US),
	#[error("Association thread failed: {0}")]
	Join(#[from] tokio::task::JoinError),
}
