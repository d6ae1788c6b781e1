use crate::backend::dimse::cstore::{CompositeStoreRequest, CompositeStoreResponse};
use crate::backend::dimse::{DimsePeer, StatusType, StoreError, StoreRequest, StoreTransport};
use crate::export::fetch::ObjectStream;
use crate::types::{Priority, AE, UI, US};
use async_trait::async_trait;
use dicom::object::{FileMetaTable, InMemDicomObject};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::io::Read;
use std::time::Duration;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

/// Length of the preamble that precedes the `DICM` prefix of a DICOM file.
const PREAMBLE_LENGTH: usize = 128;

/// Service class user for the Storage SOP classes.
///
/// Every store opens a new association that proposes a single presentation context: the SOP class
/// of the instance in the transfer syntax of the file. The data set is then copied from the
/// stream into P-DATA fragments as it arrives.
pub struct StoreServiceClassUser {
	calling_aet: AE,
	timeout: Duration,
	priority: Priority,
}

impl StoreServiceClassUser {
	pub const fn new(calling_aet: AE, timeout: Duration, priority: Priority) -> Self {
		Self {
			calling_aet,
			timeout,
			priority,
		}
	}
}

#[async_trait]
impl StoreTransport for StoreServiceClassUser {
	async fn store(
		&self,
		peer: &DimsePeer,
		request: StoreRequest,
		stream: ObjectStream,
	) -> Result<(), StoreError> {
		// dicom-ul only supports blocking IO, so the whole exchange runs on a blocking thread
		// that pulls from the async stream through the bridge.
		let reader = SyncIoBridge::new(stream);
		let options = AssociationOptions {
			calling_aet: self.calling_aet.clone(),
			peer: peer.clone(),
			timeout: self.timeout,
			priority: self.priority,
		};
		let span = info_span!(
			"STORE-SCU",
			backend_uuid = Uuid::new_v4().to_string(),
			peer = %peer,
			message_id = request.message_id,
		);

		tokio::task::spawn_blocking(move || span.in_scope(|| store_blocking(&options, &request, reader)))
			.await?
	}
}

struct AssociationOptions {
	calling_aet: AE,
	peer: DimsePeer,
	timeout: Duration,
	priority: Priority,
}

/// Reads the preamble and the file meta group of a DICOM file, leaving the reader at the
/// first byte of the data set.
pub fn read_file_meta(reader: &mut impl Read) -> Result<FileMetaTable, StoreError> {
	let mut preamble = [0u8; PREAMBLE_LENGTH];
	reader.read_exact(&mut preamble)?;
	Ok(FileMetaTable::from_reader(reader)?)
}

fn store_blocking(
	options: &AssociationOptions,
	request: &StoreRequest,
	mut reader: impl Read,
) -> Result<(), StoreError> {
	let meta = read_file_meta(&mut reader)?;
	let transfer_syntax = UI::from(meta.transfer_syntax());
	if meta.media_storage_sop_instance_uid() != request.sop_instance_uid {
		warn!(
			file_sop_instance_uid = meta.media_storage_sop_instance_uid(),
			sop_instance_uid = request.sop_instance_uid,
			"SOP Instance UID of the file differs from the metadata"
		);
	}

	let mut association = dicom::ul::ClientAssociationOptions::new()
		.calling_ae_title(options.calling_aet.as_str())
		.called_ae_title(options.peer.aet.as_str())
		.with_presentation_context(request.sop_class_uid.as_str(), vec![transfer_syntax.as_str()])
		.read_timeout(options.timeout)
		.write_timeout(options.timeout)
		.establish((options.peer.host.as_str(), options.peer.port))?;
	info!(transfer_syntax, "Established association");

	let presentation_context_id = association
		.presentation_contexts()
		.first()
		.map(|pctx| pctx.id)
		.ok_or_else(|| StoreError::NoPresentationContext {
			sop_class_uid: request.sop_class_uid.clone(),
			transfer_syntax: transfer_syntax.clone(),
		})?;

	let command = CompositeStoreRequest {
		affected_sop_class_uid: request.sop_class_uid.clone(),
		affected_sop_instance_uid: request.sop_instance_uid.clone(),
		message_id: request.message_id,
		priority: options.priority as US,
	};
	let mut command_buf = Vec::new();
	InMemDicomObject::from(&command)
		.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;
	association.send(&Pdu::PData {
		data: vec![PDataValue {
			value_type: PDataValueType::Command,
			presentation_context_id,
			is_last: true,
			data: command_buf,
		}],
	})?;

	let mut writer = association.send_pdata(presentation_context_id);
	let written = std::io::copy(&mut reader, &mut writer)?;
	writer.finish()?;
	debug!(written, "Sent data set");

	let status = loop {
		match association.receive()? {
			Pdu::PData { data } => {
				let Some(pdv) = data
					.into_iter()
					.find(|pdv| pdv.value_type == PDataValueType::Command)
				else {
					continue;
				};
				let command = InMemDicomObject::read_dataset_with_ts(
					pdv.data.as_slice(),
					&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
				)?;
				let response = CompositeStoreResponse::try_from(&command)?;
				if response
					.message_id_being_responded_to
					.is_some_and(|id| id != request.message_id)
				{
					warn!(
						response_message_id = response.message_id_being_responded_to,
						"Response refers to another message"
					);
				}
				break response.status;
			}
			pdu => {
				let _ = association.abort();
				return Err(StoreError::UnexpectedPdu(Box::new(pdu)));
			}
		}
	};

	if let Err(err) = association.release() {
		debug!("Failed to release association: {err}");
	}

	match StatusType::try_from(status).unwrap_or(StatusType::Failure) {
		StatusType::Success => {
			info!("Stored instance");
			Ok(())
		}
		StatusType::Warning => {
			warn!(status, "Stored instance with warning");
			Ok(())
		}
		_ => Err(StoreError::Status(status)),
	}
}
