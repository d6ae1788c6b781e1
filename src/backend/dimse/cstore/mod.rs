pub mod storescu;

use crate::backend::dimse::{StoreError, DATA_SET_EXISTS};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;

/// C-STORE-RQ command set. The data set is streamed separately.
#[derive(Debug)]
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub message_id: US,
	pub priority: US,
}

impl From<&CompositeStoreRequest> for InMemDicomObject {
	#[rustfmt::skip]
	fn from(request: &CompositeStoreRequest) -> Self {
		Self::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid.as_str())),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid.as_str())),
		])
	}
}

/// C-STORE-RSP
#[derive(Debug)]
pub struct CompositeStoreResponse {
	pub message_id_being_responded_to: Option<US>,
	pub status: US,
}

impl TryFrom<&InMemDicomObject> for CompositeStoreResponse {
	type Error = StoreError;

	fn try_from(command: &InMemDicomObject) -> Result<Self, Self::Error> {
		let command_field = command
			.get(tags::COMMAND_FIELD)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.ok_or(StoreError::MissingAttribute(tags::COMMAND_FIELD))?;
		if command_field != COMMAND_FIELD_COMPOSITE_STORE_RESPONSE {
			return Err(StoreError::UnexpectedCommand(command_field));
		}

		let status = command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.ok_or(StoreError::MissingAttribute(tags::STATUS))?;

		let message_id_being_responded_to = command
			.get(tags::MESSAGE_ID_BEING_RESPONDED_TO)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok);

		Ok(Self {
			message_id_being_responded_to,
			status,
		})
	}
}
