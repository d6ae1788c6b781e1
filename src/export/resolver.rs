use super::ExportError;
use crate::notification::RetrievalLocator;
use crate::types::UI;
use async_trait::async_trait;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Formats a tag the way DICOM JSON and QIDO-RS query parameters expect it, e.g. `00080018`.
pub fn tag_key(tag: Tag) -> String {
	format!("{:04X}{:04X}", tag.group(), tag.element())
}

/// Instance level QIDO-RS query derived from a WADO-RS locator.
/// Renders as the "Series' Instances" search resource, e.g. `studies/1/series/2/instances?00080018=3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataQuery {
	/// The series the instance belongs to, e.g. `studies/1/series/2`.
	pub target: String,
	/// Matching value for SOP Instance UID (0008,0018).
	pub sop_instance_uid: UI,
}

impl Display for MetadataQuery {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"{}/instances?{}={}",
			self.target,
			tag_key(tags::SOP_INSTANCE_UID),
			self.sop_instance_uid
		)
	}
}

/// One entry of a DICOM JSON response.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_F.2.2.html>
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JsonAttribute {
	pub vr: String,
	#[serde(rename = "Value", default)]
	pub value: Vec<serde_json::Value>,
}

/// A single QIDO-RS result, keyed by tag.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct MetadataRecord(HashMap<String, JsonAttribute>);

impl MetadataRecord {
	/// Returns the first value of an attribute, if it is a string.
	pub fn value(&self, tag: Tag) -> Option<&str> {
		let key = tag_key(tag);
		self.0
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(&key))
			.and_then(|(_, attribute)| attribute.value.first())
			.and_then(serde_json::Value::as_str)
	}
}

impl<V: Into<String>> FromIterator<(Tag, V)> for MetadataRecord {
	fn from_iter<T: IntoIterator<Item = (Tag, V)>>(iter: T) -> Self {
		Self(
			iter.into_iter()
				.map(|(tag, value)| {
					let attribute = JsonAttribute {
						vr: String::from("UI"),
						value: vec![serde_json::Value::String(value.into())],
					};
					(tag_key(tag), attribute)
				})
				.collect(),
		)
	}
}

/// SOP Class UID and SOP Instance UID of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectIdentity {
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
}

/// Source of instance metadata (QIDO-RS).
#[async_trait]
pub trait MetadataService: Send + Sync {
	async fn query(&self, query: &MetadataQuery) -> anyhow::Result<Vec<MetadataRecord>>;
}

/// Derives the metadata query for a locator.
/// The series enclosing the instance becomes the query target and the last segment the
/// SOP Instance UID filter.
pub fn resolve_query(locator: &RetrievalLocator) -> Result<MetadataQuery, ExportError> {
	let malformed = || ExportError::MalformedLocator {
		locator: locator.to_string(),
	};

	let path = locator.as_str().trim_end_matches('/');
	let (parent, leaf) = path.rsplit_once('/').ok_or_else(malformed)?;
	let parent = parent.trim_end_matches('/');
	let series = match parent.rsplit_once('/') {
		Some((series, "instances")) => series.trim_end_matches('/'),
		None if parent == "instances" => "",
		_ => parent,
	};

	if series.is_empty() || leaf.is_empty() {
		return Err(malformed());
	}

	Ok(MetadataQuery {
		target: series.to_owned(),
		sop_instance_uid: UI::from(leaf),
	})
}

/// Extracts the identity from a query result, which must consist of exactly one record.
pub fn resolve_identity(records: &[MetadataRecord]) -> Result<ObjectIdentity, ExportError> {
	let [record] = records else {
		return Err(ExportError::AmbiguousMetadata {
			count: records.len(),
		});
	};

	let sop_class_uid = record
		.value(tags::SOP_CLASS_UID)
		.ok_or(ExportError::MissingField {
			field: "SOPClassUID (0008,0016)",
		})?;
	let sop_instance_uid = record
		.value(tags::SOP_INSTANCE_UID)
		.ok_or(ExportError::MissingField {
			field: "SOPInstanceUID (0008,0018)",
		})?;

	Ok(ObjectIdentity {
		sop_class_uid: UI::from(sop_class_uid),
		sop_instance_uid: UI::from(sop_instance_uid),
	})
}

pub struct IdentifierResolver {
	metadata: Arc<dyn MetadataService>,
}

impl IdentifierResolver {
	pub fn new(metadata: Arc<dyn MetadataService>) -> Self {
		Self { metadata }
	}

	#[instrument(skip_all, fields(locator = %locator))]
	pub async fn resolve(&self, locator: &RetrievalLocator) -> Result<ObjectIdentity, ExportError> {
		let query = resolve_query(locator)?;
		debug!(%query, "Querying instance metadata");

		let records =
			self.metadata
				.query(&query)
				.await
				.map_err(|source| ExportError::Retrieval {
					locator: locator.to_string(),
					source,
				})?;

		resolve_identity(&records)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::export::testing::StaticMetadata;

	const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";

	fn record(sop_class_uid: &str, sop_instance_uid: &str) -> MetadataRecord {
		MetadataRecord::from_iter([
			(tags::SOP_CLASS_UID, sop_class_uid),
			(tags::SOP_INSTANCE_UID, sop_instance_uid),
		])
	}

	#[test]
	fn query_targets_parent_series() {
		let locator = RetrievalLocator::new("studies/1.2/series/3.4/instances/5.6");
		let query = resolve_query(&locator).unwrap();

		assert_eq!(query.target, "studies/1.2/series/3.4");
		assert_eq!(query.sop_instance_uid, "5.6");
		assert_eq!(
			query.to_string(),
			"studies/1.2/series/3.4/instances?00080018=5.6"
		);
	}

	#[test]
	fn query_keeps_absolute_prefix() {
		let locator = RetrievalLocator::new(
			"https://pacs.example.com/dicom-web/studies/1/series/2/instances/3/",
		);
		let query = resolve_query(&locator).unwrap();

		assert_eq!(
			query.target,
			"https://pacs.example.com/dicom-web/studies/1/series/2"
		);
		assert_eq!(query.sop_instance_uid, "3");
	}

	#[test]
	fn query_rejects_locator_without_parent() {
		for locator in [
			"3",
			"",
			"/3",
			"/",
			"/instances/3",
			"instances/3",
			"instances//3",
		] {
			let result = resolve_query(&RetrievalLocator::new(locator));
			assert!(
				matches!(result, Err(ExportError::MalformedLocator { .. })),
				"{locator:?} should be malformed"
			);
		}
	}

	#[test]
	fn identity_from_single_record() {
		let identity = resolve_identity(&[record(SECONDARY_CAPTURE, "3")]).unwrap();

		assert_eq!(
			identity,
			ObjectIdentity {
				sop_class_uid: UI::from(SECONDARY_CAPTURE),
				sop_instance_uid: UI::from("3"),
			}
		);
	}

	#[test]
	fn identity_requires_exactly_one_record() {
		let none = resolve_identity(&[]);
		let two = resolve_identity(&[record(SECONDARY_CAPTURE, "3"), record(SECONDARY_CAPTURE, "4")]);

		assert!(matches!(none, Err(ExportError::AmbiguousMetadata { count: 0 })));
		assert!(matches!(two, Err(ExportError::AmbiguousMetadata { count: 2 })));
	}

	#[test]
	fn identity_requires_both_fields() {
		let record = MetadataRecord::from_iter([(tags::SOP_INSTANCE_UID, "3")]);

		assert!(matches!(
			resolve_identity(&[record]),
			Err(ExportError::MissingField { .. })
		));
	}

	#[test]
	fn record_from_dicom_json() {
		let json = r#"[{
			"00080016": { "vr": "UI", "Value": ["1.2.840.10008.5.1.4.1.1.7"] },
			"00080018": { "vr": "UI", "Value": ["3"] },
			"00100010": { "vr": "PN" }
		}]"#;
		let records: Vec<MetadataRecord> = serde_json::from_str(json).unwrap();

		assert_eq!(records.len(), 1);
		assert_eq!(records[0].value(tags::SOP_CLASS_UID), Some(SECONDARY_CAPTURE));
		assert_eq!(records[0].value(tags::PATIENT_NAME), None);
	}

	#[tokio::test]
	async fn resolver_queries_metadata_service() {
		let metadata = Arc::new(StaticMetadata::new(vec![record(SECONDARY_CAPTURE, "3")]));
		let resolver = IdentifierResolver::new(metadata.clone());

		let identity = resolver
			.resolve(&RetrievalLocator::new("/studies/1/series/2/instances/3"))
			.await
			.unwrap();

		assert_eq!(identity.sop_instance_uid, "3");
		assert_eq!(
			*metadata.queries.lock().unwrap(),
			vec![String::from("/studies/1/series/2/instances?00080018=3")]
		);
	}
}
