use crate::store::StoreError;
use crate::tags::path::private_creator_of;
use crate::tags::ExtendedTagEntry;
use crate::types::InstanceIdentifier;
use crate::values::{IndexValue, ValueError};
use async_trait::async_trait;
use dicom::object::InMemDicomObject;
use thiserror::Error;

/// Writes extracted values into the index tables.
#[async_trait]
pub trait IndexWriter: Send + Sync {
	/// Stores `value` as the value of `tag` for `instance`.
	///
	/// The row is scoped by the hierarchy keys up to the level of the tag. An existing value
	/// written from a newer instance is kept, so writing the same instance twice is harmless.
	async fn upsert(
		&self,
		instance: &InstanceIdentifier,
		tag: &ExtendedTagEntry,
		value: &IndexValue,
	) -> Result<(), StoreError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
	#[error("failed to extract {path}: {source}")]
	Value {
		path: String,
		#[source]
		source: ValueError,
	},
}

/// Extracts the value of an extended query tag from an instance.
///
/// Returns `Ok(None)` if the instance does not carry the attribute, or if a private attribute
/// belongs to a different private creator.
pub fn extract_value(
	dataset: &InMemDicomObject,
	tag: &ExtendedTagEntry,
) -> Result<Option<IndexValue>, ExtractionError> {
	if let Some(expected) = tag.private_creator.as_deref() {
		let creator = private_creator_of(tag.tag)
			.and_then(|creator_tag| dataset.get(creator_tag))
			.and_then(|element| element.to_str().ok())
			.map(|creator| creator.trim_end_matches([' ', '\0']).to_owned());
		if creator.as_deref() != Some(expected) {
			return Ok(None);
		}
	}

	let Some(element) = dataset.get(tag.tag) else {
		return Ok(None);
	};
	IndexValue::from_element(element, tag.vr).map_err(|source| ExtractionError::Value {
		path: tag.path.clone(),
		source,
	})
}
