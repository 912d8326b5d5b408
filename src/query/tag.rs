use crate::tags::path::{format_tag, keyword};
use crate::tags::ExtendedTagEntry;
use crate::types::QueryTagLevel;
use crate::values::IndexDataType;
use dicom::core::{Tag, VR};
use dicom::dictionary_std::tags;

/// An attribute that is indexed by default in a column of the hierarchy tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CoreTag {
	pub tag: Tag,
	pub vr: VR,
	pub level: QueryTagLevel,
	/// The column of the `study`, `series` or `instance` table holding the value.
	pub column: &'static str,
}

const fn core(tag: Tag, vr: VR, level: QueryTagLevel, column: &'static str) -> CoreTag {
	CoreTag {
		tag,
		vr,
		level,
		column,
	}
}

/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.3.3.html#table_10.6.3-3>
pub const CORE_QUERY_TAGS: &[CoreTag] = &[
	core(tags::STUDY_INSTANCE_UID, VR::UI, QueryTagLevel::Study, "study_instance_uid"),
	core(tags::STUDY_DATE, VR::DA, QueryTagLevel::Study, "study_date"),
	core(tags::STUDY_DESCRIPTION, VR::LO, QueryTagLevel::Study, "study_description"),
	core(tags::ACCESSION_NUMBER, VR::SH, QueryTagLevel::Study, "accession_number"),
	core(tags::PATIENT_ID, VR::LO, QueryTagLevel::Study, "patient_id"),
	core(tags::PATIENT_NAME, VR::PN, QueryTagLevel::Study, "patient_name"),
	core(tags::REFERRING_PHYSICIAN_NAME, VR::PN, QueryTagLevel::Study, "referring_physician_name"),
	core(tags::PATIENT_BIRTH_DATE, VR::DA, QueryTagLevel::Study, "patient_birth_date"),
	core(tags::SERIES_INSTANCE_UID, VR::UI, QueryTagLevel::Series, "series_instance_uid"),
	core(tags::MODALITY, VR::CS, QueryTagLevel::Series, "modality"),
	core(
		tags::PERFORMED_PROCEDURE_STEP_START_DATE,
		VR::DA,
		QueryTagLevel::Series,
		"performed_procedure_step_start_date",
	),
	core(tags::MANUFACTURER_MODEL_NAME, VR::LO, QueryTagLevel::Series, "manufacturer_model_name"),
	core(tags::SOP_INSTANCE_UID, VR::UI, QueryTagLevel::Instance, "sop_instance_uid"),
	core(tags::SOP_CLASS_UID, VR::UI, QueryTagLevel::Instance, "sop_class_uid"),
];

/// Attributes returned for every matched study.
///
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.3.3.html#table_10.6.3-3>
pub const STUDY_RESULT_TAGS: &[Tag] = &[
	tags::SPECIFIC_CHARACTER_SET,
	tags::STUDY_DATE,
	tags::STUDY_TIME,
	tags::ACCESSION_NUMBER,
	tags::REFERRING_PHYSICIAN_NAME,
	tags::TIMEZONE_OFFSET_FROM_UTC,
	tags::PATIENT_NAME,
	tags::PATIENT_ID,
	tags::PATIENT_BIRTH_DATE,
	tags::PATIENT_SEX,
	tags::STUDY_INSTANCE_UID,
	tags::STUDY_ID,
];

/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.3.3.2.html>
pub const SERIES_RESULT_TAGS: &[Tag] = &[
	tags::MODALITY,
	tags::SERIES_DESCRIPTION,
	tags::SERIES_INSTANCE_UID,
	tags::SERIES_NUMBER,
	tags::PERFORMED_PROCEDURE_STEP_START_DATE,
	tags::PERFORMED_PROCEDURE_STEP_START_TIME,
	tags::REQUEST_ATTRIBUTES_SEQUENCE,
];

/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.3.3.3.html>
pub const INSTANCE_RESULT_TAGS: &[Tag] = &[
	tags::SOP_CLASS_UID,
	tags::SOP_INSTANCE_UID,
	tags::INSTANCE_NUMBER,
	tags::ROWS,
	tags::COLUMNS,
	tags::BITS_ALLOCATED,
	tags::NUMBER_OF_FRAMES,
];

/// Further attributes whose home level is known, beyond the core and result tags.
const STUDY_MODULE_TAGS: &[Tag] = &[
	tags::PATIENT_AGE,
	tags::PATIENT_SIZE,
	tags::PATIENT_WEIGHT,
	tags::OTHER_PATIENT_NAMES,
	tags::ADMITTING_DIAGNOSES_DESCRIPTION,
	tags::NAME_OF_PHYSICIANS_READING_STUDY,
];

const SERIES_MODULE_TAGS: &[Tag] = &[
	tags::SERIES_DATE,
	tags::SERIES_TIME,
	tags::BODY_PART_EXAMINED,
	tags::PROTOCOL_NAME,
	tags::LATERALITY,
	tags::MANUFACTURER,
	tags::STATION_NAME,
	tags::INSTITUTION_NAME,
];

pub fn core_tag(tag: Tag) -> Option<&'static CoreTag> {
	CORE_QUERY_TAGS.iter().find(|core| core.tag == tag)
}

/// Returns the default result attributes of a level.
pub const fn result_tags(level: QueryTagLevel) -> &'static [Tag] {
	match level {
		QueryTagLevel::Study => STUDY_RESULT_TAGS,
		QueryTagLevel::Series => SERIES_RESULT_TAGS,
		QueryTagLevel::Instance => INSTANCE_RESULT_TAGS,
	}
}

/// Returns the level a standard attribute lives at, if known.
pub fn known_level(tag: Tag) -> Option<QueryTagLevel> {
	if let Some(core) = core_tag(tag) {
		return Some(core.level);
	}
	let tables: [(&[Tag], QueryTagLevel); 5] = [
		(STUDY_RESULT_TAGS, QueryTagLevel::Study),
		(STUDY_MODULE_TAGS, QueryTagLevel::Study),
		(SERIES_RESULT_TAGS, QueryTagLevel::Series),
		(SERIES_MODULE_TAGS, QueryTagLevel::Series),
		(INSTANCE_RESULT_TAGS, QueryTagLevel::Instance),
	];
	tables
		.into_iter()
		.find(|(tags, _)| tags.contains(&tag))
		.map(|(_, level)| level)
}

/// Where the values of a [`QueryTag`] are stored.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryTagSource {
	Core { column: &'static str },
	Extended(ExtendedTagEntry),
}

/// A queryable attribute, either indexed by default or registered as extended query tag.
///
/// Query tags are derived from a catalog snapshot for the duration of a single operation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTag {
	pub tag: Tag,
	pub vr: VR,
	pub level: QueryTagLevel,
	pub source: QueryTagSource,
}

impl QueryTag {
	pub const fn from_core(core: &CoreTag) -> Self {
		Self {
			tag: core.tag,
			vr: core.vr,
			level: core.level,
			source: QueryTagSource::Core {
				column: core.column,
			},
		}
	}

	pub fn from_extended(entry: ExtendedTagEntry) -> Self {
		Self {
			tag: entry.tag,
			vr: entry.vr,
			level: entry.level,
			source: QueryTagSource::Extended(entry),
		}
	}

	pub const fn is_extended(&self) -> bool {
		matches!(self.source, QueryTagSource::Extended(_))
	}

	pub const fn extended_entry(&self) -> Option<&ExtendedTagEntry> {
		match &self.source {
			QueryTagSource::Extended(entry) => Some(entry),
			QueryTagSource::Core { .. } => None,
		}
	}

	pub const fn data_type(&self) -> Option<IndexDataType> {
		IndexDataType::from_vr(self.vr)
	}

	/// A human-readable name: the keyword of standard attributes, the path otherwise.
	pub fn name(&self) -> String {
		keyword(self.tag).map_or_else(|| format_tag(self.tag), String::from)
	}
}

/// Returns all core query tags.
pub fn core_query_tags() -> Vec<QueryTag> {
	CORE_QUERY_TAGS.iter().map(QueryTag::from_core).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn every_core_tag_is_indexable() {
		for core in CORE_QUERY_TAGS {
			assert!(IndexDataType::from_vr(core.vr).is_some(), "{:?}", core.tag);
		}
	}

	#[test]
	fn known_levels() {
		assert_eq!(known_level(tags::MODALITY), Some(QueryTagLevel::Series));
		assert_eq!(known_level(tags::PATIENT_AGE), Some(QueryTagLevel::Study));
		assert_eq!(known_level(tags::ROWS), Some(QueryTagLevel::Instance));
		assert_eq!(known_level(tags::SLICE_THICKNESS), None);
	}

	#[test]
	fn name_prefers_keyword() {
		let query_tag = QueryTag::from_core(&CORE_QUERY_TAGS[0]);
		assert_eq!(query_tag.name(), "StudyInstanceUID");
		assert!(!query_tag.is_extended());
	}
}
