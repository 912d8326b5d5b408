use dicom::core::{DataDictionary, Tag, VR};
use dicom::object::StandardDataDictionary;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
	#[error("the attribute path is empty")]
	Empty,
	#[error("'{0}' is neither a keyword nor a tag of the form GGGGEEEE")]
	Invalid(String),
	#[error("'{0}' refers to an attribute nested in a sequence")]
	Nested(String),
}

/// Parses an attribute path, given either as a keyword (`PatientAge`) or as eight hexadecimal
/// digits (`00101010`).
///
/// Paths into sequences (`00400275.00321060`) are parsed, but rejected as [`PathError::Nested`].
pub fn parse_tag_path(path: &str) -> Result<Tag, PathError> {
	let path = path.trim();
	if path.is_empty() {
		return Err(PathError::Empty);
	}

	let segments = path
		.split('.')
		.map(|segment| parse_segment(segment).ok_or_else(|| PathError::Invalid(path.to_owned())))
		.collect::<Result<Vec<_>, _>>()?;

	match segments.as_slice() {
		[tag] => Ok(*tag),
		_ => Err(PathError::Nested(path.to_owned())),
	}
}

fn parse_segment(segment: &str) -> Option<Tag> {
	parse_hex_tag(segment).or_else(|| {
		StandardDataDictionary
			.by_name(segment)
			.map(|entry| entry.tag.inner())
	})
}

/// Parses a tag given as eight hexadecimal digits.
pub fn parse_hex_tag(value: &str) -> Option<Tag> {
	if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
		return None;
	}
	let group = u16::from_str_radix(&value[..4], 16).ok()?;
	let element = u16::from_str_radix(&value[4..], 16).ok()?;
	Some(Tag(group, element))
}

/// Formats a tag as its canonical path (`GGGGEEEE`, upper case).
pub fn format_tag(tag: Tag) -> String {
	format!("{:04X}{:04X}", tag.group(), tag.element())
}

/// Returns the dictionary keyword of a standard attribute.
pub fn keyword(tag: Tag) -> Option<&'static str> {
	StandardDataDictionary.by_tag(tag).map(|entry| entry.alias)
}

/// Returns the value representation the dictionary expects for a standard attribute.
pub fn dictionary_vr(tag: Tag) -> Option<VR> {
	StandardDataDictionary
		.by_tag(tag)
		.map(|entry| entry.vr.relaxed())
}

pub fn is_private(tag: Tag) -> bool {
	tag.group() % 2 == 1
}

/// Whether the tag is a private creator element, e.g. `(0009,0010)`.
pub fn is_private_creator(tag: Tag) -> bool {
	is_private(tag) && tag.element() >= 0x0010 && tag.element() <= 0x00FF
}

/// Returns the private creator element reserving the block of a private data element.
pub fn private_creator_of(tag: Tag) -> Option<Tag> {
	if is_private(tag) && tag.element() >= 0x1000 {
		Some(Tag(tag.group(), tag.element() >> 8))
	} else {
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::dictionary_std::tags;

	#[test]
	fn parse_keyword() {
		assert_eq!(parse_tag_path("PatientAge"), Ok(tags::PATIENT_AGE));
	}

	#[test]
	fn parse_hex_path() {
		assert_eq!(parse_tag_path("00101010"), Ok(tags::PATIENT_AGE));
		assert_eq!(parse_tag_path("0009101a"), Ok(Tag(0x0009, 0x101A)));
	}

	#[test]
	fn reject_invalid_paths() {
		assert_eq!(parse_tag_path(" "), Err(PathError::Empty));
		assert_eq!(
			parse_tag_path("NotAKeyword"),
			Err(PathError::Invalid(String::from("NotAKeyword")))
		);
		assert_eq!(
			parse_tag_path("0010101"),
			Err(PathError::Invalid(String::from("0010101")))
		);
	}

	#[test]
	fn reject_nested_paths() {
		assert_eq!(
			parse_tag_path("00400275.00321060"),
			Err(PathError::Nested(String::from("00400275.00321060")))
		);
	}

	#[test]
	fn private_tags() {
		assert!(is_private_creator(Tag(0x0009, 0x0010)));
		assert!(!is_private_creator(Tag(0x0009, 0x1001)));
		assert_eq!(private_creator_of(Tag(0x0009, 0x1001)), Some(Tag(0x0009, 0x0010)));
		assert_eq!(private_creator_of(tags::PATIENT_AGE), None);
		assert_eq!(format_tag(Tag(0x0009, 0x101A)), "0009101A");
	}

	#[test]
	fn dictionary_lookups() {
		assert_eq!(keyword(tags::PATIENT_AGE), Some("PatientAge"));
		assert_eq!(dictionary_vr(tags::PATIENT_AGE), Some(VR::AS));
		assert_eq!(keyword(Tag(0x0009, 0x1001)), None);
	}
}
