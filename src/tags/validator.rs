use crate::query::tag::{core_tag, known_level};
use crate::tags::path::{
	dictionary_vr, format_tag, is_private, is_private_creator, parse_tag_path, PathError,
};
use crate::tags::{AddExtendedTagEntry, ExtendedTagEntry};
use crate::types::QueryTagLevel;
use crate::values::{parse_vr_code, vr_code, IndexDataType};
use dicom::core::{Tag, VR};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Value representations that can be queried, but not be indexed as extended query tag.
const NOT_INDEXABLE_VRS: &[VR] = &[
	VR::AT,
	VR::LT,
	VR::OB,
	VR::OD,
	VR::OF,
	VR::OL,
	VR::OV,
	VR::OW,
	VR::ST,
	VR::SV,
	VR::UC,
	VR::UN,
	VR::UR,
	VR::UT,
	VR::UV,
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
	#[error("no extended query tags were specified")]
	NoTags,
	#[error("the path '{path}' is invalid: {reason}")]
	InvalidPath { path: String, reason: String },
	#[error("the path '{path}' refers to an attribute nested in a sequence, which cannot be indexed")]
	NestedPath { path: String },
	#[error("the attribute '{path}' is not a known standard attribute")]
	UnknownAttribute { path: String },
	#[error("the attribute '{path}' is already indexed by default")]
	CoreTag { path: String },
	#[error("the private attribute '{path}' requires a value representation")]
	MissingVr { path: String },
	#[error("'{vr}' of attribute '{path}' is not a valid value representation")]
	InvalidVr { path: String, vr: String },
	#[error("the attribute '{path}' has value representation {expected}, not {actual}")]
	VrMismatch {
		path: String,
		expected: String,
		actual: String,
	},
	#[error("the attribute '{path}' is a sequence, which cannot be indexed")]
	SequenceVr { path: String },
	#[error("value representation {vr} of attribute '{path}' cannot be indexed")]
	NotIndexableVr { path: String, vr: String },
	#[error("value representation {vr} of attribute '{path}' is not supported")]
	UnsupportedVr { path: String, vr: String },
	#[error("the private attribute '{path}' requires a private creator")]
	MissingPrivateCreator { path: String },
	#[error("the private creator of attribute '{path}' exceeds {max} characters")]
	PrivateCreatorTooLong { path: String, max: usize },
	#[error("the attribute '{path}' must not have a private creator")]
	UnexpectedPrivateCreator { path: String },
	#[error("the attribute '{path}' requires a level")]
	MissingLevel { path: String },
	#[error("'{level}' of attribute '{path}' is not a valid level")]
	InvalidLevel { path: String, level: String },
	#[error("the attribute '{path}' lives at {expected} level and cannot be registered at {actual} level")]
	LevelMismatch {
		path: String,
		expected: QueryTagLevel,
		actual: QueryTagLevel,
	},
	#[error("the attribute '{path}' is specified more than once")]
	DuplicateInBatch { path: String },
	#[error("the attribute '{path}' is already registered")]
	AlreadyExists { path: String },
	#[error("registering {requested} more tags would exceed the limit of {limit} extended query tags")]
	LimitExceeded { limit: usize, requested: usize },
}

/// All violations found in a registration batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl Display for ValidationErrors {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
		write!(f, "{}", messages.join("; "))
	}
}

/// A registration request that passed validation, with its VR inferred if necessary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTag {
	pub tag: Tag,
	pub path: String,
	pub vr: VR,
	pub private_creator: Option<String>,
	pub level: QueryTagLevel,
}

#[derive(Debug, Clone)]
pub struct Validator {
	max_allowed_count: usize,
	max_private_creator_length: usize,
}

impl Validator {
	pub const fn new(max_allowed_count: usize, max_private_creator_length: usize) -> Self {
		Self {
			max_allowed_count,
			max_private_creator_length,
		}
	}

	/// Validates a registration batch against itself and the existing catalog.
	///
	/// Either every entry is accepted, or all violations are returned together.
	pub fn validate(
		&self,
		candidates: &[AddExtendedTagEntry],
		existing: &[ExtendedTagEntry],
	) -> Result<Vec<ValidatedTag>, ValidationErrors> {
		let mut errors = Vec::new();
		if candidates.is_empty() {
			return Err(ValidationErrors(vec![ValidationError::NoTags]));
		}

		let mut seen = HashSet::new();
		let mut validated = Vec::with_capacity(candidates.len());
		for candidate in candidates {
			let validated_tag = self.validate_entry(candidate, &mut errors);

			if let Ok(tag) = parse_tag_path(&candidate.path) {
				let path = format_tag(tag);
				let private_creator = normalized_private_creator(candidate);
				if !seen.insert((path.clone(), private_creator.clone())) {
					errors.push(ValidationError::DuplicateInBatch {
						path: candidate.path.clone(),
					});
				} else if existing
					.iter()
					.any(|entry| entry.matches(&path, private_creator.as_deref()))
				{
					errors.push(ValidationError::AlreadyExists {
						path: candidate.path.clone(),
					});
				}
			}

			validated.extend(validated_tag);
		}

		if existing.len() + candidates.len() > self.max_allowed_count {
			errors.push(ValidationError::LimitExceeded {
				limit: self.max_allowed_count,
				requested: candidates.len(),
			});
		}

		if errors.is_empty() {
			Ok(validated)
		} else {
			Err(ValidationErrors(errors))
		}
	}

	fn validate_entry(
		&self,
		candidate: &AddExtendedTagEntry,
		errors: &mut Vec<ValidationError>,
	) -> Option<ValidatedTag> {
		let path = candidate.path.clone();
		let error_count = errors.len();

		let level = match candidate.level.as_deref().map(str::parse::<QueryTagLevel>) {
			None => {
				errors.push(ValidationError::MissingLevel { path: path.clone() });
				None
			}
			Some(Err(_)) => {
				errors.push(ValidationError::InvalidLevel {
					path: path.clone(),
					level: candidate.level.clone().unwrap_or_default(),
				});
				None
			}
			Some(Ok(level)) => Some(level),
		};

		let tag = match parse_tag_path(&candidate.path) {
			Ok(tag) => tag,
			Err(PathError::Nested(_)) => {
				errors.push(ValidationError::NestedPath { path });
				return None;
			}
			Err(err) => {
				errors.push(ValidationError::InvalidPath {
					path,
					reason: err.to_string(),
				});
				return None;
			}
		};

		let vr = if is_private(tag) {
			self.validate_private(tag, candidate, errors)
		} else {
			Self::validate_standard(tag, candidate, level, errors)
		}?;

		if vr == VR::SQ {
			errors.push(ValidationError::SequenceVr { path: path.clone() });
		} else if NOT_INDEXABLE_VRS.contains(&vr) {
			errors.push(ValidationError::NotIndexableVr {
				path: path.clone(),
				vr: vr_code(vr),
			});
		} else if IndexDataType::from_vr(vr).is_none() {
			errors.push(ValidationError::UnsupportedVr {
				path: path.clone(),
				vr: vr_code(vr),
			});
		}

		if errors.len() > error_count {
			return None;
		}

		Some(ValidatedTag {
			tag,
			path: format_tag(tag),
			vr,
			private_creator: normalized_private_creator(candidate),
			level: level?,
		})
	}

	fn validate_standard(
		tag: Tag,
		candidate: &AddExtendedTagEntry,
		level: Option<QueryTagLevel>,
		errors: &mut Vec<ValidationError>,
	) -> Option<VR> {
		let path = candidate.path.clone();
		let Some(expected) = dictionary_vr(tag) else {
			errors.push(ValidationError::UnknownAttribute { path });
			return None;
		};
		if core_tag(tag).is_some() {
			errors.push(ValidationError::CoreTag { path });
			return None;
		}
		if candidate
			.private_creator
			.as_deref()
			.is_some_and(|creator| !creator.is_empty())
		{
			errors.push(ValidationError::UnexpectedPrivateCreator { path: path.clone() });
		}
		if let (Some(expected), Some(actual)) = (known_level(tag), level) {
			if expected != actual {
				errors.push(ValidationError::LevelMismatch {
					path: path.clone(),
					expected,
					actual,
				});
			}
		}

		match candidate.vr.as_deref() {
			None => Some(expected),
			Some(vr) => {
				let actual = parse_vr_code(vr).or_else(|| {
					errors.push(ValidationError::InvalidVr {
						path: path.clone(),
						vr: vr.to_owned(),
					});
					None
				})?;
				if actual == expected {
					Some(actual)
				} else {
					errors.push(ValidationError::VrMismatch {
						path,
						expected: vr_code(expected),
						actual: vr_code(actual),
					});
					None
				}
			}
		}
	}

	fn validate_private(
		&self,
		tag: Tag,
		candidate: &AddExtendedTagEntry,
		errors: &mut Vec<ValidationError>,
	) -> Option<VR> {
		let path = candidate.path.clone();
		let is_creator = is_private_creator(tag);
		if tag.group() < 0x0009 || !(is_creator || tag.element() >= 0x1000) {
			errors.push(ValidationError::InvalidPath {
				path,
				reason: String::from("not a valid private data element"),
			});
			return None;
		}

		let private_creator = candidate
			.private_creator
			.as_deref()
			.filter(|creator| !creator.is_empty());
		match (is_creator, private_creator) {
			(true, Some(_)) => {
				errors.push(ValidationError::UnexpectedPrivateCreator { path: path.clone() });
			}
			(false, None) => {
				errors.push(ValidationError::MissingPrivateCreator { path: path.clone() });
			}
			(false, Some(creator)) if creator.chars().count() > self.max_private_creator_length => {
				errors.push(ValidationError::PrivateCreatorTooLong {
					path: path.clone(),
					max: self.max_private_creator_length,
				});
			}
			_ => {}
		}

		let Some(vr) = candidate.vr.as_deref() else {
			errors.push(ValidationError::MissingVr { path });
			return None;
		};
		let Some(vr) = parse_vr_code(vr) else {
			errors.push(ValidationError::InvalidVr {
				path,
				vr: vr.to_owned(),
			});
			return None;
		};
		if is_creator && vr != VR::LO {
			errors.push(ValidationError::VrMismatch {
				path,
				expected: vr_code(VR::LO),
				actual: vr_code(vr),
			});
			return None;
		}
		Some(vr)
	}
}

fn normalized_private_creator(candidate: &AddExtendedTagEntry) -> Option<String> {
	candidate
		.private_creator
		.clone()
		.filter(|creator| !creator.is_empty())
}
