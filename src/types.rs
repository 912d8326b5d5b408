use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// Surrogate key of a data partition.
pub type PartitionKey = i64;

/// Monotonically increasing version number assigned to every stored instance.
pub type Watermark = i64;

/// The information entity level that owns the value of an attribute.
///
/// The ordering follows the hierarchy: `Study < Series < Instance`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueryTagLevel {
	Study = 0,
	Series = 1,
	Instance = 2,
}

impl QueryTagLevel {
	pub const fn code(self) -> i64 {
		self as i64
	}

	pub const fn from_code(code: i64) -> Option<Self> {
		match code {
			0 => Some(Self::Study),
			1 => Some(Self::Series),
			2 => Some(Self::Instance),
			_ => None,
		}
	}
}

impl Display for QueryTagLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Study => write!(f, "Study"),
			Self::Series => write!(f, "Series"),
			Self::Instance => write!(f, "Instance"),
		}
	}
}

impl FromStr for QueryTagLevel {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"study" => Ok(Self::Study),
			"series" => Ok(Self::Series),
			"instance" => Ok(Self::Instance),
			_ => Err(format!("unknown level '{s}'")),
		}
	}
}

/// The collection a search transaction is executed against.
///
/// <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.6>
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryResource {
	AllStudies,
	AllSeries,
	AllInstances,
	StudySeries,
	StudyInstances,
	StudySeriesInstances,
}

impl QueryResource {
	/// The level of the records returned for this resource.
	pub const fn level(self) -> QueryTagLevel {
		match self {
			Self::AllStudies => QueryTagLevel::Study,
			Self::AllSeries | Self::StudySeries => QueryTagLevel::Series,
			Self::AllInstances | Self::StudyInstances | Self::StudySeriesInstances => {
				QueryTagLevel::Instance
			}
		}
	}

	/// Whether attributes owned by `level` may be filtered or returned for this resource.
	pub fn supports(self, level: QueryTagLevel) -> bool {
		level <= self.level()
	}
}

impl Display for QueryResource {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::AllStudies => write!(f, "all studies"),
			Self::AllSeries => write!(f, "all series"),
			Self::AllInstances => write!(f, "all instances"),
			Self::StudySeries => write!(f, "study's series"),
			Self::StudyInstances => write!(f, "study's instances"),
			Self::StudySeriesInstances => write!(f, "study's series' instances"),
		}
	}
}

/// Identifies a stored instance and its position in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceIdentifier {
	pub partition_key: PartitionKey,
	pub study_instance_uid: UI,
	pub series_instance_uid: UI,
	pub sop_instance_uid: UI,
	pub watermark: Watermark,
}

impl Display for InstanceIdentifier {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"{}/{}/{} (watermark {})",
			self.study_instance_uid, self.series_instance_uid, self.sop_instance_uid, self.watermark
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn level_ordering_follows_hierarchy() {
		assert!(QueryTagLevel::Study < QueryTagLevel::Series);
		assert!(QueryTagLevel::Series < QueryTagLevel::Instance);
	}

	#[test]
	fn parse_level_case_insensitive() {
		assert_eq!("SERIES".parse::<QueryTagLevel>(), Ok(QueryTagLevel::Series));
		assert_eq!("instance".parse::<QueryTagLevel>(), Ok(QueryTagLevel::Instance));
		assert!("Patient".parse::<QueryTagLevel>().is_err());
	}

	#[test]
	fn resource_supports_coarser_levels() {
		assert!(QueryResource::AllStudies.supports(QueryTagLevel::Study));
		assert!(!QueryResource::AllStudies.supports(QueryTagLevel::Series));
		assert!(QueryResource::AllSeries.supports(QueryTagLevel::Series));
		assert!(!QueryResource::StudySeries.supports(QueryTagLevel::Instance));
		assert!(QueryResource::StudySeriesInstances.supports(QueryTagLevel::Series));
	}
}
