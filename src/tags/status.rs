use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Lifecycle status of an extended query tag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtendedTagStatus {
	Adding,
	Ready,
	Reindexing,
	Deleting,
}

/// Events driving the lifecycle of an extended query tag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TagEvent {
	/// The reindex operation owning the tag completed.
	IndexingCompleted,
	/// A new reindex operation was requested for the tag.
	ReindexRequested,
	/// The tag is about to be removed.
	DeleteRequested,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot apply {event:?} to an extended query tag in status {status}")]
pub struct InvalidTransition {
	pub status: ExtendedTagStatus,
	pub event: TagEvent,
}

impl ExtendedTagStatus {
	/// The complete transition table.
	///
	/// ```text
	/// Adding     + IndexingCompleted -> Ready
	/// Reindexing + IndexingCompleted -> Ready
	/// Ready      + ReindexRequested  -> Reindexing
	/// Adding     + ReindexRequested  -> Adding      (retry of a failed operation)
	/// Adding     + DeleteRequested   -> Deleting
	/// Ready      + DeleteRequested   -> Deleting
	/// Reindexing + DeleteRequested   -> Deleting
	/// ```
	///
	/// Every other combination is an [`InvalidTransition`].
	pub const fn apply(self, event: TagEvent) -> Result<Self, InvalidTransition> {
		match (self, event) {
			(Self::Adding | Self::Reindexing, TagEvent::IndexingCompleted) => Ok(Self::Ready),
			(Self::Ready, TagEvent::ReindexRequested) => Ok(Self::Reindexing),
			(Self::Adding, TagEvent::ReindexRequested) => Ok(Self::Adding),
			(Self::Adding | Self::Ready | Self::Reindexing, TagEvent::DeleteRequested) => {
				Ok(Self::Deleting)
			}
			(Self::Ready, TagEvent::IndexingCompleted)
			| (Self::Reindexing, TagEvent::ReindexRequested)
			| (Self::Deleting, _) => Err(InvalidTransition {
				status: self,
				event,
			}),
		}
	}

	/// Whether the index of a tag in this status is still being populated.
	pub const fn is_indexing(self) -> bool {
		matches!(self, Self::Adding | Self::Reindexing)
	}

	pub const fn code(self) -> i64 {
		match self {
			Self::Adding => 0,
			Self::Ready => 1,
			Self::Reindexing => 2,
			Self::Deleting => 3,
		}
	}

	pub const fn from_code(code: i64) -> Option<Self> {
		match code {
			0 => Some(Self::Adding),
			1 => Some(Self::Ready),
			2 => Some(Self::Reindexing),
			3 => Some(Self::Deleting),
			_ => None,
		}
	}
}

impl Display for ExtendedTagStatus {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Adding => write!(f, "Adding"),
			Self::Ready => write!(f, "Ready"),
			Self::Reindexing => write!(f, "Reindexing"),
			Self::Deleting => write!(f, "Deleting"),
		}
	}
}

/// Whether an extended query tag may be used in search requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryStatus {
	Disabled,
	Enabled,
}

impl QueryStatus {
	pub const fn code(self) -> i64 {
		match self {
			Self::Disabled => 0,
			Self::Enabled => 1,
		}
	}

	pub const fn from_code(code: i64) -> Option<Self> {
		match code {
			0 => Some(Self::Disabled),
			1 => Some(Self::Enabled),
			_ => None,
		}
	}
}

/// Opaque optimistic concurrency token of an extended query tag.
///
/// Tokens are compared as unsigned byte sequences; every mutation assigns a greater one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagVersion([u8; 8]);

impl TagVersion {
	pub const fn from_sequence(sequence: u64) -> Self {
		Self(sequence.to_be_bytes())
	}

	pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
		<[u8; 8]>::try_from(bytes).ok().map(Self)
	}

	pub const fn as_bytes(&self) -> &[u8; 8] {
		&self.0
	}
}

impl Display for TagVersion {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		for byte in self.0 {
			write!(f, "{byte:02x}")?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const STATUSES: [ExtendedTagStatus; 4] = [
		ExtendedTagStatus::Adding,
		ExtendedTagStatus::Ready,
		ExtendedTagStatus::Reindexing,
		ExtendedTagStatus::Deleting,
	];

	const EVENTS: [TagEvent; 3] = [
		TagEvent::IndexingCompleted,
		TagEvent::ReindexRequested,
		TagEvent::DeleteRequested,
	];

	#[test]
	fn add_then_ready() {
		assert_eq!(
			ExtendedTagStatus::Adding.apply(TagEvent::IndexingCompleted),
			Ok(ExtendedTagStatus::Ready)
		);
	}

	#[test]
	fn reindex_cycle() {
		let status = ExtendedTagStatus::Ready
			.apply(TagEvent::ReindexRequested)
			.and_then(|status| status.apply(TagEvent::IndexingCompleted));
		assert_eq!(status, Ok(ExtendedTagStatus::Ready));
	}

	#[test]
	fn deleting_is_terminal() {
		for event in EVENTS {
			assert_eq!(
				ExtendedTagStatus::Deleting.apply(event),
				Err(InvalidTransition {
					status: ExtendedTagStatus::Deleting,
					event
				})
			);
		}
	}

	#[test]
	fn every_live_status_can_be_deleted() {
		for status in STATUSES {
			let expected = status != ExtendedTagStatus::Deleting;
			assert_eq!(status.apply(TagEvent::DeleteRequested).is_ok(), expected);
		}
	}

	#[test]
	fn status_codes_round_trip() {
		for status in STATUSES {
			assert_eq!(ExtendedTagStatus::from_code(status.code()), Some(status));
		}
		assert_eq!(ExtendedTagStatus::from_code(42), None);
	}

	#[test]
	fn versions_compare_as_bytes() {
		let older = TagVersion::from_sequence(0xFF);
		let newer = TagVersion::from_sequence(0x100);
		assert!(older < newer);
		assert_eq!(TagVersion::from_bytes(newer.as_bytes()), Some(newer));
		assert_eq!(TagVersion::from_bytes(&[1, 2, 3]), None);
		assert_eq!(newer.to_string(), "0000000000000100");
	}
}
