//! Extended query tags: user-registered attributes that are indexed in addition to the core
//! query tags.

pub mod cache;
pub mod path;
pub mod service;
pub mod status;
pub mod store;
pub mod validator;

pub use cache::QueryTagCache;
pub use service::*;
pub use status::{ExtendedTagStatus, InvalidTransition, QueryStatus, TagEvent, TagVersion};
pub use store::{ExtendedTagStore, SqliteExtendedTagStore, StoreError};
pub use validator::{ValidatedTag, ValidationError, ValidationErrors, Validator};

use crate::types::QueryTagLevel;
use dicom::core::{Tag, VR};
use serde::Deserialize;
use uuid::Uuid;

/// A registration request for a single extended query tag.
///
/// Fields are kept as supplied by the client, so that the validator can report every problem
/// of a batch at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddExtendedTagEntry {
	#[serde(alias = "Path")]
	pub path: String,
	#[serde(default, alias = "VR", alias = "Vr")]
	pub vr: Option<String>,
	#[serde(default, alias = "PrivateCreator")]
	pub private_creator: Option<String>,
	#[serde(default, alias = "Level")]
	pub level: Option<String>,
}

impl AddExtendedTagEntry {
	pub fn new(path: &str, vr: Option<&str>, level: &str) -> Self {
		Self {
			path: path.to_owned(),
			vr: vr.map(String::from),
			private_creator: None,
			level: Some(level.to_owned()),
		}
	}

	#[must_use]
	pub fn with_private_creator(mut self, private_creator: &str) -> Self {
		self.private_creator = Some(private_creator.to_owned());
		self
	}
}

/// A registered extended query tag as persisted in the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedTagEntry {
	pub key: i64,
	pub tag: Tag,
	/// The canonical path (`GGGGEEEE`).
	pub path: String,
	pub vr: VR,
	pub private_creator: Option<String>,
	pub level: QueryTagLevel,
	pub status: ExtendedTagStatus,
	pub query_status: QueryStatus,
	pub error_count: i64,
	/// The reindex operation that most recently owned this tag.
	pub operation_id: Option<Uuid>,
	pub version: TagVersion,
}

impl ExtendedTagEntry {
	/// Whether the tag has to be reported as erroneous when used in a query.
	pub const fn is_erroneous(&self) -> bool {
		self.status.is_indexing() || self.error_count > 0
	}

	pub fn matches(&self, path: &str, private_creator: Option<&str>) -> bool {
		self.path == path && self.private_creator.as_deref() == private_creator
	}
}
