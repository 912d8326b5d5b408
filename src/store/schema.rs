//! Relational layout of the index store.
//!
//! The key columns of the extended query tag index tables were renamed in schema version 5.
//! [`SchemaVersion::index_key_columns`] is the single place this difference is resolved.

use crate::values::IndexDataType;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::fmt::{Display, Formatter};
use std::ops::RangeInclusive;
use tracing::info;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "u32")]
pub struct SchemaVersion(u32);

impl SchemaVersion {
	pub const MIN: Self = Self(1);
	pub const CURRENT: Self = Self(5);

	pub const fn new(version: u32) -> Option<Self> {
		if version >= Self::MIN.0 && version <= Self::CURRENT.0 {
			Some(Self(version))
		} else {
			None
		}
	}

	pub const fn value(self) -> u32 {
		self.0
	}

	/// Returns the names of the hierarchy key columns of the index tables.
	pub fn index_key_columns(self) -> &'static IndexKeyColumns {
		INDEX_KEY_COLUMNS
			.iter()
			.find(|(versions, _)| versions.contains(&self.0))
			.map_or(&CURRENT_KEY_COLUMNS, |(_, columns)| columns)
	}
}

impl TryFrom<u32> for SchemaVersion {
	type Error = String;

	fn try_from(version: u32) -> Result<Self, Self::Error> {
		Self::new(version).ok_or_else(|| {
			format!(
				"schema version {version} is not within the supported range {}..={}",
				Self::MIN,
				Self::CURRENT
			)
		})
	}
}

impl Display for SchemaVersion {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Column names of the Study, Series and Instance keys in an index table.
#[derive(Debug, PartialEq, Eq)]
pub struct IndexKeyColumns {
	pub study: &'static str,
	pub series: &'static str,
	pub instance: &'static str,
}

const LEGACY_KEY_COLUMNS: IndexKeyColumns = IndexKeyColumns {
	study: "study_key",
	series: "series_key",
	instance: "instance_key",
};

const CURRENT_KEY_COLUMNS: IndexKeyColumns = IndexKeyColumns {
	study: "sop_instance_key1",
	series: "sop_instance_key2",
	instance: "sop_instance_key3",
};

const INDEX_KEY_COLUMNS: &[(RangeInclusive<u32>, IndexKeyColumns)] = &[
	(1..=4, LEGACY_KEY_COLUMNS),
	(5..=u32::MAX, CURRENT_KEY_COLUMNS),
];

const HIERARCHY_TABLES: &[&str] = &[
	"CREATE TABLE IF NOT EXISTS study (
		study_key INTEGER PRIMARY KEY AUTOINCREMENT,
		partition_key INTEGER NOT NULL,
		study_instance_uid TEXT NOT NULL,
		study_date TEXT NULL,
		study_description TEXT NULL,
		accession_number TEXT NULL,
		patient_id TEXT NULL,
		patient_name TEXT NULL,
		patient_name_words TEXT NULL,
		referring_physician_name TEXT NULL,
		referring_physician_name_words TEXT NULL,
		patient_birth_date TEXT NULL,
		UNIQUE (partition_key, study_instance_uid)
	)",
	"CREATE TABLE IF NOT EXISTS series (
		series_key INTEGER PRIMARY KEY AUTOINCREMENT,
		study_key INTEGER NOT NULL REFERENCES study (study_key),
		partition_key INTEGER NOT NULL,
		series_instance_uid TEXT NOT NULL,
		modality TEXT NULL,
		performed_procedure_step_start_date TEXT NULL,
		manufacturer_model_name TEXT NULL,
		UNIQUE (partition_key, study_key, series_instance_uid)
	)",
	"CREATE TABLE IF NOT EXISTS instance (
		instance_key INTEGER PRIMARY KEY AUTOINCREMENT,
		series_key INTEGER NOT NULL REFERENCES series (series_key),
		study_key INTEGER NOT NULL REFERENCES study (study_key),
		partition_key INTEGER NOT NULL,
		study_instance_uid TEXT NOT NULL,
		series_instance_uid TEXT NOT NULL,
		sop_instance_uid TEXT NOT NULL,
		sop_class_uid TEXT NULL,
		watermark INTEGER NOT NULL UNIQUE,
		UNIQUE (partition_key, study_instance_uid, series_instance_uid, sop_instance_uid)
	)",
	"CREATE INDEX IF NOT EXISTS ix_instance_series ON instance (series_key, watermark)",
	"CREATE INDEX IF NOT EXISTS ix_instance_study ON instance (study_key, watermark)",
];

const CATALOG_TABLES: &[&str] = &[
	"CREATE TABLE IF NOT EXISTS extended_query_tag (
		tag_key INTEGER PRIMARY KEY AUTOINCREMENT,
		tag_path TEXT NOT NULL,
		tag_vr TEXT NOT NULL,
		tag_private_creator TEXT NULL,
		tag_level INTEGER NOT NULL,
		tag_status INTEGER NOT NULL,
		query_status INTEGER NOT NULL,
		error_count INTEGER NOT NULL DEFAULT 0,
		operation_id TEXT NULL,
		version BLOB NOT NULL
	)",
	"CREATE UNIQUE INDEX IF NOT EXISTS ux_extended_query_tag_path
		ON extended_query_tag (tag_path, IFNULL(tag_private_creator, ''))",
	"CREATE TABLE IF NOT EXISTS tag_version_sequence (
		id INTEGER PRIMARY KEY CHECK (id = 1),
		value INTEGER NOT NULL
	)",
	"INSERT OR IGNORE INTO tag_version_sequence (id, value) VALUES (1, 0)",
	"CREATE TABLE IF NOT EXISTS extended_query_tag_error (
		tag_key INTEGER NOT NULL,
		watermark INTEGER NOT NULL,
		partition_key INTEGER NOT NULL,
		study_instance_uid TEXT NOT NULL,
		series_instance_uid TEXT NOT NULL,
		sop_instance_uid TEXT NOT NULL,
		operation_id TEXT NULL,
		batch INTEGER NOT NULL,
		error_message TEXT NOT NULL,
		created_time TEXT NOT NULL,
		PRIMARY KEY (tag_key, watermark)
	)",
];

/// Returns the DDL of an extended query tag index table.
fn index_table_statements(data_type: IndexDataType, columns: &IndexKeyColumns) -> [String; 3] {
	let table = data_type.table();
	let value_type = match data_type {
		IndexDataType::String | IndexDataType::DateTime | IndexDataType::PersonName => "TEXT",
		IndexDataType::Long => "INTEGER",
		IndexDataType::Double => "REAL",
	};
	let words = if data_type == IndexDataType::PersonName {
		",\n\t\ttag_value_words TEXT NOT NULL"
	} else {
		""
	};
	let IndexKeyColumns {
		study,
		series,
		instance,
	} = columns;

	[
		format!(
			"CREATE TABLE IF NOT EXISTS {table} (
		tag_key INTEGER NOT NULL,
		partition_key INTEGER NOT NULL,
		{study} INTEGER NOT NULL,
		{series} INTEGER NULL,
		{instance} INTEGER NULL,
		watermark INTEGER NOT NULL,
		tag_value {value_type} NOT NULL{words}
	)"
		),
		format!("CREATE INDEX IF NOT EXISTS ix_{table}_value ON {table} (tag_key, tag_value)"),
		format!(
			"CREATE INDEX IF NOT EXISTS ix_{table}_keys ON {table} (tag_key, partition_key, {study}, {series}, {instance})"
		),
	]
}

/// Returns every statement required to create the store at the given schema version.
pub fn statements(version: SchemaVersion) -> Vec<String> {
	let columns = version.index_key_columns();
	HIERARCHY_TABLES
		.iter()
		.chain(CATALOG_TABLES)
		.map(|statement| (*statement).to_owned())
		.chain(
			IndexDataType::ALL
				.into_iter()
				.flat_map(|data_type| index_table_statements(data_type, columns)),
		)
		.collect()
}

/// Creates all tables that do not exist yet.
pub async fn create(pool: &SqlitePool, version: SchemaVersion) -> Result<(), sqlx::Error> {
	for statement in statements(version) {
		sqlx::query(&statement).execute(pool).await?;
	}
	info!(schema_version = %version, "Initialized index store");
	Ok(())
}
