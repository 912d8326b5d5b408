use crate::reindex::IndexWriter;
use crate::store::{Database, StoreError};
use crate::tags::ExtendedTagEntry;
use crate::types::{InstanceIdentifier, QueryTagLevel, Watermark};
use crate::values::{format_datetime, person_name_words, IndexValue};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

/// Surrogate keys of an instance and its parents in the hierarchy tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HierarchyKeys {
	pub partition_key: i64,
	pub study_key: i64,
	pub series_key: i64,
	pub instance_key: i64,
	pub watermark: Watermark,
}

impl HierarchyKeys {
	/// Returns the series and instance keys that scope a value owned by `level`.
	const fn scope(&self, level: QueryTagLevel) -> (Option<i64>, Option<i64>) {
		match level {
			QueryTagLevel::Study => (None, None),
			QueryTagLevel::Series => (Some(self.series_key), None),
			QueryTagLevel::Instance => (Some(self.series_key), Some(self.instance_key)),
		}
	}
}

pub(crate) async fn find_keys(
	conn: &mut SqliteConnection,
	instance: &InstanceIdentifier,
) -> Result<Option<HierarchyKeys>, StoreError> {
	let row: Option<SqliteRow> = sqlx::query(
		"SELECT partition_key, study_key, series_key, instance_key, watermark FROM instance \
		WHERE partition_key = ? AND study_instance_uid = ? AND series_instance_uid = ? \
		AND sop_instance_uid = ?",
	)
	.bind(instance.partition_key)
	.bind(&instance.study_instance_uid)
	.bind(&instance.series_instance_uid)
	.bind(&instance.sop_instance_uid)
	.fetch_optional(conn)
	.await?;

	row.map(|row| {
		Ok(HierarchyKeys {
			partition_key: row.try_get("partition_key")?,
			study_key: row.try_get("study_key")?,
			series_key: row.try_get("series_key")?,
			instance_key: row.try_get("instance_key")?,
			watermark: row.try_get("watermark")?,
		})
	})
	.transpose()
}

/// Writes `value` unless a value from a newer instance is already stored.
pub(crate) async fn upsert_value(
	conn: &mut SqliteConnection,
	database: &Database,
	keys: &HierarchyKeys,
	tag: &ExtendedTagEntry,
	value: &IndexValue,
) -> Result<(), StoreError> {
	let table = value.data_type().table();
	let columns = database.schema_version().index_key_columns();
	let (series_key, instance_key) = keys.scope(tag.level);
	let scope = format!(
		"tag_key = ? AND partition_key = ? AND {} = ? AND {} IS ? AND {} IS ?",
		columns.study, columns.series, columns.instance
	);

	let replaced = sqlx::query(&format!("DELETE FROM {table} WHERE {scope} AND watermark < ?"))
		.bind(tag.key)
		.bind(keys.partition_key)
		.bind(keys.study_key)
		.bind(series_key)
		.bind(instance_key)
		.bind(keys.watermark)
		.execute(&mut *conn)
		.await?
		.rows_affected();

	let words = if matches!(value, IndexValue::PersonName(_)) {
		", tag_value_words"
	} else {
		""
	};
	let word_parameter = if words.is_empty() { "" } else { ", ?" };
	let statement = format!(
		"INSERT INTO {table} (tag_key, partition_key, {}, {}, {}, watermark, tag_value{words}) \
		SELECT ?, ?, ?, ?, ?, ?, ?{word_parameter} \
		WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE {scope})",
		columns.study, columns.series, columns.instance
	);

	let query = sqlx::query(&statement)
		.bind(tag.key)
		.bind(keys.partition_key)
		.bind(keys.study_key)
		.bind(series_key)
		.bind(instance_key)
		.bind(keys.watermark);
	let query = match value {
		IndexValue::String(value) => query.bind(value.clone()),
		IndexValue::Long(value) => query.bind(*value),
		IndexValue::Double(value) => query.bind(*value),
		IndexValue::DateTime(value) => query.bind(format_datetime(value)),
		IndexValue::PersonName(value) => query
			.bind(value.clone())
			.bind(person_name_words(value)),
	};
	let inserted = query
		.bind(tag.key)
		.bind(keys.partition_key)
		.bind(keys.study_key)
		.bind(series_key)
		.bind(instance_key)
		.execute(&mut *conn)
		.await?
		.rows_affected();

	debug!(
		tag = %tag.path,
		watermark = keys.watermark,
		replaced,
		inserted,
		"Upserted index value"
	);
	Ok(())
}

/// [`IndexWriter`] backed by the index tables of the database.
#[derive(Debug, Clone)]
pub struct SqliteIndexWriter {
	database: Database,
}

impl SqliteIndexWriter {
	pub const fn new(database: Database) -> Self {
		Self { database }
	}
}

#[async_trait]
impl IndexWriter for SqliteIndexWriter {
	async fn upsert(
		&self,
		instance: &InstanceIdentifier,
		tag: &ExtendedTagEntry,
		value: &IndexValue,
	) -> Result<(), StoreError> {
		let mut tx = self.database.pool().begin().await?;
		let Some(keys) = find_keys(&mut tx, instance).await? else {
			debug!(%instance, "Instance disappeared before it could be indexed");
			return Ok(());
		};
		upsert_value(&mut tx, &self.database, &keys, tag, value).await?;
		tx.commit().await?;
		Ok(())
	}
}
