use crate::query::tag::CORE_QUERY_TAGS;
use crate::reindex::{extract_value, InstanceEnumerator};
use crate::store::index::{upsert_value, HierarchyKeys};
use crate::store::{Database, StoreError};
use crate::tags::{ExtendedTagEntry, ExtendedTagStatus};
use crate::types::{InstanceIdentifier, PartitionKey, QueryTagLevel, Watermark};
use crate::values::{first_value, format_datetime, parse_date, person_name_words};
use async_trait::async_trait;
use chrono::NaiveTime;
use dicom::core::{Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use sqlx::{Row, SqliteConnection};
use std::ops::RangeInclusive;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum IngestError {
	#[error("instance is missing the required attribute {0}")]
	MissingAttribute(&'static str),
	#[error(transparent)]
	Store(#[from] StoreError),
}

impl From<sqlx::Error> for IngestError {
	fn from(err: sqlx::Error) -> Self {
		Self::Store(StoreError::Database(err))
	}
}

/// The Study/Series/Instance hierarchy tables.
#[derive(Debug, Clone)]
pub struct InstanceStore {
	database: Database,
}

/// A hierarchy column and the value to store in it.
type ColumnValue = (String, Option<String>);

fn text_value(dataset: &InMemDicomObject, tag: Tag) -> Option<String> {
	let element = dataset.get(tag)?;
	let text = element.to_str().ok()?;
	first_value(&text).map(String::from)
}

fn required_uid(
	dataset: &InMemDicomObject,
	tag: Tag,
	name: &'static str,
) -> Result<String, IngestError> {
	text_value(dataset, tag).ok_or(IngestError::MissingAttribute(name))
}

/// Collects the core attribute columns of a hierarchy table, except the UID key column.
fn core_columns(dataset: &InMemDicomObject, level: QueryTagLevel, key_tag: Tag) -> Vec<ColumnValue> {
	let mut columns = Vec::new();
	for core in CORE_QUERY_TAGS
		.iter()
		.filter(|core| core.level == level && core.tag != key_tag)
	{
		let value = text_value(dataset, core.tag);
		match core.vr {
			VR::DA => {
				let date = value
					.as_deref()
					.and_then(parse_date)
					.map(|date| format_datetime(&date.and_time(NaiveTime::MIN)));
				columns.push((core.column.to_owned(), date));
			}
			VR::PN => {
				let words = value.as_deref().map(person_name_words);
				columns.push((core.column.to_owned(), value));
				columns.push((format!("{}_words", core.column), words));
			}
			_ => columns.push((core.column.to_owned(), value)),
		}
	}
	columns
}

/// Builds `INSERT ... ON CONFLICT DO UPDATE ... RETURNING` for a hierarchy table.
fn upsert_statement(
	table: &str,
	fixed: &[&str],
	columns: &[ColumnValue],
	conflict: &str,
	returning: &str,
) -> String {
	let names: Vec<&str> = fixed
		.iter()
		.copied()
		.chain(columns.iter().map(|(name, _)| name.as_str()))
		.collect();
	let placeholders = vec!["?"; names.len()].join(", ");
	let updates = columns
		.iter()
		.map(|(name, _)| format!("{name} = excluded.{name}"))
		.collect::<Vec<_>>()
		.join(", ");
	format!(
		"INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT ({conflict}) DO UPDATE SET {updates} RETURNING {returning}",
		names.join(", ")
	)
}

impl InstanceStore {
	pub const fn new(database: Database) -> Self {
		Self { database }
	}

	/// Adds or replaces an instance in the hierarchy tables and indexes its extended query tags.
	///
	/// The instance is assigned the next watermark. Tags that are being deleted are skipped;
	/// values that cannot be extracted are left out of the index.
	pub async fn index_instance(
		&self,
		partition_key: PartitionKey,
		dataset: &InMemDicomObject,
		tags: &[ExtendedTagEntry],
	) -> Result<InstanceIdentifier, IngestError> {
		let study_instance_uid =
			required_uid(dataset, tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?;
		let series_instance_uid =
			required_uid(dataset, tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?;
		let sop_instance_uid = required_uid(dataset, tags::SOP_INSTANCE_UID, "SOPInstanceUID")?;

		let mut tx = self.database.pool().begin().await?;

		let study_columns = core_columns(dataset, QueryTagLevel::Study, tags::STUDY_INSTANCE_UID);
		let statement = upsert_statement(
			"study",
			&["partition_key", "study_instance_uid"],
			&study_columns,
			"partition_key, study_instance_uid",
			"study_key",
		);
		let mut query = sqlx::query_scalar::<_, i64>(&statement)
			.bind(partition_key)
			.bind(&study_instance_uid);
		for (_, value) in &study_columns {
			query = query.bind(value.as_deref());
		}
		let study_key = query.fetch_one(&mut *tx).await?;

		let series_columns =
			core_columns(dataset, QueryTagLevel::Series, tags::SERIES_INSTANCE_UID);
		let statement = upsert_statement(
			"series",
			&["study_key", "partition_key", "series_instance_uid"],
			&series_columns,
			"partition_key, study_key, series_instance_uid",
			"series_key",
		);
		let mut query = sqlx::query_scalar::<_, i64>(&statement)
			.bind(study_key)
			.bind(partition_key)
			.bind(&series_instance_uid);
		for (_, value) in &series_columns {
			query = query.bind(value.as_deref());
		}
		let series_key = query.fetch_one(&mut *tx).await?;

		let watermark: Watermark =
			sqlx::query_scalar("SELECT COALESCE(MAX(watermark), 0) + 1 FROM instance")
				.fetch_one(&mut *tx)
				.await?;
		let mut instance_columns =
			core_columns(dataset, QueryTagLevel::Instance, tags::SOP_INSTANCE_UID);
		instance_columns.push((String::from("watermark"), None));
		let statement = upsert_statement(
			"instance",
			&[
				"series_key",
				"study_key",
				"partition_key",
				"study_instance_uid",
				"series_instance_uid",
				"sop_instance_uid",
			],
			&instance_columns,
			"partition_key, study_instance_uid, series_instance_uid, sop_instance_uid",
			"instance_key",
		);
		let mut query = sqlx::query_scalar::<_, i64>(&statement)
			.bind(series_key)
			.bind(study_key)
			.bind(partition_key)
			.bind(&study_instance_uid)
			.bind(&series_instance_uid)
			.bind(&sop_instance_uid);
		for (name, value) in &instance_columns {
			query = if name == "watermark" {
				query.bind(watermark)
			} else {
				query.bind(value.as_deref())
			};
		}
		let instance_key = query.fetch_one(&mut *tx).await?;

		let keys = HierarchyKeys {
			partition_key,
			study_key,
			series_key,
			instance_key,
			watermark,
		};
		self.index_extended_tags(&mut tx, &keys, dataset, tags).await?;
		tx.commit().await?;

		let identifier = InstanceIdentifier {
			partition_key,
			study_instance_uid,
			series_instance_uid,
			sop_instance_uid,
			watermark,
		};
		info!(instance = %identifier, "Indexed instance");
		Ok(identifier)
	}

	async fn index_extended_tags(
		&self,
		conn: &mut SqliteConnection,
		keys: &HierarchyKeys,
		dataset: &InMemDicomObject,
		tags: &[ExtendedTagEntry],
	) -> Result<(), StoreError> {
		for tag in tags
			.iter()
			.filter(|tag| tag.status != ExtendedTagStatus::Deleting)
		{
			match extract_value(dataset, tag) {
				Ok(Some(value)) => upsert_value(conn, &self.database, keys, tag, &value).await?,
				Ok(None) => {}
				Err(err) => {
					warn!(tag = %tag.path, watermark = keys.watermark, error = %err, "Skipping invalid value");
				}
			}
		}
		Ok(())
	}
}

#[async_trait]
impl InstanceEnumerator for InstanceStore {
	async fn watermark_range(
		&self,
		partition: Option<PartitionKey>,
	) -> Result<Option<RangeInclusive<Watermark>>, StoreError> {
		let row = sqlx::query(
			"SELECT MIN(watermark) AS min_watermark, MAX(watermark) AS max_watermark FROM instance \
			WHERE ? IS NULL OR partition_key = ?",
		)
		.bind(partition)
		.bind(partition)
		.fetch_one(self.database.pool())
		.await?;
		let min: Option<Watermark> = row.try_get("min_watermark")?;
		let max: Option<Watermark> = row.try_get("max_watermark")?;
		Ok(min.zip(max).map(|(min, max)| min..=max))
	}

	async fn list_instances_descending(
		&self,
		partition: Option<PartitionKey>,
		max_watermark: Watermark,
		batch_size: usize,
	) -> Result<Vec<InstanceIdentifier>, StoreError> {
		let rows = sqlx::query(
			"SELECT partition_key, study_instance_uid, series_instance_uid, sop_instance_uid, watermark \
			FROM instance WHERE watermark <= ? AND (? IS NULL OR partition_key = ?) \
			ORDER BY watermark DESC LIMIT ?",
		)
		.bind(max_watermark)
		.bind(partition)
		.bind(partition)
		.bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
		.fetch_all(self.database.pool())
		.await?;

		rows.iter()
			.map(|row| {
				Ok(InstanceIdentifier {
					partition_key: row.try_get("partition_key")?,
					study_instance_uid: row.try_get("study_instance_uid")?,
					series_instance_uid: row.try_get("series_instance_uid")?,
					sop_instance_uid: row.try_get("sop_instance_uid")?,
					watermark: row.try_get("watermark")?,
				})
			})
			.collect()
	}
}
