use crate::reindex::ExceptionLog;
use crate::store::{Database, StoreError};
use crate::tags::ExtendedTagEntry;
use crate::types::{InstanceIdentifier, PartitionKey, Watermark, UI};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

/// An instance whose value of an extended query tag could not be indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedTagErrorRecord {
	pub tag_key: i64,
	pub partition_key: PartitionKey,
	pub study_instance_uid: UI,
	pub series_instance_uid: UI,
	pub sop_instance_uid: UI,
	#[serde(skip)]
	pub watermark: Watermark,
	pub operation_id: Option<Uuid>,
	pub batch: i64,
	pub error_message: String,
	pub created_time: DateTime<Utc>,
}

/// Exception log backed by the `extended_query_tag_error` table.
///
/// There is at most one record per tag and instance. Each new record increments the error
/// count of the tag.
#[derive(Debug, Clone)]
pub struct SqliteExceptionLog {
	database: Database,
}

impl SqliteExceptionLog {
	pub const fn new(database: Database) -> Self {
		Self { database }
	}
}

#[async_trait]
impl ExceptionLog for SqliteExceptionLog {
	async fn record(
		&self,
		instance: &InstanceIdentifier,
		tag: &ExtendedTagEntry,
		operation_id: Uuid,
		batch: u64,
		error: &str,
	) -> Result<(), StoreError> {
		let batch = i64::try_from(batch).unwrap_or(i64::MAX);
		let operation_id = operation_id.to_string();
		let mut tx = self.database.pool().begin().await?;

		let inserted = sqlx::query(
			"INSERT OR IGNORE INTO extended_query_tag_error (tag_key, watermark, partition_key, \
			study_instance_uid, series_instance_uid, sop_instance_uid, operation_id, batch, \
			error_message, created_time) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(tag.key)
		.bind(instance.watermark)
		.bind(instance.partition_key)
		.bind(&instance.study_instance_uid)
		.bind(&instance.series_instance_uid)
		.bind(&instance.sop_instance_uid)
		.bind(&operation_id)
		.bind(batch)
		.bind(error)
		.bind(Utc::now())
		.execute(&mut *tx)
		.await?
		.rows_affected();

		if inserted == 0 {
			sqlx::query(
				"UPDATE extended_query_tag_error SET operation_id = ?, batch = ?, error_message = ? \
				WHERE tag_key = ? AND watermark = ?",
			)
			.bind(&operation_id)
			.bind(batch)
			.bind(error)
			.bind(tag.key)
			.bind(instance.watermark)
			.execute(&mut *tx)
			.await?;
		} else {
			sqlx::query(
				"UPDATE extended_query_tag SET error_count = error_count + 1 WHERE tag_key = ?",
			)
			.bind(tag.key)
			.execute(&mut *tx)
			.await?;
		}
		tx.commit().await?;

		debug!(tag = %tag.path, %instance, batch, "Recorded extended query tag error");
		Ok(())
	}

	async fn list(
		&self,
		tag_key: i64,
		limit: usize,
		offset: usize,
	) -> Result<Vec<ExtendedTagErrorRecord>, StoreError> {
		let rows = sqlx::query(
			"SELECT tag_key, watermark, partition_key, study_instance_uid, series_instance_uid, \
			sop_instance_uid, operation_id, batch, error_message, created_time \
			FROM extended_query_tag_error WHERE tag_key = ? ORDER BY watermark DESC LIMIT ? OFFSET ?",
		)
		.bind(tag_key)
		.bind(i64::try_from(limit).unwrap_or(i64::MAX))
		.bind(i64::try_from(offset).unwrap_or(i64::MAX))
		.fetch_all(self.database.pool())
		.await?;

		rows.iter()
			.map(|row| {
				let operation_id = row
					.try_get::<Option<String>, _>("operation_id")?
					.map(|id| Uuid::parse_str(&id))
					.transpose()
					.map_err(|err| StoreError::invalid_row("extended_query_tag_error", err.to_string()))?;
				Ok(ExtendedTagErrorRecord {
					tag_key: row.try_get("tag_key")?,
					partition_key: row.try_get("partition_key")?,
					study_instance_uid: row.try_get("study_instance_uid")?,
					series_instance_uid: row.try_get("series_instance_uid")?,
					sop_instance_uid: row.try_get("sop_instance_uid")?,
					watermark: row.try_get("watermark")?,
					operation_id,
					batch: row.try_get("batch")?,
					error_message: row.try_get("error_message")?,
					created_time: row.try_get("created_time")?,
				})
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::SchemaVersion;
	use crate::tags::{ExtendedTagStore, SqliteExtendedTagStore, ValidatedTag};
	use crate::types::QueryTagLevel;
	use dicom::core::VR;
	use dicom::dictionary_std::tags;

	fn instance(watermark: Watermark) -> InstanceIdentifier {
		InstanceIdentifier {
			partition_key: 1,
			study_instance_uid: String::from("1"),
			series_instance_uid: String::from("1.1"),
			sop_instance_uid: format!("1.1.{watermark}"),
			watermark,
		}
	}

	#[tokio::test]
	async fn record_counts_each_instance_once() {
		let database = Database::in_memory(SchemaVersion::CURRENT).await.unwrap();
		let tags = SqliteExtendedTagStore::new(database.clone());
		let added = tags
			.add_tags(
				&[ValidatedTag {
					tag: tags::PATIENT_WEIGHT,
					path: String::from("00101030"),
					vr: VR::DS,
					private_creator: None,
					level: QueryTagLevel::Study,
				}],
				None,
				128,
			)
			.await
			.unwrap();
		let tag = &added[0];

		let log = SqliteExceptionLog::new(database);
		let operation_id = Uuid::new_v4();
		log.record(&instance(1), tag, operation_id, 1, "bad value").await.unwrap();
		log.record(&instance(2), tag, operation_id, 1, "bad value").await.unwrap();
		log.record(&instance(1), tag, operation_id, 2, "still bad").await.unwrap();

		let reloaded = tags.get_tag(tag.key).await.unwrap().unwrap();
		assert_eq!(reloaded.error_count, 2);
		assert!(reloaded.is_erroneous());

		let records = log.list(tag.key, 10, 0).await.unwrap();
		assert_eq!(records.len(), 2);
		assert_eq!(records[0].sop_instance_uid, "1.1.2");
		assert_eq!(records[1].error_message, "still bad");
		assert_eq!(records[1].batch, 2);
		assert_eq!(records[1].operation_id, Some(operation_id));

		assert_eq!(log.list(tag.key, 1, 1).await.unwrap().len(), 1);
	}
}
