use crate::store::{next_version, Database};
use crate::tags::path::parse_hex_tag;
use crate::tags::{
	ExtendedTagEntry, ExtendedTagStatus, QueryStatus, TagEvent, TagVersion, ValidatedTag,
};
use crate::types::QueryTagLevel;
use crate::values::{parse_vr_code, vr_code, IndexDataType};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};
use uuid::Uuid;

pub use crate::store::StoreError;

/// The persisted catalog of extended query tags.
///
/// Every mutation is a compare-and-swap on the version token of the entry. A mutation carrying
/// a stale token fails with [`StoreError::VersionConflict`] instead of overwriting the entry.
#[async_trait]
pub trait ExtendedTagStore: Send + Sync {
	/// Lists catalog entries ordered by key.
	async fn list_tags(
		&self,
		limit: Option<usize>,
		offset: usize,
	) -> Result<Vec<ExtendedTagEntry>, StoreError>;

	/// Returns every entry registered for a path, one per private creator.
	async fn get_tags_by_path(&self, path: &str) -> Result<Vec<ExtendedTagEntry>, StoreError>;

	async fn get_tag(&self, key: i64) -> Result<Option<ExtendedTagEntry>, StoreError>;

	/// Persists validated tags in status [`ExtendedTagStatus::Adding`], owned by `operation_id`.
	async fn add_tags(
		&self,
		tags: &[ValidatedTag],
		operation_id: Option<Uuid>,
		max_allowed_count: usize,
	) -> Result<Vec<ExtendedTagEntry>, StoreError>;

	/// Applies a lifecycle event. A given `operation_id` replaces the owning operation.
	async fn update_status(
		&self,
		key: i64,
		version: TagVersion,
		event: TagEvent,
		operation_id: Option<Uuid>,
	) -> Result<ExtendedTagEntry, StoreError>;

	async fn update_query_status(
		&self,
		key: i64,
		version: TagVersion,
		query_status: QueryStatus,
	) -> Result<ExtendedTagEntry, StoreError>;

	/// Removes an entry in status [`ExtendedTagStatus::Deleting`] together with its index rows
	/// and recorded errors.
	async fn delete_tag(&self, key: i64, version: TagVersion) -> Result<(), StoreError>;
}

const SELECT_TAGS: &str = "SELECT tag_key, tag_path, tag_vr, tag_private_creator, tag_level, \
	tag_status, query_status, error_count, operation_id, version FROM extended_query_tag";

#[derive(Debug, Clone)]
pub struct SqliteExtendedTagStore {
	database: Database,
}

impl SqliteExtendedTagStore {
	pub const fn new(database: Database) -> Self {
		Self { database }
	}
}

fn entry_from_row(row: &SqliteRow) -> Result<ExtendedTagEntry, StoreError> {
	const TABLE: &str = "extended_query_tag";

	let path: String = row.try_get("tag_path")?;
	let tag = parse_hex_tag(&path)
		.ok_or_else(|| StoreError::invalid_row(TABLE, format!("invalid path '{path}'")))?;
	let vr: String = row.try_get("tag_vr")?;
	let vr = parse_vr_code(&vr)
		.ok_or_else(|| StoreError::invalid_row(TABLE, format!("invalid VR '{vr}'")))?;
	let level = QueryTagLevel::from_code(row.try_get("tag_level")?)
		.ok_or_else(|| StoreError::invalid_row(TABLE, "invalid level"))?;
	let status = ExtendedTagStatus::from_code(row.try_get("tag_status")?)
		.ok_or_else(|| StoreError::invalid_row(TABLE, "invalid status"))?;
	let query_status = QueryStatus::from_code(row.try_get("query_status")?)
		.ok_or_else(|| StoreError::invalid_row(TABLE, "invalid query status"))?;
	let operation_id = row
		.try_get::<Option<String>, _>("operation_id")?
		.map(|id| Uuid::parse_str(&id))
		.transpose()
		.map_err(|err| StoreError::invalid_row(TABLE, err.to_string()))?;
	let version: Vec<u8> = row.try_get("version")?;
	let version = TagVersion::from_bytes(&version)
		.ok_or_else(|| StoreError::invalid_row(TABLE, "invalid version token"))?;

	Ok(ExtendedTagEntry {
		key: row.try_get("tag_key")?,
		tag,
		path,
		vr,
		private_creator: row.try_get("tag_private_creator")?,
		level,
		status,
		query_status,
		error_count: row.try_get("error_count")?,
		operation_id,
		version,
	})
}

async fn fetch_tag(
	conn: &mut SqliteConnection,
	key: i64,
) -> Result<Option<ExtendedTagEntry>, StoreError> {
	sqlx::query(&format!("{SELECT_TAGS} WHERE tag_key = ?"))
		.bind(key)
		.fetch_optional(conn)
		.await?
		.as_ref()
		.map(entry_from_row)
		.transpose()
}

/// Loads an entry and checks that `version` is still current.
async fn fetch_current(
	conn: &mut SqliteConnection,
	key: i64,
	version: TagVersion,
) -> Result<ExtendedTagEntry, StoreError> {
	let entry = fetch_tag(conn, key)
		.await?
		.ok_or(StoreError::TagNotFound { key })?;
	if entry.version == version {
		Ok(entry)
	} else {
		Err(StoreError::VersionConflict { key })
	}
}

fn map_unique_violation(err: sqlx::Error, path: &str) -> StoreError {
	match err.as_database_error() {
		Some(db_err) if db_err.is_unique_violation() => StoreError::TagAlreadyExists {
			path: path.to_owned(),
		},
		_ => StoreError::Database(err),
	}
}

#[async_trait]
impl ExtendedTagStore for SqliteExtendedTagStore {
	async fn list_tags(
		&self,
		limit: Option<usize>,
		offset: usize,
	) -> Result<Vec<ExtendedTagEntry>, StoreError> {
		// SQLite treats a negative limit as unbounded
		let limit = limit.map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
		let offset = i64::try_from(offset).unwrap_or(i64::MAX);
		let rows = sqlx::query(&format!("{SELECT_TAGS} ORDER BY tag_key LIMIT ? OFFSET ?"))
			.bind(limit)
			.bind(offset)
			.fetch_all(self.database.pool())
			.await?;
		rows.iter().map(entry_from_row).collect()
	}

	async fn get_tags_by_path(&self, path: &str) -> Result<Vec<ExtendedTagEntry>, StoreError> {
		let rows = sqlx::query(&format!("{SELECT_TAGS} WHERE tag_path = ? ORDER BY tag_key"))
			.bind(path)
			.fetch_all(self.database.pool())
			.await?;
		rows.iter().map(entry_from_row).collect()
	}

	async fn get_tag(&self, key: i64) -> Result<Option<ExtendedTagEntry>, StoreError> {
		let mut conn = self.database.pool().acquire().await?;
		fetch_tag(&mut conn, key).await
	}

	async fn add_tags(
		&self,
		tags: &[ValidatedTag],
		operation_id: Option<Uuid>,
		max_allowed_count: usize,
	) -> Result<Vec<ExtendedTagEntry>, StoreError> {
		let mut tx = self.database.pool().begin().await?;

		let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM extended_query_tag")
			.fetch_one(&mut *tx)
			.await?;
		if usize::try_from(count).unwrap_or(usize::MAX) + tags.len() > max_allowed_count {
			return Err(StoreError::LimitExceeded {
				limit: max_allowed_count,
			});
		}

		let mut keys = Vec::with_capacity(tags.len());
		for tag in tags {
			let version = next_version(&mut tx).await?;
			let key: i64 = sqlx::query_scalar(
				"INSERT INTO extended_query_tag (tag_path, tag_vr, tag_private_creator, tag_level, \
				tag_status, query_status, error_count, operation_id, version) \
				VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?) RETURNING tag_key",
			)
			.bind(&tag.path)
			.bind(vr_code(tag.vr))
			.bind(tag.private_creator.as_deref())
			.bind(tag.level.code())
			.bind(ExtendedTagStatus::Adding.code())
			.bind(QueryStatus::Enabled.code())
			.bind(operation_id.map(|id| id.to_string()))
			.bind(version.as_bytes().as_slice())
			.fetch_one(&mut *tx)
			.await
			.map_err(|err| map_unique_violation(err, &tag.path))?;
			keys.push(key);
		}

		let mut entries = Vec::with_capacity(keys.len());
		for key in keys {
			entries.extend(fetch_tag(&mut tx, key).await?);
		}
		tx.commit().await?;

		info!(count = entries.len(), operation_id = ?operation_id, "Added extended query tags");
		Ok(entries)
	}

	async fn update_status(
		&self,
		key: i64,
		version: TagVersion,
		event: TagEvent,
		operation_id: Option<Uuid>,
	) -> Result<ExtendedTagEntry, StoreError> {
		let mut tx = self.database.pool().begin().await?;
		let entry = fetch_current(&mut tx, key, version).await?;
		let status = entry.status.apply(event)?;
		let next = next_version(&mut tx).await?;

		let result = sqlx::query(
			"UPDATE extended_query_tag \
			SET tag_status = ?, operation_id = COALESCE(?, operation_id), version = ? \
			WHERE tag_key = ? AND version = ?",
		)
		.bind(status.code())
		.bind(operation_id.map(|id| id.to_string()))
		.bind(next.as_bytes().as_slice())
		.bind(key)
		.bind(version.as_bytes().as_slice())
		.execute(&mut *tx)
		.await?;
		if result.rows_affected() == 0 {
			return Err(StoreError::VersionConflict { key });
		}

		let updated = fetch_tag(&mut tx, key)
			.await?
			.ok_or(StoreError::TagNotFound { key })?;
		tx.commit().await?;

		debug!(tag = %updated.path, from = %entry.status, to = %updated.status, "Updated extended query tag status");
		Ok(updated)
	}

	async fn update_query_status(
		&self,
		key: i64,
		version: TagVersion,
		query_status: QueryStatus,
	) -> Result<ExtendedTagEntry, StoreError> {
		let mut tx = self.database.pool().begin().await?;
		let entry = fetch_current(&mut tx, key, version).await?;
		if entry.status == ExtendedTagStatus::Deleting {
			return Err(StoreError::TagNotFound { key });
		}
		let next = next_version(&mut tx).await?;

		let result = sqlx::query(
			"UPDATE extended_query_tag SET query_status = ?, version = ? \
			WHERE tag_key = ? AND version = ?",
		)
		.bind(query_status.code())
		.bind(next.as_bytes().as_slice())
		.bind(key)
		.bind(version.as_bytes().as_slice())
		.execute(&mut *tx)
		.await?;
		if result.rows_affected() == 0 {
			return Err(StoreError::VersionConflict { key });
		}

		let updated = fetch_tag(&mut tx, key)
			.await?
			.ok_or(StoreError::TagNotFound { key })?;
		tx.commit().await?;
		Ok(updated)
	}

	async fn delete_tag(&self, key: i64, version: TagVersion) -> Result<(), StoreError> {
		let mut tx = self.database.pool().begin().await?;
		let entry = fetch_current(&mut tx, key, version).await?;
		if entry.status != ExtendedTagStatus::Deleting {
			return Err(StoreError::VersionConflict { key });
		}

		for data_type in IndexDataType::ALL {
			sqlx::query(&format!("DELETE FROM {} WHERE tag_key = ?", data_type.table()))
				.bind(key)
				.execute(&mut *tx)
				.await?;
		}
		sqlx::query("DELETE FROM extended_query_tag_error WHERE tag_key = ?")
			.bind(key)
			.execute(&mut *tx)
			.await?;
		let result = sqlx::query("DELETE FROM extended_query_tag WHERE tag_key = ? AND version = ?")
			.bind(key)
			.bind(version.as_bytes().as_slice())
			.execute(&mut *tx)
			.await?;
		if result.rows_affected() == 0 {
			return Err(StoreError::VersionConflict { key });
		}
		tx.commit().await?;

		info!(tag = %entry.path, "Deleted extended query tag");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::SchemaVersion;
	use dicom::core::VR;
	use dicom::dictionary_std::tags;

	fn validated(path: &str, vr: VR, level: QueryTagLevel) -> ValidatedTag {
		ValidatedTag {
			tag: parse_hex_tag(path).unwrap(),
			path: path.to_owned(),
			vr,
			private_creator: None,
			level,
		}
	}

	async fn store() -> SqliteExtendedTagStore {
		let database = Database::in_memory(SchemaVersion::CURRENT).await.unwrap();
		SqliteExtendedTagStore::new(database)
	}

	#[tokio::test]
	async fn add_and_read_back() {
		let store = store().await;
		let operation_id = Uuid::new_v4();
		let added = store
			.add_tags(
				&[validated("00180015", VR::CS, QueryTagLevel::Series)],
				Some(operation_id),
				128,
			)
			.await
			.unwrap();

		assert_eq!(added.len(), 1);
		let entry = &added[0];
		assert_eq!(entry.tag, tags::BODY_PART_EXAMINED);
		assert_eq!(entry.vr, VR::CS);
		assert_eq!(entry.status, ExtendedTagStatus::Adding);
		assert_eq!(entry.query_status, QueryStatus::Enabled);
		assert_eq!(entry.operation_id, Some(operation_id));

		assert_eq!(store.get_tag(entry.key).await.unwrap().as_ref(), Some(entry));
		assert_eq!(store.get_tags_by_path("00180015").await.unwrap(), added);
	}

	#[tokio::test]
	async fn reject_duplicate_path() {
		let store = store().await;
		let tag = validated("00180015", VR::CS, QueryTagLevel::Series);
		store.add_tags(&[tag.clone()], None, 128).await.unwrap();

		let result = store.add_tags(&[tag], None, 128).await;
		assert!(matches!(result, Err(StoreError::TagAlreadyExists { .. })));
		assert_eq!(store.list_tags(None, 0).await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn enforce_limit_atomically() {
		let store = store().await;
		let result = store
			.add_tags(
				&[
					validated("00180015", VR::CS, QueryTagLevel::Series),
					validated("00101030", VR::DS, QueryTagLevel::Study),
				],
				None,
				1,
			)
			.await;
		assert!(matches!(result, Err(StoreError::LimitExceeded { limit: 1 })));
		assert!(store.list_tags(None, 0).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn stale_version_is_a_conflict() {
		let store = store().await;
		let added = store
			.add_tags(&[validated("00180015", VR::CS, QueryTagLevel::Series)], None, 128)
			.await
			.unwrap();
		let stale = added[0].version;

		let ready = store
			.update_status(added[0].key, stale, TagEvent::IndexingCompleted, None)
			.await
			.unwrap();
		assert_eq!(ready.status, ExtendedTagStatus::Ready);
		assert!(ready.version > stale);

		let result = store
			.update_query_status(added[0].key, stale, QueryStatus::Disabled)
			.await;
		assert!(matches!(result, Err(StoreError::VersionConflict { .. })));
	}

	#[tokio::test]
	async fn invalid_transition_is_rejected() {
		let store = store().await;
		let added = store
			.add_tags(&[validated("00180015", VR::CS, QueryTagLevel::Series)], None, 128)
			.await
			.unwrap();
		let ready = store
			.update_status(added[0].key, added[0].version, TagEvent::IndexingCompleted, None)
			.await
			.unwrap();

		let result = store
			.update_status(ready.key, ready.version, TagEvent::IndexingCompleted, None)
			.await;
		assert!(matches!(result, Err(StoreError::InvalidTransition(_))));
	}

	#[tokio::test]
	async fn delete_requires_deleting_status() {
		let store = store().await;
		let added = store
			.add_tags(&[validated("00180015", VR::CS, QueryTagLevel::Series)], None, 128)
			.await
			.unwrap();
		let entry = &added[0];
		assert!(store.delete_tag(entry.key, entry.version).await.is_err());

		let deleting = store
			.update_status(entry.key, entry.version, TagEvent::DeleteRequested, None)
			.await
			.unwrap();
		store.delete_tag(deleting.key, deleting.version).await.unwrap();
		assert_eq!(store.get_tag(entry.key).await.unwrap(), None);
	}

	#[tokio::test]
	async fn list_pages() {
		let store = store().await;
		store
			.add_tags(
				&[
					validated("00180015", VR::CS, QueryTagLevel::Series),
					validated("00101030", VR::DS, QueryTagLevel::Study),
					validated("00081090", VR::LO, QueryTagLevel::Series),
				],
				None,
				128,
			)
			.await
			.unwrap();

		let page = store.list_tags(Some(2), 1).await.unwrap();
		let paths: Vec<_> = page.iter().map(|entry| entry.path.as_str()).collect();
		assert_eq!(paths, ["00101030", "00081090"]);
	}
}
