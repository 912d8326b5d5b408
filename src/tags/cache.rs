use crate::query::tag::{core_query_tags, QueryTag};
use crate::tags::{ExtendedTagStatus, ExtendedTagStore, StoreError};
use crate::types::QueryTagLevel;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Request-scoped snapshot of the query tags.
///
/// The catalog is read at most once per cache instance, so a single logical operation sees a
/// consistent set of tags without repeated round trips to the store. Create a new cache for
/// every request.
#[derive(Clone)]
pub struct QueryTagCache {
	store: Arc<dyn ExtendedTagStore>,
	snapshot: Arc<OnceCell<Vec<QueryTag>>>,
}

impl QueryTagCache {
	pub fn new(store: Arc<dyn ExtendedTagStore>) -> Self {
		Self {
			store,
			snapshot: Arc::new(OnceCell::new()),
		}
	}

	/// Returns the core query tags and every extended query tag that is not being deleted.
	pub async fn all_query_tags(&self) -> Result<&[QueryTag], StoreError> {
		let tags = self
			.snapshot
			.get_or_try_init(|| async {
				let extended = self.store.list_tags(None, 0).await?;
				let mut tags = core_query_tags();
				tags.extend(
					extended
						.into_iter()
						.filter(|entry| entry.status != ExtendedTagStatus::Deleting)
						.map(QueryTag::from_extended),
				);
				Ok::<_, StoreError>(tags)
			})
			.await?;
		Ok(tags)
	}

	/// Returns the query tags that may be used at `level`.
	pub async fn queryable_tags(&self, level: QueryTagLevel) -> Result<Vec<QueryTag>, StoreError> {
		let tags = self.all_query_tags().await?;
		Ok(queryable_at(tags, level).cloned().collect())
	}
}

/// Filters tags owned by `level` or a coarser level.
pub fn queryable_at(tags: &[QueryTag], level: QueryTagLevel) -> impl Iterator<Item = &QueryTag> {
	tags.iter().filter(move |tag| tag.level <= level)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::{Database, SchemaVersion};
	use crate::tags::path::parse_hex_tag;
	use crate::tags::{SqliteExtendedTagStore, TagEvent, ValidatedTag};
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

	async fn store() -> Arc<SqliteExtendedTagStore> {
		let database = Database::in_memory(SchemaVersion::CURRENT).await.unwrap();
		Arc::new(SqliteExtendedTagStore::new(database))
	}

	#[tokio::test]
	async fn filter_by_level() {
		let store = store().await;
		store
			.add_tags(
				&[
					validated("00180015", VR::CS, QueryTagLevel::Series),
					validated("00101030", VR::DS, QueryTagLevel::Study),
				],
				None,
				128,
			)
			.await
			.unwrap();
		let cache = QueryTagCache::new(store);

		let study = cache.queryable_tags(QueryTagLevel::Study).await.unwrap();
		assert!(study.iter().all(|tag| tag.level == QueryTagLevel::Study));
		assert!(study.iter().any(|tag| tag.tag == tags::PATIENT_WEIGHT));
		assert!(!study.iter().any(|tag| tag.tag == tags::BODY_PART_EXAMINED));

		let series = cache.queryable_tags(QueryTagLevel::Series).await.unwrap();
		assert!(series.iter().any(|tag| tag.tag == tags::BODY_PART_EXAMINED));
		assert!(series.iter().any(|tag| tag.tag == tags::PATIENT_WEIGHT));
		assert!(!series.iter().any(|tag| tag.tag == tags::SOP_INSTANCE_UID));
	}

	#[tokio::test]
	async fn exclude_deleting_tags() {
		let store = store().await;
		let added = store
			.add_tags(&[validated("00180015", VR::CS, QueryTagLevel::Series)], None, 128)
			.await
			.unwrap();
		store
			.update_status(added[0].key, added[0].version, TagEvent::DeleteRequested, None)
			.await
			.unwrap();

		let cache = QueryTagCache::new(store);
		let tags = cache.all_query_tags().await.unwrap();
		assert!(tags.iter().all(|tag| !tag.is_extended()));
	}

	#[tokio::test]
	async fn snapshot_is_read_once() {
		let store = store().await;
		let cache = QueryTagCache::new(store.clone());
		let before = cache.all_query_tags().await.unwrap().len();

		store
			.add_tags(&[validated("00180015", VR::CS, QueryTagLevel::Series)], None, 128)
			.await
			.unwrap();

		assert_eq!(cache.all_query_tags().await.unwrap().len(), before);
		assert_eq!(
			QueryTagCache::new(store).all_query_tags().await.unwrap().len(),
			before + 1
		);
	}
}
