//! Extended query tag indexing and QIDO-RS search for stored DICOM instances.
//!
//! Attributes beyond the built-in query tags can be registered at runtime. Registered tags are
//! indexed for all previously stored instances by a background reindex operation, after which
//! they can be used as search filters just like the core query tags.

pub mod api;
pub mod config;
pub mod query;
pub mod reindex;
pub mod store;
pub mod tags;
pub mod types;
pub mod values;

use crate::config::AppConfig;
use crate::query::{IndexQidoService, QidoService, QueryParser};
use crate::reindex::{AttributeLoader, IndexWriter, OperationStore, ReindexPipeline};
use crate::store::{Database, InstanceStore, SqliteExceptionLog, SqliteIndexWriter};
use crate::tags::{ExtendedTagService, ExtendedTagStore, SqliteExtendedTagStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
	pub instances: Arc<InstanceStore>,
	pub tags: ExtendedTagService,
	pub qido: Arc<dyn QidoService>,
}

impl AppState {
	/// Wires the services on top of `database`, reading stored instances through `loader`.
	pub fn new(config: &AppConfig, database: Database, loader: Arc<dyn AttributeLoader>) -> Self {
		let partition = config.storage.partition;
		let store: Arc<dyn ExtendedTagStore> =
			Arc::new(SqliteExtendedTagStore::new(database.clone()));
		let instances = Arc::new(InstanceStore::new(database.clone()));
		let exceptions = Arc::new(SqliteExceptionLog::new(database.clone()));
		let writer: Arc<dyn IndexWriter> = Arc::new(SqliteIndexWriter::new(database.clone()));

		let pipeline = Arc::new(ReindexPipeline::new(
			instances.clone(),
			loader.clone(),
			writer,
			exceptions.clone(),
			config.extended_tags.reindex_batch_size,
		));
		let tags = ExtendedTagService::new(
			store.clone(),
			instances.clone(),
			exceptions,
			pipeline,
			OperationStore::default(),
			config.extended_tags.clone(),
			Some(partition),
		);
		let qido = Arc::new(IndexQidoService::new(
			database,
			store,
			loader,
			QueryParser::new(config.qido.default_limit, config.qido.max_limit),
			partition,
		));

		Self {
			instances,
			tags,
			qido,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::SchemaVersion;
	use crate::tags::service::tests::MemoryLoader;
	use crate::tags::AddExtendedTagEntry;

	#[tokio::test]
	async fn services_share_the_database() {
		let database = Database::in_memory(SchemaVersion::CURRENT).await.unwrap();
		let config = AppConfig::defaults().unwrap();
		let state = AppState::new(&config, database.clone(), Arc::new(MemoryLoader::default()));

		state
			.tags
			.add(&[AddExtendedTagEntry::new("BodyPartExamined", None, "Series")])
			.await
			.unwrap();
		let registered = SqliteExtendedTagStore::new(database)
			.list_tags(None, 0)
			.await
			.unwrap();
		assert_eq!(registered.len(), 1);
		assert_eq!(registered[0].path, "00180015");
	}
}
