use crate::config::ExtendedTagsConfig;
use crate::reindex::{
	ExceptionLog, InstanceEnumerator, Operation, OperationStatus, OperationStore, ReindexPipeline,
};
use crate::store::{ExtendedTagErrorRecord, StoreError};
use crate::tags::path::{format_tag, parse_tag_path};
use crate::tags::{
	AddExtendedTagEntry, ExtendedTagEntry, ExtendedTagStore, QueryStatus, TagEvent,
	ValidationErrors, Validator,
};
use crate::types::{PartitionKey, Watermark};
use serde::Serialize;
use std::ops::RangeInclusive;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExtendedTagError {
	#[error(transparent)]
	Validation(#[from] ValidationErrors),
	#[error("extended query tag '{path}' does not exist")]
	NotFound { path: String },
	#[error("extended query tag '{path}' is registered for several private creators")]
	Ambiguous { path: String },
	#[error("{0}")]
	Conflict(String),
	#[error("extended query tag '{path}' is still owned by running operation {operation_id}")]
	Busy { path: String, operation_id: Uuid },
	#[error("operation {operation_id} owning extended query tag '{path}' failed")]
	OperationFailed { path: String, operation_id: Uuid },
	#[error(transparent)]
	Backend(StoreError),
}

impl From<StoreError> for ExtendedTagError {
	fn from(err: StoreError) -> Self {
		match err {
			StoreError::VersionConflict { .. }
			| StoreError::TagAlreadyExists { .. }
			| StoreError::LimitExceeded { .. }
			| StoreError::InvalidTransition(_) => Self::Conflict(err.to_string()),
			StoreError::TagNotFound { key } => Self::NotFound {
				path: key.to_string(),
			},
			err => Self::Backend(err),
		}
	}
}

/// Reference to a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationReference {
	pub id: Uuid,
	pub href: String,
}

impl OperationReference {
	pub fn new(id: Uuid) -> Self {
		Self {
			id,
			href: format!("/operations/{id}"),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
	/// Indexing continues in the background.
	Accepted(OperationReference),
	/// Nothing had to be indexed, the tags are ready.
	Completed(Vec<ExtendedTagEntry>),
}

/// Lifecycle management of extended query tags.
#[derive(Clone)]
pub struct ExtendedTagService {
	store: Arc<dyn ExtendedTagStore>,
	enumerator: Arc<dyn InstanceEnumerator>,
	exceptions: Arc<dyn ExceptionLog>,
	pipeline: Arc<ReindexPipeline>,
	operations: OperationStore,
	validator: Validator,
	config: ExtendedTagsConfig,
	partition: Option<PartitionKey>,
}

impl ExtendedTagService {
	pub fn new(
		store: Arc<dyn ExtendedTagStore>,
		enumerator: Arc<dyn InstanceEnumerator>,
		exceptions: Arc<dyn ExceptionLog>,
		pipeline: Arc<ReindexPipeline>,
		operations: OperationStore,
		config: ExtendedTagsConfig,
		partition: Option<PartitionKey>,
	) -> Self {
		let validator = Validator::new(config.max_allowed_count, config.max_private_creator_length);
		Self {
			store,
			enumerator,
			exceptions,
			pipeline,
			operations,
			validator,
			config,
			partition,
		}
	}

	/// Registers new extended query tags.
	///
	/// The tags are persisted as `Adding` and a reindex operation is started for them. If no
	/// instances are stored yet, the tags become `Ready` right away.
	#[instrument(skip_all, fields(count = entries.len()))]
	pub async fn add(&self, entries: &[AddExtendedTagEntry]) -> Result<AddOutcome, ExtendedTagError> {
		let existing = self.store.list_tags(None, 0).await?;
		let validated = self.validator.validate(entries, &existing)?;

		// Registered before the watermark range is read, so that instances stored in between are
		// indexed by the ingest hook.
		let resources = validated.iter().map(|tag| tag.path.clone()).collect();
		let (operation, cancel) = self.operations.create(resources).await;
		let registered = async {
			let added = self
				.store
				.add_tags(&validated, Some(operation.id), self.config.max_allowed_count)
				.await?;
			let range = self.enumerator.watermark_range(self.partition).await?;
			Ok::<_, StoreError>((added, range))
		};
		let (added, range) = match registered.await {
			Ok(registered) => registered,
			Err(err) => {
				self.operations.fail(operation.id, err.to_string()).await;
				return Err(err.into());
			}
		};

		let Some(range) = range else {
			let ready = match self.complete_tags(&added).await {
				Ok(ready) => ready,
				Err(err) => {
					self.operations.fail(operation.id, err.to_string()).await;
					return Err(err.into());
				}
			};
			self.operations.complete(operation.id).await;
			info!(count = ready.len(), "Registered extended query tags without reindexing");
			return Ok(AddOutcome::Completed(ready));
		};

		self.spawn_reindex(operation.id, added, range, cancel);
		Ok(AddOutcome::Accepted(OperationReference::new(operation.id)))
	}

	/// Starts a new reindex operation for an already registered tag.
	#[instrument(skip(self))]
	pub async fn reindex(
		&self,
		path: &str,
		private_creator: Option<&str>,
	) -> Result<AddOutcome, ExtendedTagError> {
		let tag = self.resolve(path, private_creator).await?;

		let Some(range) = self.enumerator.watermark_range(self.partition).await? else {
			let tag = self
				.store
				.update_status(tag.key, tag.version, TagEvent::ReindexRequested, None)
				.await?;
			let tag = self
				.store
				.update_status(tag.key, tag.version, TagEvent::IndexingCompleted, None)
				.await?;
			return Ok(AddOutcome::Completed(vec![tag]));
		};

		let (operation, cancel) = self.operations.create(vec![tag.path.clone()]).await;
		let tag = match self
			.store
			.update_status(
				tag.key,
				tag.version,
				TagEvent::ReindexRequested,
				Some(operation.id),
			)
			.await
		{
			Ok(tag) => tag,
			Err(err) => {
				self.operations.fail(operation.id, err.to_string()).await;
				return Err(err.into());
			}
		};

		self.spawn_reindex(operation.id, vec![tag], range, cancel);
		Ok(AddOutcome::Accepted(OperationReference::new(operation.id)))
	}

	fn spawn_reindex(
		&self,
		operation_id: Uuid,
		tags: Vec<ExtendedTagEntry>,
		range: RangeInclusive<Watermark>,
		cancel: watch::Receiver<bool>,
	) {
		let service = self.clone();
		tokio::spawn(async move {
			service
				.run_reindex(operation_id, tags, range, cancel)
				.await;
		});
	}

	async fn run_reindex(
		&self,
		operation_id: Uuid,
		tags: Vec<ExtendedTagEntry>,
		range: RangeInclusive<Watermark>,
		cancel: watch::Receiver<bool>,
	) {
		let operations = self.operations.clone();
		let result = self
			.pipeline
			.run(operation_id, &tags, self.partition, range, &cancel, |progress| {
				let operations = operations.clone();
				async move {
					operations
						.report_progress(operation_id, progress.percent_complete)
						.await;
				}
			})
			.await;

		if let Err(err) = result {
			self.operations.fail(operation_id, err.to_string()).await;
			return;
		}
		match self.complete_tags(&tags).await {
			Ok(_) => self.operations.complete(operation_id).await,
			Err(err) => self.operations.fail(operation_id, err.to_string()).await,
		}
	}

	/// Marks indexed tags as ready, skipping tags deleted in the meantime.
	async fn complete_tags(
		&self,
		tags: &[ExtendedTagEntry],
	) -> Result<Vec<ExtendedTagEntry>, StoreError> {
		let mut ready = Vec::with_capacity(tags.len());
		for tag in tags {
			let Some(current) = self.store.get_tag(tag.key).await? else {
				continue;
			};
			if !current.status.is_indexing() {
				warn!(tag = %current.path, status = %current.status, "Extended query tag left indexing state during reindex");
				continue;
			}
			ready.push(
				self.store
					.update_status(current.key, current.version, TagEvent::IndexingCompleted, None)
					.await?,
			);
		}
		Ok(ready)
	}

	/// Removes an extended query tag and its index.
	///
	/// Waits for a running operation owning the tag to finish first. If that operation failed,
	/// the tag is kept, since its index may be inconsistent.
	#[instrument(skip(self))]
	pub async fn delete(
		&self,
		path: &str,
		private_creator: Option<&str>,
	) -> Result<(), ExtendedTagError> {
		let mut tag = self.resolve(path, private_creator).await?;

		let mut attempt = 0;
		while let Some(operation) = self.owning_operation(&tag).await {
			match operation.status {
				OperationStatus::Succeeded => break,
				OperationStatus::Failed => {
					return Err(ExtendedTagError::OperationFailed {
						path: tag.path,
						operation_id: operation.id,
					});
				}
				OperationStatus::Running if attempt >= self.config.delete_retry_count => {
					return Err(ExtendedTagError::Busy {
						path: tag.path,
						operation_id: operation.id,
					});
				}
				OperationStatus::Running => {
					attempt += 1;
					info!(tag = %tag.path, operation_id = %operation.id, attempt, "Waiting for operation before deleting");
					tokio::time::sleep(self.config.delete_retry_interval()).await;
					tag = self.reload(&tag, path).await?;
				}
			}
		}

		// Completing the operation advanced the version
		let tag = self.reload(&tag, path).await?;
		let deleting = self
			.store
			.update_status(tag.key, tag.version, TagEvent::DeleteRequested, None)
			.await?;
		self.store.delete_tag(deleting.key, deleting.version).await?;
		Ok(())
	}

	async fn reload(
		&self,
		tag: &ExtendedTagEntry,
		path: &str,
	) -> Result<ExtendedTagEntry, ExtendedTagError> {
		self.store
			.get_tag(tag.key)
			.await?
			.ok_or_else(|| ExtendedTagError::NotFound {
				path: path.to_owned(),
			})
	}

	async fn owning_operation(&self, tag: &ExtendedTagEntry) -> Option<Operation> {
		let operation_id = tag.operation_id?;
		self.operations.get(operation_id).await
	}

	pub async fn list(
		&self,
		limit: Option<usize>,
		offset: usize,
	) -> Result<Vec<ExtendedTagEntry>, ExtendedTagError> {
		Ok(self.store.list_tags(limit, offset).await?)
	}

	pub async fn get(
		&self,
		path: &str,
		private_creator: Option<&str>,
	) -> Result<ExtendedTagEntry, ExtendedTagError> {
		self.resolve(path, private_creator).await
	}

	pub async fn update_query_status(
		&self,
		path: &str,
		private_creator: Option<&str>,
		query_status: QueryStatus,
	) -> Result<ExtendedTagEntry, ExtendedTagError> {
		let tag = self.resolve(path, private_creator).await?;
		Ok(self
			.store
			.update_query_status(tag.key, tag.version, query_status)
			.await?)
	}

	pub async fn list_errors(
		&self,
		path: &str,
		private_creator: Option<&str>,
		limit: usize,
		offset: usize,
	) -> Result<Vec<ExtendedTagErrorRecord>, ExtendedTagError> {
		let tag = self.resolve(path, private_creator).await?;
		Ok(self.exceptions.list(tag.key, limit, offset).await?)
	}

	pub async fn operation(&self, id: Uuid) -> Option<Operation> {
		self.operations.get(id).await
	}

	/// Stops all running reindex operations after their current batch.
	pub fn shutdown(&self) {
		self.operations.cancel_all();
	}

	/// Finds the single catalog entry for a path given as keyword or `GGGGEEEE`.
	async fn resolve(
		&self,
		path: &str,
		private_creator: Option<&str>,
	) -> Result<ExtendedTagEntry, ExtendedTagError> {
		let not_found = || ExtendedTagError::NotFound {
			path: path.to_owned(),
		};
		let tag = parse_tag_path(path).map_err(|_| not_found())?;
		let mut candidates = self.store.get_tags_by_path(&format_tag(tag)).await?;
		if let Some(private_creator) = private_creator {
			candidates.retain(|entry| entry.private_creator.as_deref() == Some(private_creator));
		}

		match candidates.len() {
			0 => Err(not_found()),
			1 => Ok(candidates.remove(0)),
			_ => Err(ExtendedTagError::Ambiguous {
				path: path.to_owned(),
			}),
		}
	}
}
