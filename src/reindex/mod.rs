//! Back-filling of the index tables for newly registered extended query tags.
//!
//! The pipeline walks the stored instances in descending watermark order, one batch at a time,
//! and writes the values of the reindexed tags into the index tables.

pub mod operation;
pub mod writer;

pub use operation::{Operation, OperationStatus, OperationStore};
pub use writer::{extract_value, ExtractionError, IndexWriter};

use crate::store::{ExtendedTagErrorRecord, LoaderError, StoreError};
use crate::tags::ExtendedTagEntry;
use crate::types::{InstanceIdentifier, PartitionKey, Watermark};
use async_trait::async_trait;
use dicom::object::InMemDicomObject;
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Enumerates stored instances for the pipeline.
#[async_trait]
pub trait InstanceEnumerator: Send + Sync {
	/// Returns the lowest and highest watermark of the stored instances, if there are any.
	async fn watermark_range(
		&self,
		partition: Option<PartitionKey>,
	) -> Result<Option<RangeInclusive<Watermark>>, StoreError>;

	/// Returns up to `batch_size` instances with a watermark of at most `max_watermark`,
	/// ordered by descending watermark.
	async fn list_instances_descending(
		&self,
		partition: Option<PartitionKey>,
		max_watermark: Watermark,
		batch_size: usize,
	) -> Result<Vec<InstanceIdentifier>, StoreError>;
}

/// Loads the full attribute set of a stored instance.
#[async_trait]
pub trait AttributeLoader: Send + Sync {
	async fn load(&self, instance: &InstanceIdentifier) -> Result<InMemDicomObject, LoaderError>;
}

/// Append-only log of per-instance failures.
#[async_trait]
pub trait ExceptionLog: Send + Sync {
	async fn record(
		&self,
		instance: &InstanceIdentifier,
		tag: &ExtendedTagEntry,
		operation_id: Uuid,
		batch: u64,
		error: &str,
	) -> Result<(), StoreError>;

	/// Lists the recorded failures of a tag, newest instance first.
	async fn list(
		&self,
		tag_key: i64,
		limit: usize,
		offset: usize,
	) -> Result<Vec<ExtendedTagErrorRecord>, StoreError>;
}

#[derive(Debug, Error)]
pub enum ReindexError {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("reindex operation was cancelled")]
	Cancelled,
}

/// Progress of a running pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReindexProgress {
	pub batches: u64,
	pub instances: u64,
	pub failures: u64,
	pub percent_complete: u8,
}

pub struct ReindexPipeline {
	enumerator: Arc<dyn InstanceEnumerator>,
	loader: Arc<dyn AttributeLoader>,
	writer: Arc<dyn IndexWriter>,
	exceptions: Arc<dyn ExceptionLog>,
	batch_size: usize,
}

impl ReindexPipeline {
	pub fn new(
		enumerator: Arc<dyn InstanceEnumerator>,
		loader: Arc<dyn AttributeLoader>,
		writer: Arc<dyn IndexWriter>,
		exceptions: Arc<dyn ExceptionLog>,
		batch_size: usize,
	) -> Self {
		Self {
			enumerator,
			loader,
			writer,
			exceptions,
			batch_size: batch_size.max(1),
		}
	}

	/// Indexes `tags` for every instance within `range`.
	///
	/// Cancellation is checked between batches only. Failures of single instances are recorded
	/// in the exception log and do not stop the pipeline.
	#[instrument(skip_all, fields(operation_id = %operation_id))]
	pub async fn run<F, Fut>(
		&self,
		operation_id: Uuid,
		tags: &[ExtendedTagEntry],
		partition: Option<PartitionKey>,
		range: RangeInclusive<Watermark>,
		cancel: &watch::Receiver<bool>,
		mut on_progress: F,
	) -> Result<ReindexProgress, ReindexError>
	where
		F: FnMut(ReindexProgress) -> Fut + Send,
		Fut: Future<Output = ()> + Send,
	{
		let mut progress = ReindexProgress::default();
		let mut cursor = *range.end();

		loop {
			if *cancel.borrow() {
				warn!(batch = progress.batches, "Reindex operation cancelled");
				return Err(ReindexError::Cancelled);
			}

			let instances = self
				.enumerator
				.list_instances_descending(partition, cursor, self.batch_size)
				.await?;
			let Some(lowest) = instances.iter().map(|instance| instance.watermark).min() else {
				break;
			};
			progress.batches += 1;

			for instance in &instances {
				progress.failures += self
					.index_instance(operation_id, progress.batches, instance, tags)
					.await?;
			}
			progress.instances += instances.len() as u64;
			progress.percent_complete = percent_complete(&range, lowest);
			debug!(
				batch = progress.batches,
				watermark = lowest,
				count = instances.len(),
				"Indexed batch"
			);
			on_progress(progress).await;

			if instances.len() < self.batch_size || lowest <= *range.start() {
				break;
			}
			cursor = lowest - 1;
		}

		progress.percent_complete = 100;
		info!(
			batches = progress.batches,
			instances = progress.instances,
			failures = progress.failures,
			"Reindex operation completed"
		);
		Ok(progress)
	}

	/// Indexes a single instance and returns the number of recorded failures.
	async fn index_instance(
		&self,
		operation_id: Uuid,
		batch: u64,
		instance: &InstanceIdentifier,
		tags: &[ExtendedTagEntry],
	) -> Result<u64, ReindexError> {
		let dataset = match self.loader.load(instance).await {
			Ok(dataset) => dataset,
			Err(err) => {
				warn!(%instance, error = %err, "Failed to load instance");
				let message = err.to_string();
				for tag in tags {
					self.exceptions
						.record(instance, tag, operation_id, batch, &message)
						.await?;
				}
				return Ok(tags.len() as u64);
			}
		};

		let mut failures = 0;
		for tag in tags {
			match extract_value(&dataset, tag) {
				Ok(Some(value)) => self.writer.upsert(instance, tag, &value).await?,
				Ok(None) => {}
				Err(err) => {
					warn!(%instance, tag = %tag.path, error = %err, "Failed to extract value");
					self.exceptions
						.record(instance, tag, operation_id, batch, &err.to_string())
						.await?;
					failures += 1;
				}
			}
		}
		Ok(failures)
	}
}

fn percent_complete(range: &RangeInclusive<Watermark>, lowest: Watermark) -> u8 {
	let total = (range.end() - range.start() + 1).max(1);
	let done = (range.end() - lowest + 1).clamp(0, total);
	u8::try_from(done * 100 / total).unwrap_or(100)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tags::{ExtendedTagStatus, QueryStatus, TagVersion};
	use crate::types::QueryTagLevel;
	use crate::values::IndexValue;
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::dictionary_std::tags;
	use std::collections::HashMap;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use tokio::sync::Mutex;

	struct FakeEnumerator {
		instances: Vec<InstanceIdentifier>,
		calls: AtomicUsize,
	}

	#[async_trait]
	impl InstanceEnumerator for FakeEnumerator {
		async fn watermark_range(
			&self,
			_partition: Option<PartitionKey>,
		) -> Result<Option<RangeInclusive<Watermark>>, StoreError> {
			let min = self.instances.iter().map(|i| i.watermark).min();
			let max = self.instances.iter().map(|i| i.watermark).max();
			Ok(min.zip(max).map(|(min, max)| min..=max))
		}

		async fn list_instances_descending(
			&self,
			_partition: Option<PartitionKey>,
			max_watermark: Watermark,
			batch_size: usize,
		) -> Result<Vec<InstanceIdentifier>, StoreError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			let mut instances: Vec<_> = self
				.instances
				.iter()
				.filter(|instance| instance.watermark <= max_watermark)
				.cloned()
				.collect();
			instances.sort_by(|a, b| b.watermark.cmp(&a.watermark));
			instances.truncate(batch_size);
			Ok(instances)
		}
	}

	/// Serves a body part for every instance except those listed as broken.
	struct FakeLoader {
		broken: Vec<Watermark>,
	}

	#[async_trait]
	impl AttributeLoader for FakeLoader {
		async fn load(
			&self,
			instance: &InstanceIdentifier,
		) -> Result<InMemDicomObject, LoaderError> {
			let weight = if self.broken.contains(&instance.watermark) {
				String::from("not a number")
			} else {
				instance.watermark.to_string()
			};
			Ok(InMemDicomObject::from_element_iter([
				DataElement::new(tags::BODY_PART_EXAMINED, VR::CS, PrimitiveValue::from("HEAD")),
				DataElement::new(tags::PATIENT_WEIGHT, VR::DS, PrimitiveValue::from(weight)),
			]))
		}
	}

	#[derive(Default)]
	struct FakeWriter {
		values: Mutex<HashMap<(i64, Watermark), Vec<IndexValue>>>,
	}

	#[async_trait]
	impl IndexWriter for FakeWriter {
		async fn upsert(
			&self,
			instance: &InstanceIdentifier,
			tag: &ExtendedTagEntry,
			value: &IndexValue,
		) -> Result<(), StoreError> {
			self.values
				.lock()
				.await
				.entry((tag.key, instance.watermark))
				.or_default()
				.push(value.clone());
			Ok(())
		}
	}

	#[derive(Default)]
	struct FakeExceptionLog {
		records: Mutex<Vec<(Watermark, i64, u64)>>,
	}

	#[async_trait]
	impl ExceptionLog for FakeExceptionLog {
		async fn record(
			&self,
			instance: &InstanceIdentifier,
			tag: &ExtendedTagEntry,
			_operation_id: Uuid,
			batch: u64,
			_error: &str,
		) -> Result<(), StoreError> {
			self.records
				.lock()
				.await
				.push((instance.watermark, tag.key, batch));
			Ok(())
		}

		async fn list(
			&self,
			_tag_key: i64,
			_limit: usize,
			_offset: usize,
		) -> Result<Vec<ExtendedTagErrorRecord>, StoreError> {
			Ok(Vec::new())
		}
	}

	fn instances(count: i64) -> Vec<InstanceIdentifier> {
		(1..=count)
			.map(|watermark| InstanceIdentifier {
				partition_key: 1,
				study_instance_uid: String::from("1.2"),
				series_instance_uid: format!("1.2.{watermark}"),
				sop_instance_uid: format!("1.2.{watermark}.1"),
				watermark,
			})
			.collect()
	}

	fn tag(key: i64, tag: dicom::core::Tag, vr: VR) -> ExtendedTagEntry {
		ExtendedTagEntry {
			key,
			tag,
			path: crate::tags::path::format_tag(tag),
			vr,
			private_creator: None,
			level: QueryTagLevel::Series,
			status: ExtendedTagStatus::Adding,
			query_status: QueryStatus::Enabled,
			error_count: 0,
			operation_id: None,
			version: TagVersion::from_sequence(1),
		}
	}

	struct Harness {
		enumerator: Arc<FakeEnumerator>,
		writer: Arc<FakeWriter>,
		exceptions: Arc<FakeExceptionLog>,
		pipeline: ReindexPipeline,
	}

	fn harness(count: i64, batch_size: usize, broken: Vec<Watermark>) -> Harness {
		let enumerator = Arc::new(FakeEnumerator {
			instances: instances(count),
			calls: AtomicUsize::new(0),
		});
		let writer = Arc::new(FakeWriter::default());
		let exceptions = Arc::new(FakeExceptionLog::default());
		let pipeline = ReindexPipeline::new(
			enumerator.clone(),
			Arc::new(FakeLoader { broken }),
			writer.clone(),
			exceptions.clone(),
			batch_size,
		);
		Harness {
			enumerator,
			writer,
			exceptions,
			pipeline,
		}
	}

	async fn run(harness: &Harness, tags: &[ExtendedTagEntry]) -> Result<ReindexProgress, ReindexError> {
		let range = harness
			.enumerator
			.watermark_range(None)
			.await
			.unwrap()
			.unwrap();
		let (_sender, cancel) = watch::channel(false);
		harness
			.pipeline
			.run(Uuid::new_v4(), tags, None, range, &cancel, |_| async {})
			.await
	}

	#[tokio::test]
	async fn terminate_after_ceil_batches() {
		for (count, batch_size) in [(10, 3), (9, 3), (1, 5), (5, 1), (7, 7)] {
			let harness = harness(count, batch_size, vec![]);
			let tags = [tag(1, tags::BODY_PART_EXAMINED, VR::CS)];
			let progress = run(&harness, &tags).await.unwrap();

			let expected_calls = (count as usize).div_ceil(batch_size);
			assert_eq!(
				harness.enumerator.calls.load(Ordering::SeqCst),
				expected_calls,
				"{count} instances in batches of {batch_size}"
			);
			assert_eq!(progress.batches, expected_calls as u64);
			assert_eq!(progress.instances, count as u64);
			assert_eq!(progress.percent_complete, 100);

			let values = harness.writer.values.lock().await;
			assert_eq!(values.len(), count as usize);
			assert!(values.values().all(|written| written.len() == 1));
		}
	}

	#[tokio::test]
	async fn failures_do_not_abort_the_batch() {
		let harness = harness(6, 4, vec![5]);
		let tags = [
			tag(1, tags::BODY_PART_EXAMINED, VR::CS),
			tag(2, tags::PATIENT_WEIGHT, VR::FD),
		];
		let progress = run(&harness, &tags).await.unwrap();

		assert_eq!(progress.failures, 1);
		assert_eq!(*harness.exceptions.records.lock().await, vec![(5, 2, 1)]);

		let values = harness.writer.values.lock().await;
		// every instance got its body part, all but the broken one their weight
		assert_eq!(values.keys().filter(|(key, _)| *key == 1).count(), 6);
		assert_eq!(values.keys().filter(|(key, _)| *key == 2).count(), 5);
		assert!(!values.contains_key(&(2, 5)));
	}

	#[tokio::test]
	async fn cancellation_is_checked_between_batches() {
		let harness = harness(6, 2, vec![]);
		let tags = [tag(1, tags::BODY_PART_EXAMINED, VR::CS)];
		let (sender, cancel) = watch::channel(false);

		let result = harness
			.pipeline
			.run(Uuid::new_v4(), &tags, None, 1..=6, &cancel, |progress| {
				if progress.batches == 1 {
					sender.send_replace(true);
				}
				async {}
			})
			.await;

		assert!(matches!(result, Err(ReindexError::Cancelled)));
		assert_eq!(harness.enumerator.calls.load(Ordering::SeqCst), 1);
		assert_eq!(harness.writer.values.lock().await.len(), 2);
	}

	#[test]
	fn progress_percentage() {
		assert_eq!(percent_complete(&(1..=10), 10), 10);
		assert_eq!(percent_complete(&(1..=10), 6), 50);
		assert_eq!(percent_complete(&(1..=10), 1), 100);
		assert_eq!(percent_complete(&(5..=5), 5), 100);
	}
}
