use crate::query::compiler::{CompileError, QueryCompiler};
use crate::query::parser::{QueryParameters, QueryParseError, QueryParser, QueryScope};
use crate::query::projector::ResultProjector;
use crate::reindex::AttributeLoader;
use crate::store::{Database, LoaderError, StoreError};
use crate::tags::{ExtendedTagStore, QueryTagCache};
use crate::types::{PartitionKey, QueryResource};
use async_trait::async_trait;
use dicom::object::InMemDicomObject;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Provides the functionality of a search transaction.
///
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.6.html>
#[async_trait]
pub trait QidoService: Send + Sync {
	async fn search(&self, request: SearchRequest) -> Result<SearchResponse, SearchError>;
}

pub struct SearchRequest {
	pub resource: QueryResource,
	pub scope: QueryScope,
	pub parameters: QueryParameters,
}

pub struct SearchResponse {
	pub stream: BoxStream<'static, Result<InMemDicomObject, SearchError>>,
	/// Filtered extended query tags whose index may be incomplete.
	pub erroneous_tags: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SearchError {
	#[error(transparent)]
	Parse(#[from] QueryParseError),
	#[error(transparent)]
	Compile(#[from] CompileError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	Loader(#[from] LoaderError),
}

/// Searches the relational index and projects the matches from their stored attributes.
pub struct IndexQidoService {
	database: Database,
	tags: Arc<dyn ExtendedTagStore>,
	loader: Arc<dyn AttributeLoader>,
	parser: QueryParser,
	partition_key: PartitionKey,
}

impl IndexQidoService {
	pub fn new(
		database: Database,
		tags: Arc<dyn ExtendedTagStore>,
		loader: Arc<dyn AttributeLoader>,
		parser: QueryParser,
		partition_key: PartitionKey,
	) -> Self {
		Self {
			database,
			tags,
			loader,
			parser,
			partition_key,
		}
	}
}

#[async_trait]
impl QidoService for IndexQidoService {
	#[instrument(skip_all, fields(resource = %request.resource))]
	async fn search(&self, request: SearchRequest) -> Result<SearchResponse, SearchError> {
		let cache = QueryTagCache::new(Arc::clone(&self.tags));
		let query_tags = Arc::new(cache.all_query_tags().await?.to_vec());

		let expression = Arc::new(self.parser.parse(
			&request.parameters,
			request.resource,
			&request.scope,
			&query_tags,
		)?);
		let compiled = QueryCompiler::new(self.database.schema_version())
			.compile(&expression, self.partition_key)?;
		let matches = compiled
			.fetch(self.database.pool())
			.await
			.map_err(StoreError::from)?;
		debug!(matches = matches.len(), "Executed search");

		let erroneous_tags = expression.erroneous_tags.clone();
		let loader = Arc::clone(&self.loader);
		let stream = futures::stream::iter(matches)
			.filter_map(move |instance| {
				let loader = Arc::clone(&loader);
				let expression = Arc::clone(&expression);
				let query_tags = Arc::clone(&query_tags);
				async move {
					match loader.load(&instance).await {
						Ok(dataset) => Some(Ok(
							ResultProjector::new(&expression, &query_tags).project(&dataset)
						)),
						// Deleted between the search and the projection
						Err(LoaderError::NotFound(_)) => {
							warn!(%instance, "Skipping match without stored attributes");
							None
						}
						Err(err) => Some(Err(SearchError::from(err))),
					}
				}
			})
			.boxed();

		Ok(SearchResponse {
			stream,
			erroneous_tags,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::instance::tests::dataset;
	use crate::tags::service::tests::{fixture, Fixture};
	use crate::tags::{AddExtendedTagEntry, AddOutcome, ExtendedTagStatus};
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::dictionary_std::tags;
	use futures::TryStreamExt;

	fn qido(fixture: &Fixture) -> IndexQidoService {
		IndexQidoService::new(
			fixture.database.clone(),
			fixture.tags.clone(),
			fixture.loader.clone(),
			QueryParser::new(100, 200),
			1,
		)
	}

	async fn store(fixture: &Fixture, series: &str, sop: &str, body_part: Option<&str>) {
		let extra = body_part
			.map(|value| {
				DataElement::new(tags::BODY_PART_EXAMINED, VR::CS, PrimitiveValue::from(value))
			})
			.into_iter()
			.collect();
		let dataset = dataset("1", series, sop, extra);
		let registered = fixture.tags.list_tags(None, 0).await.unwrap();
		fixture
			.instances
			.index_instance(1, &dataset, &registered)
			.await
			.unwrap();
		fixture.loader.insert(sop, dataset).await;
	}

	async fn search(
		service: &IndexQidoService,
		resource: QueryResource,
		query: &str,
	) -> Result<(Vec<InMemDicomObject>, Vec<String>), SearchError> {
		let response = service
			.search(SearchRequest {
				resource,
				scope: QueryScope::default(),
				parameters: QueryParameters::from_query(query),
			})
			.await?;
		let records: Vec<InMemDicomObject> = response.stream.try_collect().await?;
		Ok((records, response.erroneous_tags))
	}

	fn text(record: &InMemDicomObject, tag: dicom::core::Tag) -> String {
		record.get(tag).unwrap().to_str().unwrap().to_string()
	}

	#[tokio::test]
	async fn search_registered_series_attribute() {
		let fixture = fixture().await;
		let outcome = fixture
			.service
			.add(&[AddExtendedTagEntry::new("BodyPartExamined", None, "Series")])
			.await
			.unwrap();
		let AddOutcome::Completed(added) = outcome else {
			panic!("expected the tag to be ready without reindexing");
		};
		assert_eq!(added[0].status, ExtendedTagStatus::Ready);

		store(&fixture, "1.1", "1.1.1", Some("foo")).await;
		store(&fixture, "1.2", "1.2.1", Some("bar")).await;
		store(&fixture, "1.3", "1.3.1", Some("foo")).await;

		let (records, erroneous) = search(
			&qido(&fixture),
			QueryResource::AllSeries,
			"BodyPartExamined=foo",
		)
		.await
		.unwrap();

		assert!(erroneous.is_empty());
		let series: Vec<String> = records
			.iter()
			.map(|record| text(record, tags::SERIES_INSTANCE_UID))
			.collect();
		assert_eq!(series, vec!["1.3", "1.1"]);
		for record in &records {
			assert_eq!(text(record, tags::BODY_PART_EXAMINED), "foo");
			assert!(record.get(tags::SOP_INSTANCE_UID).is_none());
		}
	}

	#[tokio::test]
	async fn reindexing_tag_is_reported_erroneous() {
		let fixture = fixture().await;
		store(&fixture, "1.1", "1.1.1", Some("foo")).await;

		let outcome = fixture
			.service
			.add(&[AddExtendedTagEntry::new("BodyPartExamined", None, "Series")])
			.await
			.unwrap();
		let AddOutcome::Accepted(operation) = outcome else {
			panic!("expected a reindex operation");
		};
		crate::tags::service::tests::wait_for(&fixture.service, operation.id).await;

		let (records, erroneous) = search(
			&qido(&fixture),
			QueryResource::AllSeries,
			"BodyPartExamined=foo",
		)
		.await
		.unwrap();
		assert_eq!(records.len(), 1);
		assert!(erroneous.is_empty());

		// An explicit reindex leaves the tag queryable, but reported
		let tag = fixture.tags.list_tags(None, 0).await.unwrap().remove(0);
		fixture
			.tags
			.update_status(
				tag.key,
				tag.version,
				crate::tags::TagEvent::ReindexRequested,
				None,
			)
			.await
			.unwrap();
		let (records, erroneous) = search(
			&qido(&fixture),
			QueryResource::AllSeries,
			"BodyPartExamined=foo",
		)
		.await
		.unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(erroneous, vec![String::from("BodyPartExamined")]);
	}

	#[tokio::test]
	async fn parse_errors_are_returned_before_execution() {
		let fixture = fixture().await;
		let result = search(&qido(&fixture), QueryResource::AllStudies, "Modality=CT").await;
		assert!(matches!(
			result,
			Err(SearchError::Parse(QueryParseError::UnsupportedLevel { .. }))
		));
	}

	#[tokio::test]
	async fn matches_without_attributes_are_skipped() {
		let fixture = fixture().await;
		store(&fixture, "1.1", "1.1.1", None).await;
		fixture
			.instances
			.index_instance(1, &dataset("1", "1.1", "1.1.2", vec![]), &[])
			.await
			.unwrap();

		let (records, _) = search(&qido(&fixture), QueryResource::AllInstances, "")
			.await
			.unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(text(&records[0], tags::SOP_INSTANCE_UID), "1.1.1");
	}
}
