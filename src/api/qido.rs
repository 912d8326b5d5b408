use crate::query::{QueryParameters, QueryScope, SearchError, SearchRequest};
use crate::types::QueryResource;
use crate::AppState;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_streams::StreamBodyAs;
use dicom::object::InMemDicomObject;
use dicom_json::DicomJson;
use futures::TryStreamExt;
use tracing::{error, instrument};

/// HTTP Router for the Search Transaction.
///
/// <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.6>
#[rustfmt::skip]
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/studies", get(all_studies))
        .route("/studies/{study}/series", get(studys_series))
        .route("/studies/{study}/series/{series}/instances", get(studys_series_instances))
        .route("/studies/{study}/instances", get(studys_instances))
        .route("/series", get(all_series))
        .route("/instances", get(all_instances))
}

impl IntoResponse for SearchError {
	fn into_response(self) -> Response {
		let status = match &self {
			Self::Parse(_) => StatusCode::BAD_REQUEST,
			Self::Compile(_) | Self::Store(_) | Self::Loader(_) => {
				error!(error = %self, "Search failed");
				StatusCode::INTERNAL_SERVER_ERROR
			}
		};
		(status, self.to_string()).into_response()
	}
}

/// `299 <agent> "<text>"`, listing extended query tags whose index may be incomplete.
fn warning(erroneous_tags: &[String]) -> Option<HeaderValue> {
	if erroneous_tags.is_empty() {
		return None;
	}
	let text = format!(
		"299 dicom-index: \"The following extended query tags may return incomplete results: {}\"",
		erroneous_tags.join(", ")
	);
	HeaderValue::from_str(&text).ok()
}

// QIDO-RS implementation
async fn qido_handler(state: AppState, request: SearchRequest) -> Result<Response, SearchError> {
	let response = state.qido.search(request).await?;
	let matches: Vec<InMemDicomObject> = response.stream.try_collect().await?;
	let warning = warning(&response.erroneous_tags);

	let mut response = if matches.is_empty() {
		StatusCode::NO_CONTENT.into_response()
	} else {
		let json: Vec<DicomJson<InMemDicomObject>> =
			matches.into_iter().map(DicomJson::from).collect();
		(
			[(header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())],
			StreamBodyAs::json_array(futures::stream::iter(json)),
		)
			.into_response()
	};
	if let Some(warning) = warning {
		response.headers_mut().insert(header::WARNING, warning);
	}
	Ok(response)
}

fn request(
	resource: QueryResource,
	study: Option<String>,
	series: Option<String>,
	query: Option<String>,
) -> SearchRequest {
	SearchRequest {
		resource,
		scope: QueryScope {
			study_instance_uid: study,
			series_instance_uid: series,
		},
		parameters: QueryParameters::from_query(query.as_deref().unwrap_or_default()),
	}
}

#[instrument(skip_all)]
async fn all_studies(
	State(state): State<AppState>,
	RawQuery(query): RawQuery,
) -> Result<Response, SearchError> {
	let request = request(QueryResource::AllStudies, None, None, query);
	qido_handler(state, request).await
}

#[instrument(skip_all)]
async fn studys_series(
	State(state): State<AppState>,
	Path(study): Path<String>,
	RawQuery(query): RawQuery,
) -> Result<Response, SearchError> {
	let request = request(QueryResource::StudySeries, Some(study), None, query);
	qido_handler(state, request).await
}

#[instrument(skip_all)]
async fn studys_series_instances(
	State(state): State<AppState>,
	Path((study, series)): Path<(String, String)>,
	RawQuery(query): RawQuery,
) -> Result<Response, SearchError> {
	let request = request(
		QueryResource::StudySeriesInstances,
		Some(study),
		Some(series),
		query,
	);
	qido_handler(state, request).await
}

#[instrument(skip_all)]
async fn studys_instances(
	State(state): State<AppState>,
	Path(study): Path<String>,
	RawQuery(query): RawQuery,
) -> Result<Response, SearchError> {
	let request = request(QueryResource::StudyInstances, Some(study), None, query);
	qido_handler(state, request).await
}

#[instrument(skip_all)]
async fn all_series(
	State(state): State<AppState>,
	RawQuery(query): RawQuery,
) -> Result<Response, SearchError> {
	let request = request(QueryResource::AllSeries, None, None, query);
	qido_handler(state, request).await
}

#[instrument(skip_all)]
async fn all_instances(
	State(state): State<AppState>,
	RawQuery(query): RawQuery,
) -> Result<Response, SearchError> {
	let request = request(QueryResource::AllInstances, None, None, query);
	qido_handler(state, request).await
}
