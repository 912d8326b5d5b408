use crate::tags::{
	AddExtendedTagEntry, AddOutcome, ExtendedTagEntry, ExtendedTagError, ExtendedTagStatus,
	OperationReference, QueryStatus, ValidationError,
};
use crate::types::QueryTagLevel;
use crate::values::vr_code;
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, instrument};

/// Page size of the error listing if the client does not specify one.
const DEFAULT_ERROR_LIMIT: usize = 100;

#[rustfmt::skip]
pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/extendedquerytags", post(add_tags).get(list_tags))
		.route("/extendedquerytags/{path}", get(get_tag).patch(update_tag).delete(delete_tag))
		.route("/extendedquerytags/{path}/reindex", post(reindex_tag))
		.route("/extendedquerytags/{path}/errors", get(list_errors))
}

impl IntoResponse for ExtendedTagError {
	fn into_response(self) -> Response {
		let status = match &self {
			Self::Validation(errors) => {
				let conflict = errors.0.iter().any(|error| {
					matches!(
						error,
						ValidationError::AlreadyExists { .. } | ValidationError::LimitExceeded { .. }
					)
				});
				if conflict {
					StatusCode::CONFLICT
				} else {
					StatusCode::BAD_REQUEST
				}
			}
			Self::NotFound { .. } => StatusCode::NOT_FOUND,
			Self::Ambiguous { .. } => StatusCode::BAD_REQUEST,
			Self::Conflict(_) | Self::Busy { .. } => StatusCode::CONFLICT,
			Self::OperationFailed { .. } | Self::Backend(_) => {
				error!(error = %self, "Extended query tag request failed");
				StatusCode::INTERNAL_SERVER_ERROR
			}
		};
		(status, self.to_string()).into_response()
	}
}

/// Representation of a registered tag returned to clients.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtendedTagJson {
	path: String,
	vr: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	private_creator: Option<String>,
	level: QueryTagLevel,
	status: ExtendedTagStatus,
	query_status: QueryStatus,
	error_count: i64,
	/// The operation still indexing this tag.
	#[serde(skip_serializing_if = "Option::is_none")]
	operation: Option<OperationReference>,
}

impl From<ExtendedTagEntry> for ExtendedTagJson {
	fn from(tag: ExtendedTagEntry) -> Self {
		let operation = tag
			.operation_id
			.filter(|_| tag.status.is_indexing())
			.map(OperationReference::new);
		Self {
			path: tag.path,
			vr: vr_code(tag.vr),
			private_creator: tag.private_creator,
			level: tag.level,
			status: tag.status,
			query_status: tag.query_status,
			error_count: tag.error_count,
			operation,
		}
	}
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagSelector {
	#[serde(default, alias = "PrivateCreator")]
	private_creator: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Paging {
	limit: Option<usize>,
	#[serde(default)]
	offset: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorPaging {
	#[serde(default, alias = "PrivateCreator")]
	private_creator: Option<String>,
	limit: Option<usize>,
	#[serde(default)]
	offset: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateExtendedTag {
	#[serde(alias = "QueryStatus")]
	query_status: QueryStatus,
}

fn outcome_response(outcome: AddOutcome) -> Response {
	match outcome {
		AddOutcome::Accepted(reference) => (StatusCode::ACCEPTED, Json(reference)).into_response(),
		AddOutcome::Completed(tags) => {
			let tags: Vec<ExtendedTagJson> = tags.into_iter().map(ExtendedTagJson::from).collect();
			(StatusCode::OK, Json(tags)).into_response()
		}
	}
}

#[instrument(skip_all, fields(count = entries.len()))]
async fn add_tags(
	State(state): State<AppState>,
	Json(entries): Json<Vec<AddExtendedTagEntry>>,
) -> Result<Response, ExtendedTagError> {
	let outcome = state.tags.add(&entries).await?;
	Ok(outcome_response(outcome))
}

#[instrument(skip_all)]
async fn list_tags(
	State(state): State<AppState>,
	Query(paging): Query<Paging>,
) -> Result<Json<Vec<ExtendedTagJson>>, ExtendedTagError> {
	let tags = state.tags.list(paging.limit, paging.offset).await?;
	Ok(Json(tags.into_iter().map(ExtendedTagJson::from).collect()))
}

#[instrument(skip(state, selector))]
async fn get_tag(
	State(state): State<AppState>,
	Path(path): Path<String>,
	Query(selector): Query<TagSelector>,
) -> Result<Json<ExtendedTagJson>, ExtendedTagError> {
	let tag = state
		.tags
		.get(&path, selector.private_creator.as_deref())
		.await?;
	Ok(Json(tag.into()))
}

#[instrument(skip(state, selector, update))]
async fn update_tag(
	State(state): State<AppState>,
	Path(path): Path<String>,
	Query(selector): Query<TagSelector>,
	Json(update): Json<UpdateExtendedTag>,
) -> Result<Json<ExtendedTagJson>, ExtendedTagError> {
	let tag = state
		.tags
		.update_query_status(
			&path,
			selector.private_creator.as_deref(),
			update.query_status,
		)
		.await?;
	Ok(Json(tag.into()))
}

#[instrument(skip(state, selector))]
async fn delete_tag(
	State(state): State<AppState>,
	Path(path): Path<String>,
	Query(selector): Query<TagSelector>,
) -> Result<StatusCode, ExtendedTagError> {
	state
		.tags
		.delete(&path, selector.private_creator.as_deref())
		.await?;
	Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, selector))]
async fn reindex_tag(
	State(state): State<AppState>,
	Path(path): Path<String>,
	Query(selector): Query<TagSelector>,
) -> Result<Response, ExtendedTagError> {
	let outcome = state
		.tags
		.reindex(&path, selector.private_creator.as_deref())
		.await?;
	Ok(outcome_response(outcome))
}

#[instrument(skip(state, paging))]
async fn list_errors(
	State(state): State<AppState>,
	Path(path): Path<String>,
	Query(paging): Query<ErrorPaging>,
) -> Result<Response, ExtendedTagError> {
	let errors = state
		.tags
		.list_errors(
			&path,
			paging.private_creator.as_deref(),
			paging.limit.unwrap_or(DEFAULT_ERROR_LIMIT),
			paging.offset,
		)
		.await?;
	Ok(Json(errors).into_response())
}
