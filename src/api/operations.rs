use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
	Router::new().route("/operations/{id}", get(operation))
}

async fn operation(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
	match state.tags.operation(id).await {
		Some(operation) => Json(operation).into_response(),
		None => (StatusCode::NOT_FOUND, format!("operation {id} does not exist")).into_response(),
	}
}

#[cfg(test)]
mod tests {
	use crate::api::tests::{body_json, TestApp};
	use crate::store::instance::tests::dataset;
	use axum::http::StatusCode;
	use uuid::Uuid;

	#[tokio::test]
	async fn poll_reindex_operation() {
		let app = TestApp::new().await;
		let stored = dataset("1", "1.1", "1.1.1", vec![]);
		app.state.instances.index_instance(1, &stored, &[]).await.unwrap();
		app.loader.insert("1.1.1", stored).await;

		let response = app
			.json(
				"POST",
				"/extendedquerytags",
				r#"[{"path": "BodyPartExamined", "level": "Series"}]"#,
			)
			.await;
		let id: Uuid = body_json(response).await["id"]
			.as_str()
			.unwrap()
			.parse()
			.unwrap();
		crate::tags::service::tests::wait_for(&app.state.tags, id).await;

		let response = app.get(&format!("/operations/{id}")).await;
		assert_eq!(response.status(), StatusCode::OK);
		let operation = body_json(response).await;
		assert_eq!(operation["id"], id.to_string());
		assert_eq!(operation["status"], "Succeeded");
		assert_eq!(operation["percentComplete"], 100);
		assert_eq!(operation["resources"][0], "00180015");
	}

	#[tokio::test]
	async fn unknown_operation() {
		let app = TestApp::new().await;
		let response = app.get(&format!("/operations/{}", Uuid::new_v4())).await;
		assert_eq!(response.status(), StatusCode::NOT_FOUND);

		let response = app.get("/operations/not-a-uuid").await;
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}
}
