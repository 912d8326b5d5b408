use crate::AppState;
use axum::Router;

pub mod extended_tags;
pub mod operations;
pub mod qido;

pub fn routes(base_path: &str) -> Router<AppState> {
	let router = Router::new()
		.merge(qido::routes())
		.merge(extended_tags::routes())
		.merge(operations::routes());

	// axum no longer supports nesting at the root
	match base_path {
		"/" | "" => router,
		base_path => Router::new().nest(base_path, router),
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use crate::config::AppConfig;
	use crate::store::{Database, SchemaVersion};
	use crate::tags::service::tests::MemoryLoader;
	use crate::AppState;
	use axum::body::Body;
	use axum::http::{Request, StatusCode};
	use axum::response::Response;
	use axum::Router;
	use std::sync::Arc;
	use tower::ServiceExt;

	pub(crate) struct TestApp {
		pub(crate) state: AppState,
		pub(crate) loader: Arc<MemoryLoader>,
	}

	impl TestApp {
		pub(crate) async fn new() -> Self {
			let database = Database::in_memory(SchemaVersion::CURRENT).await.unwrap();
			let loader = Arc::new(MemoryLoader::default());
			let state = AppState::new(&AppConfig::defaults().unwrap(), database, loader.clone());
			Self { state, loader }
		}

		fn router(&self) -> Router {
			super::routes("/").with_state(self.state.clone())
		}

		pub(crate) async fn send(&self, request: Request<Body>) -> Response {
			self.router().oneshot(request).await.unwrap()
		}

		pub(crate) async fn get(&self, uri: &str) -> Response {
			self.send(Request::get(uri).body(Body::empty()).unwrap()).await
		}

		pub(crate) async fn json(&self, method: &str, uri: &str, body: &str) -> Response {
			self.send(
				Request::builder()
					.method(method)
					.uri(uri)
					.header("content-type", "application/json")
					.body(Body::from(body.to_owned()))
					.unwrap(),
			)
			.await
		}
	}

	pub(crate) async fn body_json(response: Response) -> serde_json::Value {
		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		serde_json::from_slice(&bytes).unwrap()
	}

	pub(crate) async fn body_text(response: Response) -> String {
		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		String::from_utf8(bytes.to_vec()).unwrap()
	}

	#[tokio::test]
	async fn nest_under_base_path() {
		let app = TestApp::new().await;
		let router = super::routes("/dicomweb").with_state(app.state.clone());

		let response = router
			.clone()
			.oneshot(Request::get("/dicomweb/studies").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::NO_CONTENT);

		let response = router
			.oneshot(Request::get("/studies").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::NOT_FOUND);
	}
}
