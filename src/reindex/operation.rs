use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum OperationStatus {
	Running,
	Succeeded,
	Failed,
}

impl OperationStatus {
	pub const fn is_terminal(self) -> bool {
		!matches!(self, Self::Running)
	}
}

/// A long-running reindex operation, polled by the client that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
	pub id: Uuid,
	#[serde(rename = "type")]
	pub kind: &'static str,
	pub status: OperationStatus,
	pub percent_complete: u8,
	/// The extended query tags the operation works on.
	pub resources: Vec<String>,
	pub created_time: DateTime<Utc>,
	pub last_updated_time: DateTime<Utc>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub errors: Vec<String>,
}

/// In-memory registry of the operations started by this process.
#[derive(Debug, Clone)]
pub struct OperationStore {
	operations: Arc<RwLock<HashMap<Uuid, Operation>>>,
	shutdown: Arc<watch::Sender<bool>>,
}

impl Default for OperationStore {
	fn default() -> Self {
		let (shutdown, _) = watch::channel(false);
		Self {
			operations: Arc::default(),
			shutdown: Arc::new(shutdown),
		}
	}
}

impl OperationStore {
	/// Registers a new running reindex operation.
	///
	/// The returned receiver flips to `true` once [`OperationStore::cancel_all`] is called.
	pub async fn create(&self, resources: Vec<String>) -> (Operation, watch::Receiver<bool>) {
		let now = Utc::now();
		let operation = Operation {
			id: Uuid::new_v4(),
			kind: "reindex",
			status: OperationStatus::Running,
			percent_complete: 0,
			resources,
			created_time: now,
			last_updated_time: now,
			errors: Vec::new(),
		};
		self.operations
			.write()
			.await
			.insert(operation.id, operation.clone());
		info!(operation_id = %operation.id, "Started reindex operation");
		(operation, self.shutdown.subscribe())
	}

	pub async fn get(&self, id: Uuid) -> Option<Operation> {
		self.operations.read().await.get(&id).cloned()
	}

	pub async fn report_progress(&self, id: Uuid, percent_complete: u8) {
		self.update(id, |operation| {
			operation.percent_complete = percent_complete.min(100);
		})
		.await;
	}

	pub async fn complete(&self, id: Uuid) {
		self.update(id, |operation| {
			operation.status = OperationStatus::Succeeded;
			operation.percent_complete = 100;
		})
		.await;
		info!(operation_id = %id, "Reindex operation succeeded");
	}

	pub async fn fail(&self, id: Uuid, reason: String) {
		error!(operation_id = %id, reason = %reason, "Reindex operation failed");
		self.update(id, |operation| {
			operation.status = OperationStatus::Failed;
			operation.errors.push(reason);
		})
		.await;
	}

	/// Signals every running operation to stop after its current batch.
	pub fn cancel_all(&self) {
		self.shutdown.send_replace(true);
	}

	async fn update(&self, id: Uuid, apply: impl FnOnce(&mut Operation)) {
		if let Some(operation) = self.operations.write().await.get_mut(&id) {
			apply(operation);
			operation.last_updated_time = Utc::now();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn lifecycle() {
		let store = OperationStore::default();
		let (operation, _) = store.create(vec![String::from("00180015")]).await;
		assert_eq!(operation.status, OperationStatus::Running);

		store.report_progress(operation.id, 40).await;
		assert_eq!(store.get(operation.id).await.unwrap().percent_complete, 40);

		store.complete(operation.id).await;
		let done = store.get(operation.id).await.unwrap();
		assert_eq!(done.status, OperationStatus::Succeeded);
		assert_eq!(done.percent_complete, 100);
		assert!(done.status.is_terminal());
	}

	#[tokio::test]
	async fn failure_keeps_reason() {
		let store = OperationStore::default();
		let (operation, _) = store.create(Vec::new()).await;
		store.fail(operation.id, String::from("disk full")).await;

		let failed = store.get(operation.id).await.unwrap();
		assert_eq!(failed.status, OperationStatus::Failed);
		assert_eq!(failed.errors, ["disk full"]);
	}

	#[tokio::test]
	async fn cancel_all_signals_receivers() {
		let store = OperationStore::default();
		let (_, cancel) = store.create(Vec::new()).await;
		assert!(!*cancel.borrow());
		store.cancel_all();
		assert!(*cancel.borrow());
	}

	#[test]
	fn serialize() {
		let now = Utc::now();
		let operation = Operation {
			id: Uuid::nil(),
			kind: "reindex",
			status: OperationStatus::Running,
			percent_complete: 10,
			resources: vec![String::from("00180015")],
			created_time: now,
			last_updated_time: now,
			errors: Vec::new(),
		};
		let json = serde_json::to_value(&operation).unwrap();
		assert_eq!(json["type"], "reindex");
		assert_eq!(json["status"], "Running");
		assert_eq!(json["percentComplete"], 10);
		assert!(json.get("errors").is_none());
	}
}
