//! The relational index store.
//!
//! A single SQLite database holds the Study/Series/Instance hierarchy tables, the extended query
//! tag catalog, the per-datatype index tables and the reindex exception log.

pub mod errors;
pub mod index;
pub mod instance;
pub mod loader;
pub mod schema;

pub use errors::{ExtendedTagErrorRecord, SqliteExceptionLog};
pub use index::SqliteIndexWriter;
pub use instance::InstanceStore;
pub use loader::{FileSystemAttributeLoader, LoaderError};
pub use schema::{IndexKeyColumns, SchemaVersion};

use crate::config::DatabaseConfig;
use crate::tags::{InvalidTransition, TagVersion};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
	#[error("extended query tag {key} was modified concurrently")]
	VersionConflict { key: i64 },
	#[error("extended query tag {key} does not exist")]
	TagNotFound { key: i64 },
	#[error("extended query tag '{path}' already exists")]
	TagAlreadyExists { path: String },
	#[error("registering the tags would exceed the limit of {limit} extended query tags")]
	LimitExceeded { limit: usize },
	#[error(transparent)]
	InvalidTransition(#[from] InvalidTransition),
	#[error("invalid row in {table}: {reason}")]
	InvalidRow { table: &'static str, reason: String },
}

impl StoreError {
	pub(crate) fn invalid_row(table: &'static str, reason: impl Into<String>) -> Self {
		Self::InvalidRow {
			table,
			reason: reason.into(),
		}
	}
}

/// Handle to the index database.
#[derive(Debug, Clone)]
pub struct Database {
	pool: SqlitePool,
	schema_version: SchemaVersion,
}

impl Database {
	pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
		let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
		let pool = SqlitePoolOptions::new()
			.max_connections(config.max_connections)
			.connect_with(options)
			.await?;
		let database = Self {
			pool,
			schema_version: config.schema_version,
		};
		database.initialize().await?;
		info!(
			url = %config.url,
			schema_version = %config.schema_version,
			"Connected to index database"
		);
		Ok(database)
	}

	/// Opens a private in-memory database.
	///
	/// All queries share one connection, because every SQLite in-memory connection is a
	/// database of its own.
	pub async fn in_memory(schema_version: SchemaVersion) -> Result<Self, StoreError> {
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.min_connections(1)
			.idle_timeout(None)
			.max_lifetime(None)
			.connect("sqlite::memory:")
			.await?;
		let database = Self {
			pool,
			schema_version,
		};
		database.initialize().await?;
		Ok(database)
	}

	async fn initialize(&self) -> Result<(), StoreError> {
		schema::create(&self.pool, self.schema_version).await?;
		Ok(())
	}

	pub const fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	pub const fn schema_version(&self) -> SchemaVersion {
		self.schema_version
	}
}

/// Draws the next version token from the sequence table.
pub(crate) async fn next_version(conn: &mut SqliteConnection) -> Result<TagVersion, StoreError> {
	let value: i64 = sqlx::query_scalar(
		"UPDATE tag_version_sequence SET value = value + 1 WHERE id = 1 RETURNING value",
	)
	.fetch_one(conn)
	.await?;
	Ok(TagVersion::from_sequence(value.unsigned_abs()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn versions_increase() {
		let database = Database::in_memory(SchemaVersion::CURRENT).await.unwrap();
		let mut conn = database.pool().acquire().await.unwrap();
		let first = next_version(&mut conn).await.unwrap();
		let second = next_version(&mut conn).await.unwrap();
		assert!(first < second);
	}

	#[tokio::test]
	async fn connect_creates_schema() {
		let config = DatabaseConfig {
			url: String::from("sqlite::memory:"),
			max_connections: 1,
			schema_version: SchemaVersion::CURRENT,
		};
		let database = Database::connect(&config).await.unwrap();
		let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM extended_query_tag")
			.fetch_one(database.pool())
			.await
			.unwrap();
		assert_eq!(count, 0);
	}
}
