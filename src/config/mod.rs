use crate::store::SchemaVersion;
use crate::types::PartitionKey;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: ServerConfig,
	pub database: DatabaseConfig,
	pub storage: StorageConfig,
	pub extended_tags: ExtendedTagsConfig,
	pub qido: QidoConfig,
}

impl AppConfig {
	/// Loads the configuration from the embedded defaults, an optional `config.toml` and
	/// environment variables prefixed with `DICOM_INDEX`.
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		let s = Config::builder()
			.add_source(defaults())
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(
				config::Environment::with_prefix("DICOM_INDEX")
					.prefix_separator("_")
					.separator("__"),
			)
			.build()?;

		s.try_deserialize()
	}

	/// The embedded defaults only, unaffected by the environment.
	pub fn defaults() -> Result<Self, config::ConfigError> {
		config::Config::builder()
			.add_source(defaults())
			.build()?
			.try_deserialize()
	}
}

fn defaults() -> config::File<config::FileSourceString, config::FileFormat> {
	config::File::from_str(include_str!("defaults.toml"), config::FileFormat::Toml)
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Default level of the log filter. `RUST_LOG` takes precedence.
	pub level: String,
	/// Sentry DSN. Sentry is disabled if unset.
	pub sentry: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	pub http: HttpServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
	pub interface: String,
	pub port: u16,
	/// Path prefix of all routes, e.g. `/dicomweb`.
	pub base_path: String,
	/// Timeout of a request in seconds.
	pub request_timeout: u64,
	/// Time in seconds granted to in-flight requests on shutdown.
	pub graceful_shutdown: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
	/// SQLite connection URL, e.g. `sqlite://index.db`.
	pub url: String,
	pub max_connections: u32,
	pub schema_version: SchemaVersion,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
	/// Directory holding stored instances as `{study}/{series}/{sop}.dcm`.
	pub root: PathBuf,
	pub partition: PartitionKey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtendedTagsConfig {
	pub max_allowed_count: usize,
	pub max_private_creator_length: usize,
	pub reindex_batch_size: usize,
	/// How often a delete waits for the operation owning the tag.
	pub delete_retry_count: u32,
	/// Milliseconds between two delete attempts.
	pub delete_retry_interval: u64,
}

impl ExtendedTagsConfig {
	pub const fn delete_retry_interval(&self) -> Duration {
		Duration::from_millis(self.delete_retry_interval)
	}
}

impl Default for ExtendedTagsConfig {
	fn default() -> Self {
		Self {
			max_allowed_count: 128,
			max_private_creator_length: 64,
			reindex_batch_size: 100,
			delete_retry_count: 5,
			delete_retry_interval: 1000,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct QidoConfig {
	/// Limit applied when a request does not specify one.
	pub default_limit: usize,
	pub max_limit: usize,
}

impl Default for QidoConfig {
	fn default() -> Self {
		Self {
			default_limit: 100,
			max_limit: 200,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_valid() {
		let config = AppConfig::defaults().unwrap();

		assert_eq!(config.database.schema_version, SchemaVersion::CURRENT);
		assert_eq!(config.extended_tags.max_allowed_count, 128);
		assert_eq!(config.qido.default_limit, 100);
		assert_eq!(config.qido.max_limit, 200);
		assert_eq!(config.server.http.port, 8080);
	}
}
