use crate::reindex::AttributeLoader;
use crate::types::InstanceIdentifier;
use async_trait::async_trait;
use dicom::dictionary_std::tags;
use dicom::object::{InMemDicomObject, OpenFileOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum LoaderError {
	#[error("instance {0} not found")]
	NotFound(String),
	#[error("failed to read {path}: {reason}")]
	Read { path: PathBuf, reason: String },
	#[error("loader task failed: {0}")]
	Join(#[from] tokio::task::JoinError),
}

/// Loads instances from a directory tree laid out as `{root}/{study}/{series}/{sop}.dcm`.
///
/// Pixel data is not read.
#[derive(Debug, Clone)]
pub struct FileSystemAttributeLoader {
	root: PathBuf,
}

impl FileSystemAttributeLoader {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn path_of(&self, instance: &InstanceIdentifier) -> PathBuf {
		self.root
			.join(&instance.study_instance_uid)
			.join(&instance.series_instance_uid)
			.join(format!("{}.dcm", instance.sop_instance_uid))
	}
}

fn read_attributes(path: &Path) -> Result<InMemDicomObject, LoaderError> {
	OpenFileOptions::new()
		.read_until(tags::PIXEL_DATA)
		.open_file(path)
		.map(dicom::object::FileDicomObject::into_inner)
		.map_err(|err| LoaderError::Read {
			path: path.to_path_buf(),
			reason: err.to_string(),
		})
}

#[async_trait]
impl AttributeLoader for FileSystemAttributeLoader {
	async fn load(&self, instance: &InstanceIdentifier) -> Result<InMemDicomObject, LoaderError> {
		let path = self.path_of(instance);
		if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
			return Err(LoaderError::NotFound(instance.to_string()));
		}
		trace!(path = %path.display(), "Loading instance attributes");
		tokio::task::spawn_blocking(move || read_attributes(&path)).await?
	}
}
