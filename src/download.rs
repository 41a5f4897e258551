//! One media download: fetch the file, then record it.

use std::{path::PathBuf, sync::Arc};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{ProviderError, ServiceError};
use crate::provider::{FetchRequest, MediaFetcher, MediaFormat, Resolution};
use crate::store::Store;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("recording download failed: {0:#}")]
    Record(anyhow::Error),
}

impl From<FetchError> for ServiceError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Provider(err) => err.into(),
            FetchError::Record(err) => ServiceError::Store(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadResult {
    pub video_id: String,
    pub title: String,
    pub size: u64,
    pub path: PathBuf,
    /// Id of the appended download record.
    pub record_id: i64,
}

/// Runs single downloads. Cheap to clone; the orchestrator moves a clone into
/// each per-item task.
#[derive(Clone)]
pub struct DownloadTask {
    fetcher: Arc<dyn MediaFetcher>,
    store: Store,
}

impl DownloadTask {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, store: Store) -> Self {
        Self { fetcher, store }
    }

    /// Fetches the media and appends a download record. The video row must
    /// already exist. Resolution is dropped for audio formats.
    pub async fn run(
        &self,
        video_id: &str,
        format: MediaFormat,
        resolution: Option<Resolution>,
    ) -> Result<DownloadResult, FetchError> {
        let request = FetchRequest {
            video_id: video_id.to_string(),
            format,
            resolution: if format.is_audio() { None } else { resolution },
        };
        let fetched = self.fetcher.fetch(&request).await.inspect_err(|err| {
            warn!(video_id, %format, error = %err, "fetch failed");
        })?;

        let path_text = fetched.path.to_string_lossy().into_owned();
        let size = i64::try_from(fetched.size).unwrap_or(i64::MAX);
        let entry = self
            .store
            .append_download(video_id, format.as_str(), &path_text, size)
            .await
            .map_err(FetchError::Record)?;

        info!(video_id, %format, size = fetched.size, path = %path_text, "download finished");
        Ok(DownloadResult {
            video_id: video_id.to_string(),
            title: fetched.title,
            size: fetched.size,
            path: fetched.path,
            record_id: entry.id,
        })
    }
}
