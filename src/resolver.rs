//! Turns URLs into stored video rows, playlists and transcripts.
//!
//! A stored video row is authoritative: once a video has been resolved the
//! provider is not consulted again for it.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ServiceError, ServiceResult};
use crate::identifier::{extract_playlist_id, extract_video_id, is_valid_video_id};
use crate::provider::{
    MetadataProvider, PlaylistMetadata, TrackKind, TranscriptProvider, TranscriptSegment,
};
use crate::store::{Store, VideoRecord};
use crate::transcript::select_track;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub video_id: String,
    /// Language of the track actually served, which may differ from the one
    /// requested.
    pub language: String,
    pub kind: TrackKind,
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    /// Segment texts joined with spaces.
    pub fn plain_text(&self) -> String {
        self.segments
            .iter()
            .map(|segment| segment.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Clone)]
pub struct MetadataResolver {
    store: Store,
    metadata: Arc<dyn MetadataProvider>,
    transcripts: Arc<dyn TranscriptProvider>,
}

impl MetadataResolver {
    pub fn new(
        store: Store,
        metadata: Arc<dyn MetadataProvider>,
        transcripts: Arc<dyn TranscriptProvider>,
    ) -> Self {
        Self {
            store,
            metadata,
            transcripts,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn resolve_video(&self, url: &str) -> ServiceResult<VideoRecord> {
        let video_id = extract_video_id(url)
            .ok_or_else(|| ServiceError::validation(format!("not a recognized video URL: {url}")))?;
        self.resolve_video_id(&video_id).await
    }

    pub async fn resolve_video_id(&self, video_id: &str) -> ServiceResult<VideoRecord> {
        if let Some(stored) = self.store.get_video(video_id).await? {
            debug!(video_id, "video metadata served from store");
            return Ok(stored);
        }
        let metadata = self.metadata.video(video_id).await?;
        let record = self.store.upsert_video(&metadata).await?;
        info!(video_id, title = %record.title, "resolved video metadata");
        Ok(record)
    }

    /// One provider call for the playlist and its flat member list. Members are
    /// upserted with whatever the listing carried; they are not resolved one
    /// by one.
    pub async fn resolve_playlist(&self, url: &str) -> ServiceResult<PlaylistMetadata> {
        let playlist_id = extract_playlist_id(url).ok_or_else(|| {
            ServiceError::validation(format!("not a recognized playlist URL: {url}"))
        })?;
        let playlist = self.metadata.playlist(&playlist_id).await?;
        for member in &playlist.videos {
            self.store.upsert_video(member).await?;
        }
        info!(
            playlist_id = %playlist.playlist_id,
            members = playlist.item_count(),
            "resolved playlist"
        );
        Ok(playlist)
    }

    pub async fn resolve_transcript(
        &self,
        video_id: &str,
        language: &str,
    ) -> ServiceResult<Transcript> {
        if !is_valid_video_id(video_id) {
            return Err(ServiceError::validation(format!(
                "not a valid video id: {video_id}"
            )));
        }
        let tracks = self.transcripts.tracks(video_id).await?;
        let track = select_track(&tracks, language).ok_or_else(|| {
            ServiceError::not_found(format!("no transcript available for {video_id}"))
        })?;
        if track.kind != TrackKind::Manual || !track.language.eq_ignore_ascii_case(language) {
            debug!(
                video_id,
                requested = language,
                served = %track.language,
                kind = ?track.kind,
                "transcript fallback"
            );
        }
        let segments = self.transcripts.segments(track).await?;
        Ok(Transcript {
            video_id: video_id.to_string(),
            language: track.language.clone(),
            kind: track.kind,
            segments,
        })
    }
}
