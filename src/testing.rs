//! In-memory collaborators for unit tests.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::{TempDir, tempdir};

use crate::error::ProviderError;
use crate::progress::{ProgressSink, PushEvent};
use crate::provider::{
    CompletionRequest, FetchRequest, FetchedMedia, LlmProvider, MediaFetcher, MetadataProvider,
    PlaylistMetadata, TranscriptProvider, TranscriptSegment, TranscriptTrack, VideoMetadata,
};
use crate::store::Store;

pub fn sample_video(id: &str) -> VideoMetadata {
    VideoMetadata {
        video_id: id.to_string(),
        title: format!("Video {id}"),
        thumbnail: Some(format!("https://i.ytimg.com/vi/{id}/hqdefault.jpg")),
        duration: Some(212),
        upload_date: Some("2009-10-25".into()),
        channel: Some("Channel".into()),
    }
}

pub fn sample_playlist(id: &str, members: &[&str]) -> PlaylistMetadata {
    PlaylistMetadata {
        playlist_id: id.to_string(),
        title: format!("Playlist {id}"),
        thumbnail: None,
        channel: Some("Channel".into()),
        videos: members.iter().map(|member| sample_video(member)).collect(),
    }
}

pub async fn temp_store() -> (TempDir, Store) {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("yougen.db"))
        .await
        .expect("open store");
    (dir, store)
}

#[derive(Default)]
pub struct FakeMetadata {
    videos: HashMap<String, VideoMetadata>,
    playlists: HashMap<String, PlaylistMetadata>,
    failure: Option<ProviderError>,
    video_calls: AtomicUsize,
}

impl FakeMetadata {
    pub fn with_video(mut self, video: VideoMetadata) -> Self {
        self.videos.insert(video.video_id.clone(), video);
        self
    }

    pub fn with_playlist(mut self, playlist: PlaylistMetadata) -> Self {
        self.playlists.insert(playlist.playlist_id.clone(), playlist);
        self
    }

    /// Every call fails with `err`.
    pub fn failing_with(mut self, err: ProviderError) -> Self {
        self.failure = Some(err);
        self
    }

    pub fn video_calls(&self) -> usize {
        self.video_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataProvider for FakeMetadata {
    async fn video(&self, video_id: &str) -> Result<VideoMetadata, ProviderError> {
        self.video_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        self.videos
            .get(video_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("video {video_id}")))
    }

    async fn playlist(&self, playlist_id: &str) -> Result<PlaylistMetadata, ProviderError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        self.playlists
            .get(playlist_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("playlist {playlist_id}")))
    }
}

#[derive(Default)]
pub struct FakeTranscripts {
    tracks: HashMap<String, Vec<TranscriptTrack>>,
}

impl FakeTranscripts {
    pub fn with_tracks(mut self, video_id: &str, tracks: Vec<TranscriptTrack>) -> Self {
        self.tracks.insert(video_id.to_string(), tracks);
        self
    }
}

#[async_trait]
impl TranscriptProvider for FakeTranscripts {
    async fn tracks(&self, video_id: &str) -> Result<Vec<TranscriptTrack>, ProviderError> {
        Ok(self.tracks.get(video_id).cloned().unwrap_or_default())
    }

    async fn segments(
        &self,
        track: &TranscriptTrack,
    ) -> Result<Vec<TranscriptSegment>, ProviderError> {
        Ok(vec![TranscriptSegment {
            text: format!("segment from {}", track.url),
            start: 0.0,
            duration: 2.5,
        }])
    }
}

#[derive(Default)]
pub struct FakeFetcher {
    failing: Vec<String>,
    panicking: Vec<String>,
    requests: Mutex<Vec<FetchRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeFetcher {
    pub fn failing(mut self, video_id: &str) -> Self {
        self.failing.push(video_id.to_string());
        self
    }

    pub fn panicking(mut self, video_id: &str) -> Self {
        self.panicking.push(video_id.to_string());
        self
    }

    /// Requests in the order they arrived.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaFetcher for FakeFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedMedia, ProviderError> {
        self.requests.lock().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panicking.contains(&request.video_id) {
            panic!("fetcher crashed on {}", request.video_id);
        }
        if self.failing.contains(&request.video_id) {
            return Err(ProviderError::failed(format!(
                "ERROR: [youtube] {}: Video unavailable",
                request.video_id
            )));
        }
        Ok(FetchedMedia {
            title: format!("Fetched {}", request.video_id),
            path: PathBuf::from(format!(
                "/tmp/yougen/{}.{}",
                request.video_id, request.format
            )),
            size: 1024,
        })
    }
}

/// Replies with scripted answers in order; fails once the script runs out.
#[derive(Default)]
pub struct FakeLlm {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeLlm {
    pub fn reply(self, text: &str) -> Self {
        self.replies.lock().push_back(Ok(text.to_string()));
        self
    }

    pub fn fail(self, err: ProviderError) -> Self {
        self.replies.lock().push_back(Err(err));
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for FakeLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        self.requests.lock().push(request.clone());
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::failed("no scripted reply left")))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PushEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<PushEvent> {
        self.events.lock().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: PushEvent) {
        self.events.lock().push(event);
    }
}
