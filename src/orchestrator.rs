//! Playlist-wide batch downloads.
//!
//! A batch resolves its playlist up front, then downloads every member one
//! after another in playlist order, emitting a progress event after each item.
//! Individual failures (including panics) are counted and skipped; only a
//! playlist that cannot be resolved ends the batch in `Error`.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::download::DownloadTask;
use crate::error::ServiceError;
use crate::identifier::extract_playlist_id;
use crate::progress::{CompletionSummary, ProgressSink, ProgressUpdate, PushEvent, TaskFailure};
use crate::provider::{MediaFormat, Resolution, VideoMetadata};
use crate::resolver::MetadataResolver;

/// Opaque batch identifier (a random UUID for generated ids).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl Counters {
    pub fn attempted(&self) -> usize {
        self.completed + self.failed
    }

    /// `floor(attempted * 100 / total)`; zero for an empty batch.
    pub fn percentage(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = self.attempted() * 100 / self.total;
        pct.min(100) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub playlist_url: String,
    pub format: MediaFormat,
    pub resolution: Option<Resolution>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ItemOutcome {
    Completed { title: String },
    Failed,
}

/// In-memory state of one batch. Owned by exactly one orchestrating task.
#[derive(Debug, Clone)]
pub struct BatchTask {
    id: TaskId,
    playlist_id: String,
    format: MediaFormat,
    resolution: Option<Resolution>,
    members: Vec<VideoMetadata>,
    counters: Counters,
    status: TaskStatus,
}

impl BatchTask {
    fn pending(id: TaskId, playlist_id: String, request: &BatchRequest) -> Self {
        Self {
            id,
            playlist_id,
            format: request.format,
            resolution: request.resolution,
            members: Vec::new(),
            counters: Counters::default(),
            status: TaskStatus::Pending,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    fn accept(&mut self, members: Vec<VideoMetadata>) {
        debug_assert_eq!(self.status, TaskStatus::Pending);
        self.counters.total = members.len();
        self.members = members;
    }

    fn reject(&mut self) {
        debug_assert_eq!(self.status, TaskStatus::Pending);
        self.status = TaskStatus::Error;
    }

    fn begin(&mut self) -> ProgressUpdate {
        debug_assert_eq!(self.status, TaskStatus::Pending);
        self.status = TaskStatus::InProgress;
        self.progress(None)
    }

    fn record(&mut self, outcome: ItemOutcome, fallback_title: &str) -> ProgressUpdate {
        debug_assert_eq!(self.status, TaskStatus::InProgress);
        let title = match outcome {
            ItemOutcome::Completed { title } => {
                self.counters.completed += 1;
                title
            }
            ItemOutcome::Failed => {
                self.counters.failed += 1;
                fallback_title.to_string()
            }
        };
        debug_assert!(self.counters.attempted() <= self.counters.total);
        self.progress(Some(title))
    }

    fn finish(&mut self) -> CompletionSummary {
        debug_assert_eq!(self.status, TaskStatus::InProgress);
        debug_assert_eq!(self.counters.attempted(), self.counters.total);
        self.status = TaskStatus::Complete;
        CompletionSummary {
            task_id: self.id.clone(),
            completed: self.counters.completed,
            failed: self.counters.failed,
            total: self.counters.total,
        }
    }

    fn progress(&self, current_video: Option<String>) -> ProgressUpdate {
        ProgressUpdate {
            task_id: self.id.clone(),
            completed: self.counters.completed,
            failed: self.counters.failed,
            total: self.counters.total,
            percentage: self.counters.percentage(),
            current_video,
        }
    }

    fn report(&self) -> BatchReport {
        BatchReport {
            task_id: self.id.clone(),
            playlist_id: self.playlist_id.clone(),
            status: self.status,
            counters: self.counters,
        }
    }
}

/// Final state of a batch once its task has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub task_id: TaskId,
    pub playlist_id: String,
    pub status: TaskStatus,
    pub counters: Counters,
}

/// A batch that passed playlist resolution and is now running.
#[derive(Debug)]
pub struct AcceptedBatch {
    pub task_id: TaskId,
    pub playlist_id: String,
    pub total_videos: usize,
    handle: JoinHandle<BatchReport>,
}

impl AcceptedBatch {
    /// Waits for the batch to finish. Dropping an `AcceptedBatch` instead
    /// leaves the batch running in the background.
    pub async fn wait(self) -> BatchReport {
        match self.handle.await {
            Ok(report) => report,
            Err(err) => {
                error!(task_id = %self.task_id, error = %err, "batch task aborted");
                BatchReport {
                    task_id: self.task_id,
                    playlist_id: self.playlist_id,
                    status: TaskStatus::Error,
                    counters: Counters::default(),
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    /// The request never reached the orchestrator; nothing was emitted.
    #[error("{0}")]
    Invalid(String),
    /// The playlist could not be resolved; one `download_error` was emitted.
    #[error("{message}")]
    Rejected {
        task_id: TaskId,
        message: String,
        cause: ServiceError,
    },
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    resolver: MetadataResolver,
    downloads: DownloadTask,
    sink: Arc<dyn ProgressSink>,
}

impl BatchOrchestrator {
    pub fn new(
        resolver: MetadataResolver,
        downloads: DownloadTask,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            resolver,
            downloads,
            sink,
        }
    }

    /// Resolves the playlist and, if that works, spawns the batch and returns
    /// right away.
    pub async fn start(&self, request: BatchRequest) -> Result<AcceptedBatch, BatchError> {
        let playlist_id = extract_playlist_id(&request.playlist_url).ok_or_else(|| {
            BatchError::Invalid(format!(
                "not a recognized playlist URL: {}",
                request.playlist_url
            ))
        })?;

        let mut task = BatchTask::pending(TaskId::generate(), playlist_id.clone(), &request);
        let span = info_span!("batch", task_id = %task.id, playlist_id = %playlist_id);

        let playlist = match self
            .resolver
            .resolve_playlist(&request.playlist_url)
            .instrument(span.clone())
            .await
        {
            Ok(playlist) => playlist,
            Err(cause) => {
                task.reject();
                let message = format!("could not load playlist {playlist_id}: {cause}");
                span.in_scope(|| warn!(error = %cause, "batch rejected"));
                self.sink.emit(PushEvent::DownloadError(TaskFailure {
                    task_id: task.id.clone(),
                    message: message.clone(),
                }));
                return Err(BatchError::Rejected {
                    task_id: task.id,
                    message,
                    cause,
                });
            }
        };

        task.accept(playlist.videos);
        let task_id = task.id.clone();
        let total_videos = task.counters.total;
        span.in_scope(|| info!(total_videos, format = %task.format, "batch accepted"));

        let runner = self.clone();
        let handle = tokio::spawn(async move { runner.run(task).await }.instrument(span));

        Ok(AcceptedBatch {
            task_id,
            playlist_id,
            total_videos,
            handle,
        })
    }

    async fn run(&self, mut task: BatchTask) -> BatchReport {
        self.sink.emit(PushEvent::DownloadProgress(task.begin()));

        let members = task.members.clone();
        for member in &members {
            let outcome = self.attempt(member, task.format, task.resolution).await;
            let update = task.record(outcome, &member.title);
            self.sink.emit(PushEvent::DownloadProgress(update));
        }

        let summary = task.finish();
        info!(
            completed = summary.completed,
            failed = summary.failed,
            total = summary.total,
            "batch complete"
        );
        self.sink.emit(PushEvent::DownloadComplete(summary));
        task.report()
    }

    /// Runs one item in its own task so a panic inside it is contained and
    /// counted as a failure.
    async fn attempt(
        &self,
        member: &VideoMetadata,
        format: MediaFormat,
        resolution: Option<Resolution>,
    ) -> ItemOutcome {
        let downloads = self.downloads.clone();
        let video_id = member.video_id.clone();
        let handle =
            tokio::spawn(async move { downloads.run(&video_id, format, resolution).await });
        match handle.await {
            Ok(Ok(result)) => ItemOutcome::Completed {
                title: result.title,
            },
            Ok(Err(err)) => {
                warn!(video_id = %member.video_id, error = %err, "item failed");
                ItemOutcome::Failed
            }
            Err(err) => {
                error!(video_id = %member.video_id, error = %err, "item crashed");
                ItemOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FakeFetcher, FakeMetadata, FakeTranscripts, RecordingSink, sample_playlist, temp_store,
    };
    use crate::error::ProviderError;

    const PLAYLIST_URL: &str = "https://www.youtube.com/playlist?list=PLdemo";

    fn request(format: MediaFormat) -> BatchRequest {
        BatchRequest {
            playlist_url: PLAYLIST_URL.to_string(),
            format,
            resolution: Some(Resolution::P720),
        }
    }

    async fn orchestrator(
        metadata: FakeMetadata,
        fetcher: FakeFetcher,
    ) -> (tempfile::TempDir, BatchOrchestrator, Arc<RecordingSink>, Arc<FakeFetcher>) {
        let (dir, store) = temp_store().await;
        let resolver = MetadataResolver::new(
            store.clone(),
            Arc::new(metadata),
            Arc::new(FakeTranscripts::default()),
        );
        let fetcher = Arc::new(fetcher);
        let sink = Arc::new(RecordingSink::default());
        let orchestrator =
            BatchOrchestrator::new(resolver, DownloadTask::new(fetcher.clone(), store), sink.clone());
        (dir, orchestrator, sink, fetcher)
    }

    fn progress(
        task_id: &TaskId,
        completed: usize,
        failed: usize,
        total: usize,
        percentage: u8,
        current_video: Option<&str>,
    ) -> PushEvent {
        PushEvent::DownloadProgress(ProgressUpdate {
            task_id: task_id.clone(),
            completed,
            failed,
            total,
            percentage,
            current_video: current_video.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn failed_member_is_counted_and_batch_completes() {
        let playlist = sample_playlist("PLdemo", &["aaaaaaaaaaa", "bbbbbbbbbbb", "ccccccccccc"]);
        let (_dir, orchestrator, sink, _) = orchestrator(
            FakeMetadata::default().with_playlist(playlist),
            FakeFetcher::default().failing("bbbbbbbbbbb"),
        )
        .await;

        let accepted = orchestrator.start(request(MediaFormat::Mp4)).await.unwrap();
        assert_eq!(accepted.total_videos, 3);
        let task_id = accepted.task_id.clone();
        let report = accepted.wait().await;

        assert_eq!(report.status, TaskStatus::Complete);
        assert_eq!(
            report.counters,
            Counters {
                completed: 2,
                failed: 1,
                total: 3
            }
        );
        assert_eq!(
            sink.events(),
            vec![
                progress(&task_id, 0, 0, 3, 0, None),
                progress(&task_id, 1, 0, 3, 33, Some("Fetched aaaaaaaaaaa")),
                progress(&task_id, 1, 1, 3, 66, Some("Video bbbbbbbbbbb")),
                progress(&task_id, 2, 1, 3, 100, Some("Fetched ccccccccccc")),
                PushEvent::DownloadComplete(CompletionSummary {
                    task_id: task_id.clone(),
                    completed: 2,
                    failed: 1,
                    total: 3,
                }),
            ]
        );
    }

    #[tokio::test]
    async fn members_are_fetched_sequentially_in_playlist_order() {
        let ids = ["ccccccccccc", "aaaaaaaaaaa", "bbbbbbbbbbb"];
        let (_dir, orchestrator, _sink, fetcher) = orchestrator(
            FakeMetadata::default().with_playlist(sample_playlist("PLdemo", &ids)),
            FakeFetcher::default(),
        )
        .await;

        orchestrator
            .start(request(MediaFormat::Mp3))
            .await
            .unwrap()
            .wait()
            .await;
        let fetched: Vec<String> = fetcher
            .requests()
            .into_iter()
            .map(|request| request.video_id)
            .collect();
        assert_eq!(fetched, ids);
        assert_eq!(fetcher.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn unresolvable_playlist_emits_single_error() {
        let (_dir, orchestrator, sink, fetcher) = orchestrator(
            FakeMetadata::default().failing_with(ProviderError::failed("HTTP Error 500")),
            FakeFetcher::default(),
        )
        .await;

        let err = orchestrator
            .start(request(MediaFormat::Mp4))
            .await
            .unwrap_err();
        let BatchError::Rejected { task_id, message, .. } = err else {
            panic!("expected rejection, got {err:?}");
        };
        assert_eq!(
            sink.events(),
            vec![PushEvent::DownloadError(TaskFailure { task_id, message })]
        );
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn invalid_url_emits_nothing() {
        let (_dir, orchestrator, sink, _) =
            orchestrator(FakeMetadata::default(), FakeFetcher::default()).await;
        let err = orchestrator
            .start(BatchRequest {
                playlist_url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
                format: MediaFormat::Mp4,
                resolution: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Invalid(_)));
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn panicking_item_counts_as_failure() {
        let playlist = sample_playlist("PLdemo", &["aaaaaaaaaaa", "bbbbbbbbbbb"]);
        let (_dir, orchestrator, sink, _) = orchestrator(
            FakeMetadata::default().with_playlist(playlist),
            FakeFetcher::default().panicking("aaaaaaaaaaa"),
        )
        .await;

        let report = orchestrator
            .start(request(MediaFormat::Mp4))
            .await
            .unwrap()
            .wait()
            .await;
        assert_eq!(report.status, TaskStatus::Complete);
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.counters.completed, 1);
        assert!(matches!(
            sink.events().last(),
            Some(PushEvent::DownloadComplete(summary)) if summary.failed == 1 && summary.completed == 1
        ));
    }

    #[tokio::test]
    async fn empty_playlist_reports_shape_then_completes() {
        let (_dir, orchestrator, sink, _) = orchestrator(
            FakeMetadata::default().with_playlist(sample_playlist("PLdemo", &[])),
            FakeFetcher::default(),
        )
        .await;

        let accepted = orchestrator.start(request(MediaFormat::Mp4)).await.unwrap();
        let task_id = accepted.task_id.clone();
        assert_eq!(accepted.total_videos, 0);
        accepted.wait().await;
        assert_eq!(
            sink.events(),
            vec![
                progress(&task_id, 0, 0, 0, 0, None),
                PushEvent::DownloadComplete(CompletionSummary {
                    task_id,
                    completed: 0,
                    failed: 0,
                    total: 0,
                }),
            ]
        );
    }

    #[tokio::test]
    async fn counters_never_decrease_and_stay_within_total() {
        let ids = ["aaaaaaaaaaa", "bbbbbbbbbbb", "ccccccccccc", "ddddddddddd", "eeeeeeeeeee"];
        let (_dir, orchestrator, sink, _) = orchestrator(
            FakeMetadata::default().with_playlist(sample_playlist("PLdemo", &ids)),
            FakeFetcher::default()
                .failing("bbbbbbbbbbb")
                .failing("ddddddddddd"),
        )
        .await;
        orchestrator
            .start(request(MediaFormat::Mp4))
            .await
            .unwrap()
            .wait()
            .await;

        let mut last = (0, 0, 0u8);
        for event in sink.events() {
            if let PushEvent::DownloadProgress(update) = event {
                assert!(update.completed + update.failed <= update.total);
                assert!(update.completed >= last.0 && update.failed >= last.1);
                assert!(update.percentage >= last.2);
                last = (update.completed, update.failed, update.percentage);
            }
        }
        assert_eq!(last, (3, 2, 100));
    }

    #[tokio::test]
    async fn concurrent_batches_tag_events_with_their_own_ids() {
        let (_dir, store) = temp_store().await;
        let metadata = FakeMetadata::default()
            .with_playlist(sample_playlist("PLone", &["aaaaaaaaaaa"]))
            .with_playlist(sample_playlist("PLtwo", &["bbbbbbbbbbb", "ccccccccccc"]));
        let resolver = MetadataResolver::new(
            store.clone(),
            Arc::new(metadata),
            Arc::new(FakeTranscripts::default()),
        );
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = BatchOrchestrator::new(
            resolver,
            DownloadTask::new(Arc::new(FakeFetcher::default()), store),
            sink.clone(),
        );

        let one = orchestrator
            .start(BatchRequest {
                playlist_url: "https://www.youtube.com/playlist?list=PLone".into(),
                format: MediaFormat::Mp3,
                resolution: None,
            })
            .await
            .unwrap();
        let two = orchestrator
            .start(BatchRequest {
                playlist_url: "https://www.youtube.com/playlist?list=PLtwo".into(),
                format: MediaFormat::Mp3,
                resolution: None,
            })
            .await
            .unwrap();
        assert_ne!(one.task_id, two.task_id);
        let (one_id, two_id) = (one.task_id.clone(), two.task_id.clone());
        one.wait().await;
        two.wait().await;

        let events = sink.events();
        let count_for = |id: &TaskId| {
            events
                .iter()
                .filter(|event| event.task_id() == Some(id))
                .count()
        };
        assert_eq!(count_for(&one_id), 3);
        assert_eq!(count_for(&two_id), 4);
    }

    #[test]
    fn percentage_floors() {
        let counters = Counters {
            completed: 1,
            failed: 0,
            total: 3,
        };
        assert_eq!(counters.percentage(), 33);
        let counters = Counters {
            completed: 1,
            failed: 1,
            total: 3,
        };
        assert_eq!(counters.percentage(), 66);
        assert_eq!(Counters::default().percentage(), 0);
    }

    #[test]
    fn rejected_task_never_enters_progress() {
        let mut task = BatchTask::pending(
            TaskId::from("t"),
            "PLdemo".into(),
            &request(MediaFormat::Mp4),
        );
        assert_eq!(task.status(), TaskStatus::Pending);
        task.reject();
        assert_eq!(task.status(), TaskStatus::Error);
        assert_eq!(task.counters(), Counters::default());
    }

    #[test]
    fn generated_task_ids_are_unique_uuids() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }
}
