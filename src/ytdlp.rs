//! `yt-dlp` backed metadata provider and media fetcher.
//!
//! Every invocation runs as a child process bounded by a timeout; the child
//! is killed if the timeout fires.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::identifier::{canonical_playlist_url, canonical_video_url};
use crate::provider::{
    FetchRequest, FetchedMedia, MediaFetcher, MediaFormat, MetadataProvider, PlaylistMetadata,
    Resolution, VideoMetadata,
};

/// Subset of yt-dlp's info JSON we care about. Used for single videos,
/// playlists and flat playlist entries alike.
#[derive(Debug, Default, Deserialize)]
struct InfoJson {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    fulltitle: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    upload_date: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    entries: Option<Vec<InfoJson>>,
    #[serde(default)]
    requested_downloads: Vec<RequestedDownload>,
}

/// One file yt-dlp actually wrote during a fetch.
#[derive(Debug, Default, Deserialize)]
struct RequestedDownload {
    #[serde(default)]
    filepath: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct Thumbnail {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    height: Option<i64>,
}

impl InfoJson {
    fn display_title(&self) -> Option<&str> {
        self.fulltitle
            .as_deref()
            .or(self.title.as_deref())
            .map(str::trim)
            .filter(|title| !title.is_empty())
    }

    /// Prefers the explicit `thumbnail`, then the tallest listed thumbnail.
    fn best_thumbnail(&self) -> Option<String> {
        self.thumbnail.clone().or_else(|| {
            self.thumbnails
                .iter()
                .filter(|thumb| thumb.url.is_some())
                .max_by_key(|thumb| thumb.height.unwrap_or(0))
                .and_then(|thumb| thumb.url.clone())
        })
    }

    fn channel_name(&self) -> Option<String> {
        self.channel.clone().or_else(|| self.uploader.clone())
    }

    fn into_video_metadata(self, fallback_id: &str) -> VideoMetadata {
        let video_id = self.id.clone().unwrap_or_else(|| fallback_id.to_string());
        VideoMetadata {
            title: self.display_title().unwrap_or(&video_id).to_string(),
            thumbnail: self
                .best_thumbnail()
                .or_else(|| Some(default_thumbnail(&video_id))),
            duration: self.duration.map(|secs| secs.round() as i64),
            upload_date: self.upload_date.as_deref().and_then(upload_date_to_iso),
            channel: self.channel_name(),
            video_id,
        }
    }
}

fn default_thumbnail(video_id: &str) -> String {
    format!("https://i.ytimg.com/vi/{video_id}/hqdefault.jpg")
}

/// Converts yt-dlp's `YYYYMMDD` upload date into `YYYY-MM-DD`.
fn upload_date_to_iso(value: &str) -> Option<String> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

/// Builds the `-f` selector for a fetch request.
fn format_selector(format: MediaFormat, resolution: Option<Resolution>) -> String {
    match (format, resolution) {
        (MediaFormat::Mp3, _) => "bestaudio/best".to_string(),
        (MediaFormat::Mp4, Some(resolution)) => {
            let height = resolution.height();
            format!(
                "bestvideo[height<={height}][ext=mp4]+bestaudio[ext=m4a]/best[height<={height}][ext=mp4]/best[height<={height}]/best"
            )
        }
        (MediaFormat::Mp4, None) => "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best".to_string(),
    }
}

/// Maps a failed run's stderr onto the provider error taxonomy.
fn classify_failure(stderr: &str) -> ProviderError {
    let lower = stderr.to_lowercase();
    let missing = [
        "video unavailable",
        "private video",
        "does not exist",
        "this video has been removed",
        "http error 404",
        "playlist does not exist",
    ];
    let last_error = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.to_lowercase().starts_with("error"))
        .map(|line| {
            line.strip_prefix("ERROR: ")
                .or_else(|| line.strip_prefix("ERROR:"))
                .unwrap_or(line)
                .to_string()
        })
        .unwrap_or_else(|| stderr.trim().chars().take(300).collect());

    if missing.iter().any(|needle| lower.contains(needle)) {
        ProviderError::NotFound(last_error)
    } else if last_error.is_empty() {
        ProviderError::failed("yt-dlp exited without an error message")
    } else {
        ProviderError::Failed(format!("yt-dlp: {last_error}"))
    }
}

/// Handle to the yt-dlp executable plus where fetched files go.
#[derive(Debug, Clone)]
pub struct YtDlp {
    bin: PathBuf,
    downloads_dir: PathBuf,
    metadata_timeout: Duration,
    fetch_timeout: Duration,
}

impl YtDlp {
    pub fn new(
        bin: impl Into<PathBuf>,
        downloads_dir: impl Into<PathBuf>,
        metadata_timeout: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            bin: bin.into(),
            downloads_dir: downloads_dir.into(),
            metadata_timeout,
            fetch_timeout,
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub(crate) fn metadata_timeout(&self) -> Duration {
        self.metadata_timeout
    }

    pub(crate) async fn run(&self, args: &[String], timeout: Duration) -> Result<Vec<u8>, ProviderError> {
        debug!(bin = %self.bin.display(), ?args, "running yt-dlp");
        let mut command = Command::new(&self.bin);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| ProviderError::Timeout(timeout))?
            .map_err(|err| {
                ProviderError::Failed(format!("spawning {}: {err}", self.bin.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, "yt-dlp failed");
            return Err(classify_failure(&stderr));
        }
        Ok(output.stdout)
    }

    async fn info_json(&self, args: Vec<String>, timeout: Duration) -> Result<InfoJson, ProviderError> {
        let stdout = self.run(&args, timeout).await?;
        serde_json::from_slice(&stdout)
            .map_err(|err| ProviderError::Failed(format!("yt-dlp returned invalid JSON: {err}")))
    }

    fn output_path(&self, video_id: &str, format: MediaFormat) -> PathBuf {
        self.downloads_dir
            .join(format!("{video_id}.{}", format.as_str()))
    }

    fn fetch_args(&self, request: &FetchRequest) -> Vec<String> {
        let template = self.downloads_dir.join("%(id)s.%(ext)s");
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--no-progress".to_string(),
            "--dump-single-json".to_string(),
            "--no-simulate".to_string(),
            "--format".to_string(),
            format_selector(request.format, request.resolution),
            "--output".to_string(),
            template.to_string_lossy().into_owned(),
        ];
        match request.format {
            MediaFormat::Mp3 => args.extend([
                "--extract-audio".to_string(),
                "--audio-format".to_string(),
                "mp3".to_string(),
                "--audio-quality".to_string(),
                "192K".to_string(),
            ]),
            MediaFormat::Mp4 => args.extend([
                "--merge-output-format".to_string(),
                "mp4".to_string(),
                "--remux-video".to_string(),
                "mp4".to_string(),
            ]),
        }
        args.push(canonical_video_url(&request.video_id));
        args
    }
}

#[async_trait]
impl MetadataProvider for YtDlp {
    async fn video(&self, video_id: &str) -> Result<VideoMetadata, ProviderError> {
        let args = vec![
            "--dump-single-json".to_string(),
            "--skip-download".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            canonical_video_url(video_id),
        ];
        let info = self.info_json(args, self.metadata_timeout).await?;
        Ok(info.into_video_metadata(video_id))
    }

    async fn playlist(&self, playlist_id: &str) -> Result<PlaylistMetadata, ProviderError> {
        let args = vec![
            "--flat-playlist".to_string(),
            "--dump-single-json".to_string(),
            "--no-warnings".to_string(),
            canonical_playlist_url(playlist_id),
        ];
        let mut info = self.info_json(args, self.metadata_timeout).await?;
        let entries = info.entries.take().unwrap_or_default();
        let videos: Vec<VideoMetadata> = entries
            .into_iter()
            .filter_map(|entry| {
                let id = entry.id.clone()?;
                Some(entry.into_video_metadata(&id))
            })
            .collect();

        Ok(PlaylistMetadata {
            playlist_id: info.id.clone().unwrap_or_else(|| playlist_id.to_string()),
            title: info.display_title().unwrap_or(playlist_id).to_string(),
            thumbnail: info
                .best_thumbnail()
                .or_else(|| videos.first().and_then(|video| video.thumbnail.clone())),
            channel: info.channel_name(),
            videos,
        })
    }
}

#[async_trait]
impl MediaFetcher for YtDlp {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedMedia, ProviderError> {
        tokio::fs::create_dir_all(&self.downloads_dir)
            .await
            .map_err(|err| {
                ProviderError::Failed(format!(
                    "creating {}: {err}",
                    self.downloads_dir.display()
                ))
            })?;

        let info = self
            .info_json(self.fetch_args(request), self.fetch_timeout)
            .await?;

        // Single-file fallbacks keep their source container unless remuxed.
        let path = info
            .requested_downloads
            .iter()
            .find_map(|download| download.filepath.clone())
            .unwrap_or_else(|| self.output_path(&request.video_id, request.format));
        let metadata = tokio::fs::metadata(&path).await.map_err(|_| {
            ProviderError::Failed(format!(
                "yt-dlp finished but {} is missing",
                path.display()
            ))
        })?;

        Ok(FetchedMedia {
            title: info
                .display_title()
                .unwrap_or(&request.video_id)
                .to_string(),
            path,
            size: metadata.len(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};
    use tempfile::tempdir;

    /// Fake yt-dlp that answers from canned JSON. Video ids containing
    /// `missing` fail like an unavailable video, ids containing `slow` hang.
    fn install_ytdlp_stub(dir: &Path) -> PathBuf {
        let script_path = dir.join("yt-dlp");
        let script = r#"#!/usr/bin/env bash
set -eu
output=""
mode="video"
ext="mp4"
for arg in "$@"; do
  case "$arg" in
    --flat-playlist) mode="playlist" ;;
    --no-simulate) mode="fetch" ;;
    --audio-format) ext="mp3" ;;
  esac
done
for arg in "$@"; do
  case "$arg" in
    *webm*) ext="webm" ;;
  esac
done
while [[ $# -gt 1 ]]; do
  if [[ "$1" == "--output" ]]; then
    shift
    output="$1"
  fi
  shift
done
url="$1"
id="${url##*=}"

case "$id" in
  *missing*)
    echo "ERROR: [youtube] $id: Video unavailable" >&2
    exit 1
    ;;
  *slow*)
    sleep 5
    ;;
esac

case "$mode" in
  playlist)
    cat <<JSON
{"id": "$id", "title": "Stub Playlist", "channel": "Stub Channel", "entries": [
  {"id": "aaaaaaaaaaa", "title": "First", "duration": 61.4, "thumbnails": [{"url": "https://img/a-small.jpg", "height": 90}, {"url": "https://img/a-big.jpg", "height": 720}]},
  {"id": "bbbbbbbbbbb", "title": "Second", "uploader": "Uploader"},
  {"title": "no id, skipped"}
]}
JSON
    ;;
  fetch)
    path=$(printf '%s' "$output" | sed -e "s/%(id)s/$id/" -e "s/%(ext)s/$ext/")
    printf 'media-bytes' > "$path"
    echo "{\"id\": \"$id\", \"title\": \"Fetched $id\", \"requested_downloads\": [{\"filepath\": \"$path\"}]}"
    ;;
  *)
    echo "{\"id\": \"$id\", \"fulltitle\": \"Full $id\", \"title\": \"Short\", \"duration\": 212.6, \"upload_date\": \"20091025\", \"channel\": \"Rick\"}"
    ;;
esac
"#;
        fs::write(&script_path, script).unwrap();
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
        script_path
    }

    fn stub_ytdlp(dir: &Path) -> YtDlp {
        YtDlp::new(
            install_ytdlp_stub(dir),
            dir.join("downloads"),
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn video_metadata_is_normalized() {
        let dir = tempdir().unwrap();
        let ytdlp = stub_ytdlp(dir.path());
        let video = ytdlp.video("dQw4w9WgXcQ").await.unwrap();
        assert_eq!(video.video_id, "dQw4w9WgXcQ");
        assert_eq!(video.title, "Full dQw4w9WgXcQ");
        assert_eq!(video.duration, Some(213));
        assert_eq!(video.upload_date.as_deref(), Some("2009-10-25"));
        assert_eq!(video.channel.as_deref(), Some("Rick"));
        assert_eq!(
            video.thumbnail.as_deref(),
            Some("https://i.ytimg.com/vi/dQw4w9WgXcQ/hqdefault.jpg")
        );
    }

    #[tokio::test]
    async fn playlist_entries_keep_provider_order() {
        let dir = tempdir().unwrap();
        let ytdlp = stub_ytdlp(dir.path());
        let playlist = ytdlp.playlist("PLstub").await.unwrap();
        assert_eq!(playlist.playlist_id, "PLstub");
        assert_eq!(playlist.title, "Stub Playlist");
        assert_eq!(playlist.channel.as_deref(), Some("Stub Channel"));
        let ids: Vec<&str> = playlist.videos.iter().map(|v| v.video_id.as_str()).collect();
        assert_eq!(ids, vec!["aaaaaaaaaaa", "bbbbbbbbbbb"]);
        assert_eq!(playlist.videos[0].duration, Some(61));
        assert_eq!(
            playlist.videos[0].thumbnail.as_deref(),
            Some("https://img/a-big.jpg")
        );
        assert_eq!(playlist.videos[1].channel.as_deref(), Some("Uploader"));
        assert_eq!(playlist.thumbnail.as_deref(), Some("https://img/a-big.jpg"));
    }

    #[tokio::test]
    async fn unavailable_videos_are_not_found() {
        let dir = tempdir().unwrap();
        let ytdlp = stub_ytdlp(dir.path());
        let err = ytdlp.video("missing0000").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)), "{err:?}");
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let dir = tempdir().unwrap();
        let ytdlp = YtDlp::new(
            install_ytdlp_stub(dir.path()),
            dir.path().join("downloads"),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        let err = ytdlp.video("slow0000000").await.unwrap_err();
        assert_eq!(err, ProviderError::Timeout(Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn fetch_reports_path_size_and_title() {
        let dir = tempdir().unwrap();
        let ytdlp = stub_ytdlp(dir.path());
        let fetched = ytdlp
            .fetch(&FetchRequest {
                video_id: "aaaaaaaaaaa".into(),
                format: MediaFormat::Mp3,
                resolution: Some(Resolution::P720),
            })
            .await
            .unwrap();
        assert_eq!(fetched.path, dir.path().join("downloads/aaaaaaaaaaa.mp3"));
        assert_eq!(fetched.size, "media-bytes".len() as u64);
        assert_eq!(fetched.title, "Fetched aaaaaaaaaaa");
    }

    #[tokio::test]
    async fn fetch_follows_the_file_yt_dlp_actually_wrote() {
        let dir = tempdir().unwrap();
        let ytdlp = stub_ytdlp(dir.path());
        let fetched = ytdlp
            .fetch(&FetchRequest {
                video_id: "webmwebmweb".into(),
                format: MediaFormat::Mp4,
                resolution: Some(Resolution::P720),
            })
            .await
            .unwrap();
        assert_eq!(fetched.path, dir.path().join("downloads/webmwebmweb.webm"));
        assert_eq!(fetched.size, "media-bytes".len() as u64);
    }

    #[test]
    fn video_fetches_ask_for_an_mp4_remux() {
        let ytdlp = YtDlp::new(
            PathBuf::from("yt-dlp"),
            PathBuf::from("/srv/downloads"),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let args = ytdlp.fetch_args(&FetchRequest {
            video_id: "aaaaaaaaaaa".into(),
            format: MediaFormat::Mp4,
            resolution: None,
        });
        let remux = args.iter().position(|arg| arg == "--remux-video").unwrap();
        assert_eq!(args[remux + 1], "mp4");
        assert_eq!(
            args.last().map(String::as_str),
            Some("https://www.youtube.com/watch?v=aaaaaaaaaaa")
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_provider_failure() {
        let dir = tempdir().unwrap();
        let ytdlp = YtDlp::new(
            dir.path().join("no-such-yt-dlp"),
            dir.path().join("downloads"),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let err = ytdlp.video("aaaaaaaaaaa").await.unwrap_err();
        assert!(matches!(err, ProviderError::Failed(_)), "{err:?}");
    }

    #[test]
    fn format_selector_caps_height_for_video_only() {
        assert_eq!(
            format_selector(MediaFormat::Mp3, Some(Resolution::P1080)),
            "bestaudio/best"
        );
        let selector = format_selector(MediaFormat::Mp4, Some(Resolution::P480));
        assert!(selector.starts_with("bestvideo[height<=480][ext=mp4]"));
        assert!(selector.ends_with("/best"));
        assert!(!format_selector(MediaFormat::Mp4, None).contains("height"));
    }

    #[test]
    fn classify_failure_picks_last_error_line() {
        let err = classify_failure("WARNING: retrying\nERROR: [youtube] x: Sign in to confirm\n");
        assert_eq!(
            err,
            ProviderError::Failed("yt-dlp: [youtube] x: Sign in to confirm".into())
        );
        let err = classify_failure("ERROR: [youtube] x: Private video. Sign in");
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[test]
    fn upload_dates_become_iso() {
        assert_eq!(upload_date_to_iso("20240131").as_deref(), Some("2024-01-31"));
        assert_eq!(upload_date_to_iso("2024-01-31"), None);
        assert_eq!(upload_date_to_iso("20241345"), None);
    }
}
