//! Seams to the outside world: metadata lookups, media fetching, caption
//! tracks and text generation. Production implementations live in `ytdlp`,
//! `transcript` and `llm`; tests swap in in-memory fakes.

use std::{fmt, path::PathBuf, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Descriptive fields for one video as reported by the provider. Anything the
/// provider did not report is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub video_id: String,
    pub title: String,
    pub thumbnail: Option<String>,
    pub duration: Option<i64>,
    /// ISO `YYYY-MM-DD`.
    pub upload_date: Option<String>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistMetadata {
    pub playlist_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Members in the order the provider listed them.
    pub videos: Vec<VideoMetadata>,
}

impl PlaylistMetadata {
    pub fn item_count(&self) -> usize {
        self.videos.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Mp4,
    Mp3,
}

impl MediaFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Self::Mp3)
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mp4" => Ok(Self::Mp4),
            "mp3" => Ok(Self::Mp3),
            other => Err(format!("unsupported format {other:?}; expected mp4 or mp3")),
        }
    }
}

/// Target height for video downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resolution {
    P240,
    P360,
    P480,
    P720,
    P1080,
}

impl Resolution {
    pub const ALL: [Resolution; 5] = [
        Resolution::P240,
        Resolution::P360,
        Resolution::P480,
        Resolution::P720,
        Resolution::P1080,
    ];

    pub fn height(self) -> u32 {
        match self {
            Self::P240 => 240,
            Self::P360 => 360,
            Self::P480 => 480,
            Self::P720 => 720,
            Self::P1080 => 1080,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.height())
    }
}

impl FromStr for Resolution {
    type Err = String;

    /// Accepts `720` as well as `720p`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_suffix('p')
            .or_else(|| trimmed.strip_suffix('P'))
            .unwrap_or(trimmed);
        digits
            .parse::<u32>()
            .ok()
            .and_then(|height| Self::ALL.into_iter().find(|res| res.height() == height))
            .ok_or_else(|| {
                format!("unsupported resolution {s:?}; expected one of 240, 360, 480, 720, 1080")
            })
    }
}

/// Everything a fetcher needs to download one video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub video_id: String,
    pub format: MediaFormat,
    /// Ignored for audio.
    pub resolution: Option<Resolution>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    pub title: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    /// Uploaded by the channel.
    Manual,
    /// Speech recognition output in the spoken language.
    Generated,
    /// Machine translation of another track.
    Translated,
}

/// A caption track the provider can deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptTrack {
    pub language: String,
    pub kind: TrackKind,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptSegment {
    pub text: String,
    /// Seconds from the start of the video.
    pub start: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn video(&self, video_id: &str) -> Result<VideoMetadata, ProviderError>;

    async fn playlist(&self, playlist_id: &str) -> Result<PlaylistMetadata, ProviderError>;
}

#[async_trait]
pub trait TranscriptProvider: Send + Sync {
    /// Every caption track available for the video, in no particular order.
    async fn tracks(&self, video_id: &str) -> Result<Vec<TranscriptTrack>, ProviderError>;

    async fn segments(
        &self,
        track: &TranscriptTrack,
    ) -> Result<Vec<TranscriptSegment>, ProviderError>;
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedMedia, ProviderError>;
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;
}
