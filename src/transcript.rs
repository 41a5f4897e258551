//! Caption tracks: listing what yt-dlp knows about, choosing one for a
//! requested language, and turning YouTube's `json3` captions into segments.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::ProviderError;
use crate::identifier::canonical_video_url;
use crate::provider::{TrackKind, TranscriptProvider, TranscriptSegment, TranscriptTrack};
use crate::ytdlp::YtDlp;

const CAPTION_EXT: &str = "json3";

#[derive(Debug, Default, Deserialize)]
struct CaptionListing {
    #[serde(default)]
    subtitles: HashMap<String, Vec<CaptionFormat>>,
    #[serde(default)]
    automatic_captions: HashMap<String, Vec<CaptionFormat>>,
}

#[derive(Debug, Deserialize)]
struct CaptionFormat {
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Json3 {
    #[serde(default)]
    events: Vec<Json3Event>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Json3Event {
    #[serde(default)]
    t_start_ms: Option<i64>,
    #[serde(default)]
    d_duration_ms: Option<i64>,
    #[serde(default)]
    segs: Vec<Json3Seg>,
}

#[derive(Debug, Deserialize)]
struct Json3Seg {
    #[serde(default)]
    utf8: String,
}

fn json3_url(formats: &[CaptionFormat]) -> Option<String> {
    formats
        .iter()
        .find(|format| format.ext.as_deref() == Some(CAPTION_EXT))
        .and_then(|format| format.url.clone())
}

/// Flattens yt-dlp's caption maps into tracks. Automatic captions whose URL
/// asks YouTube to translate (`tlang=`) are machine translations.
fn listing_to_tracks(listing: CaptionListing) -> Vec<TranscriptTrack> {
    let mut tracks = Vec::new();
    for (language, formats) in listing.subtitles {
        if language == "live_chat" {
            continue;
        }
        if let Some(url) = json3_url(&formats) {
            tracks.push(TranscriptTrack {
                language,
                kind: TrackKind::Manual,
                url,
            });
        }
    }
    for (language, formats) in listing.automatic_captions {
        if let Some(url) = json3_url(&formats) {
            let kind = if url.contains("tlang=") {
                TrackKind::Translated
            } else {
                TrackKind::Generated
            };
            tracks.push(TranscriptTrack {
                language,
                kind,
                url,
            });
        }
    }
    tracks.sort_by(|a, b| a.language.cmp(&b.language));
    tracks
}

fn base_language(code: &str) -> String {
    code.split(['-', '_'])
        .next()
        .unwrap_or(code)
        .to_ascii_lowercase()
}

fn language_matches(track: &TranscriptTrack, requested: &str) -> bool {
    track.language.eq_ignore_ascii_case(requested)
        || base_language(&track.language) == base_language(requested)
}

/// Picks the best track for `language`: a channel upload in that language,
/// then speech recognition in that language, then a machine translation into
/// it. Failing all of those, any speech recognition track, then any upload.
pub fn select_track<'a>(
    tracks: &'a [TranscriptTrack],
    language: &str,
) -> Option<&'a TranscriptTrack> {
    let in_language = |kind: TrackKind| {
        tracks
            .iter()
            .find(|track| track.kind == kind && language_matches(track, language))
    };
    let any_of = |kind: TrackKind| tracks.iter().find(|track| track.kind == kind);

    in_language(TrackKind::Manual)
        .or_else(|| in_language(TrackKind::Generated))
        .or_else(|| in_language(TrackKind::Translated))
        .or_else(|| any_of(TrackKind::Generated))
        .or_else(|| any_of(TrackKind::Manual))
}

fn parse_json3(body: &str) -> Result<Vec<TranscriptSegment>, ProviderError> {
    let captions: Json3 = serde_json::from_str(body)
        .map_err(|err| ProviderError::Failed(format!("invalid caption payload: {err}")))?;
    Ok(captions
        .events
        .into_iter()
        .filter_map(|event| {
            let text: String = event.segs.iter().map(|seg| seg.utf8.as_str()).collect();
            let text = text.replace('\n', " ").trim().to_string();
            if text.is_empty() {
                return None;
            }
            Some(TranscriptSegment {
                text,
                start: event.t_start_ms.unwrap_or(0) as f64 / 1000.0,
                duration: event.d_duration_ms.unwrap_or(0) as f64 / 1000.0,
            })
        })
        .collect())
}

fn fetch_caption_body(url: &str, timeout: std::time::Duration) -> Result<String, ProviderError> {
    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    let response = agent.get(url).call().map_err(|err| match err {
        ureq::Error::Status(404, _) => ProviderError::NotFound("caption track".into()),
        other => ProviderError::Failed(format!("fetching captions: {other}")),
    })?;
    response
        .into_string()
        .map_err(|err| ProviderError::Failed(format!("reading captions: {err}")))
}

#[async_trait]
impl TranscriptProvider for YtDlp {
    async fn tracks(&self, video_id: &str) -> Result<Vec<TranscriptTrack>, ProviderError> {
        let args = vec![
            "--dump-single-json".to_string(),
            "--skip-download".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            canonical_video_url(video_id),
        ];
        let stdout = self.run(&args, self.metadata_timeout()).await?;
        let listing: CaptionListing = serde_json::from_slice(&stdout)
            .map_err(|err| ProviderError::Failed(format!("yt-dlp returned invalid JSON: {err}")))?;
        let tracks = listing_to_tracks(listing);
        debug!(video_id, tracks = tracks.len(), "listed caption tracks");
        Ok(tracks)
    }

    async fn segments(
        &self,
        track: &TranscriptTrack,
    ) -> Result<Vec<TranscriptSegment>, ProviderError> {
        let timeout = self.metadata_timeout();
        let url = track.url.clone();
        let body = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || fetch_caption_body(&url, timeout)),
        )
        .await
        .map_err(|_| ProviderError::Timeout(timeout))?
        .map_err(|err| ProviderError::Failed(format!("caption fetch task failed: {err}")))??;
        parse_json3(&body)
    }
}
