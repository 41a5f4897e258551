//! Question answering about a video, grounded in its transcript.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::identifier::extract_video_id;
use crate::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::resolver::MetadataResolver;
use crate::store::{ChatRecord, VideoRecord};

/// Transcript characters handed to the model with the question.
const ANSWER_CONTEXT_CHARS: usize = 12_000;
/// Transcript characters handed to the model when asking for follow-ups.
const SUGGESTION_CONTEXT_CHARS: usize = 1_000;
const MAX_SUGGESTIONS: usize = 3;
const MIN_SUGGESTION_CHARS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub response: String,
    pub suggestions: Vec<String>,
    pub video_id: String,
}

#[derive(Clone)]
pub struct ChatService {
    resolver: MetadataResolver,
    llm: Arc<dyn LlmProvider>,
}

impl ChatService {
    pub fn new(resolver: MetadataResolver, llm: Arc<dyn LlmProvider>) -> Self {
        Self { resolver, llm }
    }

    pub async fn ask(
        &self,
        video_url: &str,
        message: &str,
        language: &str,
    ) -> ServiceResult<ChatReply> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ServiceError::validation("message must not be empty"));
        }
        let video = self.resolver.resolve_video(video_url).await?;
        let transcript = self.transcript_text(&video.video_id, language).await;

        let response = self
            .llm
            .complete(&answer_request(&video, transcript.as_deref(), message, language))
            .await?;
        let suggestions = self.suggestions(transcript.as_deref(), message).await;

        self.resolver
            .store()
            .append_chat(&video.video_id, message, &response, language)
            .await?;
        info!(video_id = %video.video_id, suggestions = suggestions.len(), "chat turn recorded");

        Ok(ChatReply {
            response,
            suggestions,
            video_id: video.video_id,
        })
    }

    /// Turns of one video, oldest first. Does not contact the provider.
    pub async fn history(&self, video_url: &str) -> ServiceResult<Vec<ChatRecord>> {
        let video_id = extract_video_id(video_url).ok_or_else(|| {
            ServiceError::validation(format!("not a recognized video URL: {video_url}"))
        })?;
        Ok(self.resolver.store().list_chats(&video_id).await?)
    }

    async fn transcript_text(&self, video_id: &str, language: &str) -> Option<String> {
        match self.resolver.resolve_transcript(video_id, language).await {
            Ok(transcript) => Some(transcript.plain_text()),
            Err(err) => {
                debug!(video_id, error = %err, "answering without transcript");
                None
            }
        }
    }

    async fn suggestions(&self, transcript: Option<&str>, message: &str) -> Vec<String> {
        match self.llm.complete(&suggestion_request(transcript, message)).await {
            Ok(text) => parse_suggestions(&text),
            Err(err) => {
                warn!(error = %err, "follow-up suggestions unavailable");
                Vec::new()
            }
        }
    }
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

fn answer_request(
    video: &VideoRecord,
    transcript: Option<&str>,
    message: &str,
    language: &str,
) -> CompletionRequest {
    let context = match transcript {
        Some(text) => format!(
            "Transcript of the video:\n{}",
            truncate_chars(text, ANSWER_CONTEXT_CHARS)
        ),
        None => "No transcript is available for this video.".to_string(),
    };
    let system = format!(
        "You are a helpful assistant answering questions about the YouTube video \"{}\". \
         Base your answers on the transcript when one is provided and say so when it does \
         not cover the question. Reply in the language with code \"{language}\".\n\n{context}",
        video.title
    );
    CompletionRequest {
        messages: vec![ChatMessage::system(system), ChatMessage::user(message)],
        temperature: 0.7,
        max_tokens: 2048,
    }
}

fn suggestion_request(transcript: Option<&str>, message: &str) -> CompletionRequest {
    let summary = transcript
        .map(|text| truncate_chars(text, SUGGESTION_CONTEXT_CHARS))
        .unwrap_or("(no transcript)");
    CompletionRequest {
        messages: vec![
            ChatMessage::system(
                "Based on the video transcript and the current question, suggest 3 concise \
                 follow-up questions the user might ask next. Return only the questions as a \
                 numbered list.",
            ),
            ChatMessage::user(format!(
                "Video transcript summary: {summary}\n\nCurrent question: {message}\n\n\
                 Generate 3 relevant follow-up questions:"
            )),
        ],
        temperature: 0.8,
        max_tokens: 256,
    }
}

/// One suggestion per line, with list markers and wrapping quotes removed.
/// Short lines are dropped and at most three are kept.
pub fn parse_suggestions(text: &str) -> Vec<String> {
    text.lines()
        .map(clean_suggestion)
        .filter(|line| line.chars().count() > MIN_SUGGESTION_CHARS)
        .take(MAX_SUGGESTIONS)
        .collect()
}

fn clean_suggestion(line: &str) -> String {
    let mut line = line.trim();
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0 {
        if let Some(rest) = line[digits..]
            .strip_prefix('.')
            .or_else(|| line[digits..].strip_prefix(')'))
        {
            line = rest.trim_start();
        }
    }
    for bullet in ['-', '*', '•'] {
        if let Some(rest) = line.strip_prefix(bullet) {
            line = rest.trim_start();
        }
    }
    let line = line
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(line);
    line.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{TrackKind, TranscriptTrack};
    use crate::testing::{FakeLlm, FakeMetadata, FakeTranscripts, sample_video, temp_store};

    const URL: &str = "https://youtu.be/dQw4w9WgXcQ";

    async fn service(
        llm: FakeLlm,
        transcripts: FakeTranscripts,
    ) -> (tempfile::TempDir, ChatService, Arc<FakeLlm>) {
        let (dir, store) = temp_store().await;
        let resolver = MetadataResolver::new(
            store,
            Arc::new(FakeMetadata::default().with_video(sample_video("dQw4w9WgXcQ"))),
            Arc::new(transcripts),
        );
        let llm = Arc::new(llm);
        (dir, ChatService::new(resolver, llm.clone()), llm)
    }

    fn english_track() -> FakeTranscripts {
        FakeTranscripts::default().with_tracks(
            "dQw4w9WgXcQ",
            vec![TranscriptTrack {
                language: "en".into(),
                kind: TrackKind::Manual,
                url: "https://captions/en".into(),
            }],
        )
    }

    #[test]
    fn suggestions_are_cleaned_and_capped() {
        let text = "1. What happens at the end?\n\
                    2) \"Why is the chorus repeated?\"\n\
                    - Short one\n\
                    * Who directed the music video?\n\
                    • Where was it filmed originally?\n";
        assert_eq!(
            parse_suggestions(text),
            vec![
                "What happens at the end?".to_string(),
                "Why is the chorus repeated?".to_string(),
                "Who directed the music video?".to_string(),
            ]
        );
        assert!(parse_suggestions("").is_empty());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[tokio::test]
    async fn answer_uses_transcript_and_records_turn() {
        let llm = FakeLlm::default()
            .reply("It is about never giving up.")
            .reply("1. What year was it released?\n2. Who wrote the lyrics for it?");
        let (_dir, chat, llm) = service(llm, english_track()).await;

        let reply = chat.ask(URL, "What is it about?", "en").await.unwrap();
        assert_eq!(reply.response, "It is about never giving up.");
        assert_eq!(reply.video_id, "dQw4w9WgXcQ");
        assert_eq!(reply.suggestions.len(), 2);

        let requests = llm.requests();
        assert!(requests[0].messages[0].content.contains("segment from https://captions/en"));
        assert_eq!(requests[0].max_tokens, 2048);

        let history = chat.history(URL).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "What is it about?");
        assert_eq!(history[0].response, reply.response);
    }

    #[tokio::test]
    async fn missing_transcript_is_not_an_error() {
        let llm = FakeLlm::default().reply("General answer.").reply("");
        let (_dir, chat, llm) = service(llm, FakeTranscripts::default()).await;
        let reply = chat.ask(URL, "Anything?", "en").await.unwrap();
        assert_eq!(reply.response, "General answer.");
        assert!(reply.suggestions.is_empty());
        assert!(llm.requests()[0].messages[0].content.contains("No transcript"));
    }

    #[tokio::test]
    async fn suggestion_failure_yields_empty_list() {
        let llm = FakeLlm::default()
            .reply("Answer.")
            .fail(ProviderError::failed("rate limited"));
        let (_dir, chat, _) = service(llm, english_track()).await;
        let reply = chat.ask(URL, "Q?", "en").await.unwrap();
        assert!(reply.suggestions.is_empty());
        assert_eq!(chat.history(URL).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn answer_failure_is_a_provider_error_and_records_nothing() {
        let llm = FakeLlm::default().fail(ProviderError::Timeout(std::time::Duration::from_secs(60)));
        let (_dir, chat, _) = service(llm, english_track()).await;
        let err = chat.ask(URL, "Q?", "en").await.unwrap_err();
        assert!(matches!(err, ServiceError::Provider(ProviderError::Timeout(_))));
        assert!(chat.history(URL).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_messages_are_rejected() {
        let (_dir, chat, llm) = service(FakeLlm::default(), english_track()).await;
        let err = chat.ask(URL, "   ", "en").await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(llm.requests().is_empty());
    }
}
