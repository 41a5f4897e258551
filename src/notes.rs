//! Timestamped rich-text notes attached to videos.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::identifier::extract_video_id;
use crate::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::resolver::MetadataResolver;
use crate::store::NoteRecord;

const MAX_SUGGESTED_TAGS: usize = 5;
/// Note characters handed to the model when suggesting tags.
const TAG_CONTEXT_CHARS: usize = 1_000;

/// A writable note body. The plain-text projection is derived here and
/// nowhere else, so it can never drift from the content it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteDraft {
    content: Value,
    content_text: String,
    timestamp: Option<i64>,
    tags: Vec<String>,
}

impl NoteDraft {
    /// Tags are trimmed, blanks dropped and duplicates removed (first
    /// occurrence wins).
    pub fn new(content: Value, timestamp: Option<i64>, tags: Vec<String>) -> Self {
        let content_text = plain_text(&content);
        Self {
            content,
            content_text,
            timestamp,
            tags: normalize_tags(tags),
        }
    }

    fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = normalize_tags(tags);
        self
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn content_text(&self) -> &str {
        &self.content_text
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    fn validate(&self) -> ServiceResult<()> {
        if !self.content.is_object() {
            return Err(ServiceError::validation("note content must be a JSON object"));
        }
        if self.timestamp.is_some_and(|seconds| seconds < 0) {
            return Err(ServiceError::validation(
                "note timestamp must not be negative",
            ));
        }
        Ok(())
    }
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !unique.iter().any(|seen| seen == tag) {
            unique.push(tag.to_string());
        }
    }
    unique
}

/// Splits a comma-separated model reply into at most five tags.
pub fn parse_tags(reply: &str) -> Vec<String> {
    let mut tags = normalize_tags(reply.split(',').map(str::to_string).collect());
    tags.truncate(MAX_SUGGESTED_TAGS);
    tags
}

fn tag_request(content_text: &str) -> CompletionRequest {
    let excerpt = match content_text.char_indices().nth(TAG_CONTEXT_CHARS) {
        Some((cut, _)) => &content_text[..cut],
        None => content_text,
    };
    CompletionRequest {
        messages: vec![
            ChatMessage::system(format!(
                "You suggest relevant tags for content. Create up to {MAX_SUGGESTED_TAGS} \
                 tags and return them as a comma-separated list without explanations. \
                 Each tag is a single word or a short phrase of at most three words."
            )),
            ChatMessage::user(format!(
                "Please suggest relevant tags for this content:\n\n{excerpt}"
            )),
        ],
        temperature: 0.3,
        max_tokens: 100,
    }
}

/// Plain text of a Lexical editor document.
///
/// Each top-level block contributes its text nodes (depth first, concatenated);
/// blocks are joined with single spaces and the result is trimmed. Anything
/// that is not an object projects to the empty string.
pub fn plain_text(content: &Value) -> String {
    let Some(object) = content.as_object() else {
        return String::new();
    };
    let root = object.get("root").unwrap_or(content);
    let Some(blocks) = root.get("children").and_then(Value::as_array) else {
        return String::new();
    };

    let mut parts = Vec::with_capacity(blocks.len());
    for block in blocks {
        let mut text = String::new();
        collect_text(block, &mut text);
        let text = text.trim();
        if !text.is_empty() {
            parts.push(text.to_string());
        }
    }
    parts.join(" ")
}

fn collect_text(node: &Value, out: &mut String) {
    match node.get("type").and_then(Value::as_str) {
        Some("linebreak") => out.push(' '),
        _ => {
            if let Some(text) = node.get("text").and_then(Value::as_str) {
                out.push_str(text);
            }
        }
    }
    if let Some(children) = node.get("children").and_then(Value::as_array) {
        for child in children {
            collect_text(child, out);
        }
    }
}

#[derive(Clone)]
pub struct NoteService {
    resolver: MetadataResolver,
    llm: Arc<dyn LlmProvider>,
}

impl NoteService {
    pub fn new(resolver: MetadataResolver, llm: Arc<dyn LlmProvider>) -> Self {
        Self { resolver, llm }
    }

    /// Resolves the video first so the note always has a parent row. A note
    /// saved without tags gets model-suggested ones; if the model fails it is
    /// saved untagged.
    pub async fn save(&self, video_url: &str, draft: NoteDraft) -> ServiceResult<NoteRecord> {
        draft.validate()?;
        let video = self.resolver.resolve_video(video_url).await?;
        let draft = if draft.tags().is_empty() && !draft.content_text().is_empty() {
            let tags = self.suggest_tags(draft.content_text()).await;
            draft.with_tags(tags)
        } else {
            draft
        };
        let note = self
            .resolver
            .store()
            .insert_note(&video.video_id, &draft)
            .await?;
        info!(note_id = note.id, video_id = %note.video_id, "note saved");
        Ok(note)
    }

    async fn suggest_tags(&self, content_text: &str) -> Vec<String> {
        match self.llm.complete(&tag_request(content_text)).await {
            Ok(reply) => {
                let tags = parse_tags(&reply);
                debug!(count = tags.len(), "tags suggested");
                tags
            }
            Err(err) => {
                warn!(error = %err, "tag suggestion failed, saving without tags");
                Vec::new()
            }
        }
    }

    /// Lists without contacting the provider; an unknown video has no notes.
    pub async fn list(&self, video_url: &str) -> ServiceResult<Vec<NoteRecord>> {
        let video_id = extract_video_id(video_url).ok_or_else(|| {
            ServiceError::validation(format!("not a recognized video URL: {video_url}"))
        })?;
        Ok(self.resolver.store().list_notes(&video_id).await?)
    }

    pub async fn update(&self, id: i64, draft: NoteDraft) -> ServiceResult<NoteRecord> {
        draft.validate()?;
        self.resolver
            .store()
            .update_note(id, &draft)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("note {id} not found")))
    }

    pub async fn delete(&self, id: i64) -> ServiceResult<()> {
        if self.resolver.store().delete_note(id).await? {
            info!(note_id = id, "note deleted");
            Ok(())
        } else {
            Err(ServiceError::not_found(format!("note {id} not found")))
        }
    }
}
