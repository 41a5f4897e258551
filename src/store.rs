//! Relational persistence for videos, notes, chat turns and downloads.
//!
//! Every table hangs off `videos.video_id`, so callers must resolve (upsert) a
//! video before attaching anything to it; foreign keys are enforced.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params, params::IntoParams};
use serde::Serialize;

use crate::notes::NoteDraft;
use crate::provider::VideoMetadata;

pub const PLATFORM_YOUTUBE: &str = "youtube";

/// Row of the `videos` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoRecord {
    pub video_id: String,
    pub platform: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteRecord {
    pub id: i64,
    pub video_id: String,
    pub content: serde_json::Value,
    pub content_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRecord {
    pub id: i64,
    pub video_id: String,
    pub message: String,
    pub response: String,
    pub language: String,
    pub created_at: DateTime<Utc>,
}

/// A download row joined with the owning video's display fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadEntry {
    pub id: i64,
    pub video_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub format: String,
    pub file_path: String,
    pub file_size: i64,
    pub created_at: DateTime<Utc>,
}

/// Summary row for the note history feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteActivity {
    pub id: i64,
    pub video_id: String,
    pub video_title: String,
    pub content_text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteActivityDetail {
    #[serde(flatten)]
    pub note: NoteRecord,
    pub video_title: String,
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            video_id TEXT PRIMARY KEY,
            platform TEXT NOT NULL DEFAULT 'youtube',
            title TEXT NOT NULL,
            thumbnail TEXT,
            duration INTEGER,
            upload_date TEXT,
            channel TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS notes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            video_id TEXT NOT NULL REFERENCES videos(video_id) ON DELETE CASCADE,
            content_json TEXT NOT NULL,
            content_text TEXT NOT NULL DEFAULT '',
            timestamp INTEGER,
            tags_json TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_notes_video_id ON notes(video_id);
        CREATE INDEX IF NOT EXISTS idx_notes_updated_at ON notes(updated_at);

        CREATE TABLE IF NOT EXISTS chats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            video_id TEXT NOT NULL REFERENCES videos(video_id) ON DELETE CASCADE,
            message TEXT NOT NULL,
            response TEXT NOT NULL,
            language TEXT NOT NULL DEFAULT 'en',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chats_video_id ON chats(video_id);

        CREATE TABLE IF NOT EXISTS downloads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            video_id TEXT NOT NULL REFERENCES videos(video_id) ON DELETE CASCADE,
            format TEXT NOT NULL,
            file_path TEXT NOT NULL,
            file_size INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_downloads_video_id ON downloads(video_id);
        "#,
    )
    .await?;
    Ok(())
}

/// RFC 3339 with a fixed precision and `Z` suffix, so text ordering in SQL
/// matches chronological ordering.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("parsing stored timestamp {value:?}"))?
        .with_timezone(&Utc))
}

/// Handle to the SQLite database. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens (and if necessary creates) the database and ensures the schema
    /// exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening database {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Inserts a video or refreshes its descriptive fields. Optional fields the
    /// caller does not know keep their stored value, and `created_at` is never
    /// rewritten.
    pub async fn upsert_video(&self, video: &VideoMetadata) -> Result<VideoRecord> {
        let now = format_timestamp(Utc::now());
        self.conn
            .execute(
                r#"
                INSERT INTO videos (
                    video_id, platform, title, thumbnail, duration, upload_date, channel, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(video_id) DO UPDATE SET
                    title = CASE WHEN excluded.title = '' THEN videos.title ELSE excluded.title END,
                    thumbnail = COALESCE(excluded.thumbnail, videos.thumbnail),
                    duration = COALESCE(excluded.duration, videos.duration),
                    upload_date = COALESCE(excluded.upload_date, videos.upload_date),
                    channel = COALESCE(excluded.channel, videos.channel)
                "#,
                params![
                    video.video_id.as_str(),
                    PLATFORM_YOUTUBE,
                    video.title.as_str(),
                    video.thumbnail.as_deref(),
                    video.duration,
                    video.upload_date.as_deref(),
                    video.channel.as_deref(),
                    now
                ],
            )
            .await
            .with_context(|| format!("upserting video {}", video.video_id))?;

        self.get_video(&video.video_id)
            .await?
            .ok_or_else(|| anyhow!("video {} missing right after upsert", video.video_id))
    }

    /// Runs an `INSERT ... RETURNING id` and finalizes the statement before
    /// returning so the implicit transaction commits.
    async fn insert_returning_id(&self, sql: &str, params: impl IntoParams) -> Result<i64> {
        let mut rows = self.conn.query(sql, params).await?;
        let row = rows.next().await?.context("insert did not return an id")?;
        Ok(row.get(0)?)
    }

    pub async fn get_video(&self, video_id: &str) -> Result<Option<VideoRecord>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT video_id, platform, title, thumbnail, duration, upload_date, channel, created_at
                FROM videos
                WHERE video_id = ?1
                "#,
                [video_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn insert_note(&self, video_id: &str, draft: &NoteDraft) -> Result<NoteRecord> {
        let content_json =
            serde_json::to_string(draft.content()).context("serializing note content")?;
        let tags_json = serde_json::to_string(draft.tags()).context("serializing note tags")?;
        let now = format_timestamp(Utc::now());

        let id = self
            .insert_returning_id(
                r#"
                INSERT INTO notes (
                    video_id, content_json, content_text, timestamp, tags_json, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                RETURNING id
                "#,
                params![
                    video_id,
                    content_json,
                    draft.content_text(),
                    draft.timestamp(),
                    tags_json,
                    now
                ],
            )
            .await
            .with_context(|| format!("inserting note for {video_id}"))?;

        self.get_note(id)
            .await?
            .ok_or_else(|| anyhow!("note {id} missing right after insert"))
    }

    /// Replaces content, timestamp and tags in one statement. Returns `None`
    /// when the note does not exist.
    pub async fn update_note(&self, id: i64, draft: &NoteDraft) -> Result<Option<NoteRecord>> {
        let content_json =
            serde_json::to_string(draft.content()).context("serializing note content")?;
        let tags_json = serde_json::to_string(draft.tags()).context("serializing note tags")?;
        let now = format_timestamp(Utc::now());

        let changed = self
            .conn
            .execute(
                r#"
                UPDATE notes
                SET content_json = ?2,
                    content_text = ?3,
                    timestamp = ?4,
                    tags_json = ?5,
                    updated_at = ?6
                WHERE id = ?1
                "#,
                params![
                    id,
                    content_json,
                    draft.content_text(),
                    draft.timestamp(),
                    tags_json,
                    now
                ],
            )
            .await
            .with_context(|| format!("updating note {id}"))?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_note(id).await
    }

    pub async fn delete_note(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM notes WHERE id = ?1", [id])
            .await
            .with_context(|| format!("deleting note {id}"))?;
        Ok(changed > 0)
    }

    pub async fn get_note(&self, id: i64) -> Result<Option<NoteRecord>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, video_id, content_json, content_text, timestamp, tags_json,
                       created_at, updated_at
                FROM notes
                WHERE id = ?1
                "#,
                [id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_note(&row)?)),
            None => Ok(None),
        }
    }

    /// Notes for one video: timestamped notes in playback order first, then
    /// untimed notes, newest first within equal timestamps.
    pub async fn list_notes(&self, video_id: &str) -> Result<Vec<NoteRecord>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, video_id, content_json, content_text, timestamp, tags_json,
                       created_at, updated_at
                FROM notes
                WHERE video_id = ?1
                ORDER BY timestamp ASC NULLS LAST, created_at DESC, id DESC
                "#,
                [video_id],
            )
            .await?;
        let mut notes = Vec::new();
        while let Some(row) = rows.next().await? {
            notes.push(row_to_note(&row)?);
        }
        Ok(notes)
    }

    pub async fn append_chat(
        &self,
        video_id: &str,
        message: &str,
        response: &str,
        language: &str,
    ) -> Result<ChatRecord> {
        let created_at = Utc::now();
        let id = self
            .insert_returning_id(
                r#"
                INSERT INTO chats (video_id, message, response, language, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                RETURNING id
                "#,
                params![
                    video_id,
                    message,
                    response,
                    language,
                    format_timestamp(created_at)
                ],
            )
            .await
            .with_context(|| format!("appending chat turn for {video_id}"))?;

        Ok(ChatRecord {
            id,
            video_id: video_id.to_string(),
            message: message.to_string(),
            response: response.to_string(),
            language: language.to_string(),
            created_at,
        })
    }

    pub async fn list_chats(&self, video_id: &str) -> Result<Vec<ChatRecord>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, video_id, message, response, language, created_at
                FROM chats
                WHERE video_id = ?1
                ORDER BY created_at ASC, id ASC
                "#,
                [video_id],
            )
            .await?;
        let mut turns = Vec::new();
        while let Some(row) = rows.next().await? {
            let created_at: String = row.get(5)?;
            turns.push(ChatRecord {
                id: row.get(0)?,
                video_id: row.get(1)?,
                message: row.get(2)?,
                response: row.get(3)?,
                language: row.get(4)?,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(turns)
    }

    pub async fn append_download(
        &self,
        video_id: &str,
        format: &str,
        file_path: &str,
        file_size: i64,
    ) -> Result<DownloadEntry> {
        let id = self
            .insert_returning_id(
                r#"
                INSERT INTO downloads (video_id, format, file_path, file_size, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                RETURNING id
                "#,
                params![
                    video_id,
                    format,
                    file_path,
                    file_size,
                    format_timestamp(Utc::now())
                ],
            )
            .await
            .with_context(|| format!("recording download of {video_id}"))?;

        self.get_download(id)
            .await?
            .ok_or_else(|| anyhow!("download {id} missing right after insert"))
    }

    pub async fn get_download(&self, id: i64) -> Result<Option<DownloadEntry>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT d.id, d.video_id, v.title, v.thumbnail, d.format, d.file_path,
                       d.file_size, d.created_at
                FROM downloads d
                JOIN videos v ON v.video_id = d.video_id
                WHERE d.id = ?1
                "#,
                [id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_download(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recent downloads first.
    pub async fn list_downloads(&self, limit: u32) -> Result<Vec<DownloadEntry>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT d.id, d.video_id, v.title, v.thumbnail, d.format, d.file_path,
                       d.file_size, d.created_at
                FROM downloads d
                JOIN videos v ON v.video_id = d.video_id
                ORDER BY d.created_at DESC, d.id DESC
                LIMIT ?1
                "#,
                [i64::from(limit)],
            )
            .await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(row_to_download(&row)?);
        }
        Ok(entries)
    }

    /// Most recently edited notes first, across all videos.
    pub async fn list_note_activity(&self, limit: u32) -> Result<Vec<NoteActivity>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT n.id, n.video_id, v.title, n.content_text, n.created_at, n.updated_at
                FROM notes n
                JOIN videos v ON v.video_id = n.video_id
                ORDER BY n.updated_at DESC, n.id DESC
                LIMIT ?1
                "#,
                [i64::from(limit)],
            )
            .await?;
        let mut activity = Vec::new();
        while let Some(row) = rows.next().await? {
            let created_at: String = row.get(4)?;
            let updated_at: String = row.get(5)?;
            activity.push(NoteActivity {
                id: row.get(0)?,
                video_id: row.get(1)?,
                video_title: row.get(2)?,
                content_text: row.get(3)?,
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
            });
        }
        Ok(activity)
    }

    pub async fn get_note_activity(&self, id: i64) -> Result<Option<NoteActivityDetail>> {
        let Some(note) = self.get_note(id).await? else {
            return Ok(None);
        };
        let video_title = self
            .get_video(&note.video_id)
            .await?
            .map(|video| video.title)
            .unwrap_or_default();
        Ok(Some(NoteActivityDetail { note, video_title }))
    }
}

fn row_to_video(row: &Row) -> Result<VideoRecord> {
    let created_at: String = row.get(7)?;
    Ok(VideoRecord {
        video_id: row.get(0)?,
        platform: row.get(1)?,
        title: row.get(2)?,
        thumbnail: row.get(3)?,
        duration: row.get(4)?,
        upload_date: row.get(5)?,
        channel: row.get(6)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

/// Column order must match the SELECTs in `get_note` and `list_notes`.
fn row_to_note(row: &Row) -> Result<NoteRecord> {
    let content_json: String = row.get(2)?;
    let tags_json: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(NoteRecord {
        id: row.get(0)?,
        video_id: row.get(1)?,
        content: serde_json::from_str(&content_json).context("parsing stored note content")?,
        content_text: row.get(3)?,
        timestamp: row.get(4)?,
        tags: serde_json::from_str(&tags_json).context("parsing stored note tags")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_download(row: &Row) -> Result<DownloadEntry> {
    let created_at: String = row.get(7)?;
    Ok(DownloadEntry {
        id: row.get(0)?,
        video_id: row.get(1)?,
        title: row.get(2)?,
        thumbnail: row.get(3)?,
        format: row.get(4)?,
        file_path: row.get(5)?,
        file_size: row.get(6)?,
        created_at: parse_timestamp(&created_at)?,
    })
}
