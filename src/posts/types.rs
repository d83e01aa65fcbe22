use super::error::PostsError;
use bytes::{Buf, Bytes};
use chrono::{DateTime, NaiveDate, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, pin::Pin};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

/// Primary key of a post: ordered by date, then slug.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PostIdentity {
    pub date: i64,
    pub slug: String,
}

impl PostIdentity {
    pub fn new(date: i64, slug: impl Into<String>) -> Self {
        Self {
            date,
            slug: slug.into(),
        }
    }
}

impl fmt::Display for PostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.slug, self.date)
    }
}

/// The metadata file contents. The slug is not stored; it is the directory name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub slug: String,
    pub date: i64,
    pub title: String,
    pub body: String,
    pub image: Option<String>,
    pub summary: Option<String>,
}

impl Post {
    pub fn from_record(slug: impl Into<String>, record: PostRecord) -> Self {
        Self {
            slug: slug.into(),
            date: record.date,
            title: record.title,
            body: record.body,
            image: record.image,
            summary: record.summary,
        }
    }

    pub fn identity(&self) -> PostIdentity {
        PostIdentity::new(self.date, self.slug.clone())
    }

    pub fn date_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.date)
    }
}

/// Denormalized subset of a post kept in the chronological index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProjection {
    pub title: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostEntry {
    pub identity: PostIdentity,
    pub projection: PostProjection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanDirection {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// An uploaded asset, consumed as a byte stream.
pub struct Upload {
    pub file_name: String,
    pub(super) reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl Upload {
    pub fn new<R>(file_name: impl Into<String>, reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            file_name: file_name.into(),
            reader: Box::pin(reader),
        }
    }

    /// Wraps a stream of byte chunks, such as a multipart form field.
    pub fn from_stream<S, B, E>(file_name: impl Into<String>, stream: S) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: Buf + Send + 'static,
        E: Into<std::io::Error> + 'static,
    {
        Self::new(file_name, StreamReader::new(stream))
    }

    pub fn from_bytes(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(file_name, std::io::Cursor::new(data.into()))
    }
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct CreatePostInput {
    pub title: String,
    pub body: String,
    /// Defaults to the current time.
    pub date: Option<i64>,
    /// Derived from the title when absent.
    pub slug: Option<String>,
    pub summary: Option<String>,
    pub upload: Option<Upload>,
}

impl CreatePostInput {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_date(mut self, date: i64) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_upload(mut self, upload: Upload) -> Self {
        self.upload = Some(upload);
        self
    }
}

/// Fields left as `None` keep their current value.
#[derive(Debug, Default)]
pub struct UpdatePostInput {
    pub title: Option<String>,
    pub body: Option<String>,
    pub date: Option<i64>,
    pub slug: Option<String>,
    pub summary: Option<String>,
    pub upload: Option<Upload>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPost {
    pub slug: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub indexed: usize,
    pub skipped: Vec<SkippedPost>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Post directories with a readable record but no index entry.
    pub missing_from_index: Vec<PostIdentity>,
    /// Index entries with no matching post directory.
    pub orphaned_entries: Vec<PostIdentity>,
    pub unreadable: Vec<SkippedPost>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_from_index.is_empty()
            && self.orphaned_entries.is_empty()
            && self.unreadable.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostsConfig {
    pub source_directory: PathBuf,
    pub index_file: String,
    pub posts_per_page: usize,
    pub summary_max_chars: usize,
}

impl Default for PostsConfig {
    fn default() -> Self {
        Self {
            source_directory: PathBuf::from("posts"),
            index_file: String::from("index.db"),
            posts_per_page: 20,
            summary_max_chars: 250,
        }
    }
}

impl PostsConfig {
    pub fn with_source_directory(source_directory: impl Into<PathBuf>) -> Self {
        Self {
            source_directory: source_directory.into(),
            ..Default::default()
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.source_directory.join(&self.index_file)
    }
}

/// Parses a user-supplied date into epoch milliseconds.
///
/// Accepts raw milliseconds, RFC 3339 timestamps, and plain `YYYY-MM-DD`
/// dates (midnight UTC).
pub fn parse_timestamp(input: &str) -> Result<i64, PostsError> {
    let input = input.trim();

    if let Ok(millis) = input.parse::<i64>() {
        return Ok(millis);
    }

    if let Ok(date) = DateTime::parse_from_rfc3339(input) {
        return Ok(date.timestamp_millis());
    }

    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        && let Some(midnight) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(midnight.and_utc().timestamp_millis());
    }

    Err(PostsError::Validation(format!(
        "Unable to parse date: {}",
        input
    )))
}
