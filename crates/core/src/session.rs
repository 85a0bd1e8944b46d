use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::path::RelativePath;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Staged content keyed by validated path. Ordered so batch boundaries are
/// deterministic.
pub type StagedFiles = BTreeMap<RelativePath, Vec<u8>>;

/// Durable state a session falls back to when a path is not staged.
pub trait DurableSource: Send + Sync {
    /// Current durable content at `path`, `None` when it does not exist.
    fn fetch<'a>(&'a self, path: &'a RelativePath) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    Text,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// What a backend did to durable state while opening the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Preparation {
    /// Files removed from the run's namespace before staging began.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<usize>,
    /// Commit that recorded the deletions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
    /// Files currently present in the run's namespace that a commit will replace.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub existing_files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Closed,
}

/// An open, in-memory transaction against one storage backend.
///
/// Writes are buffered until the owning backend finalizes the session; reads
/// see staged content first and fall through to durable state otherwise.
pub struct Session {
    id: SessionId,
    council_code: String,
    location: String,
    state: SessionState,
    staged: StagedFiles,
    source: Box<dyn DurableSource>,
    preparation: Preparation,
}

impl Session {
    /// `location` is the backend-specific address of the session's work: a
    /// directory, a branch name.
    pub fn new(
        council_code: impl Into<String>,
        location: impl Into<String>,
        source: impl DurableSource + 'static,
    ) -> Self {
        Self {
            id: SessionId::new(),
            council_code: council_code.into(),
            location: location.into(),
            state: SessionState::Open,
            staged: StagedFiles::new(),
            source: Box::new(source),
            preparation: Preparation::default(),
        }
    }

    pub fn with_preparation(mut self, preparation: Preparation) -> Self {
        self.preparation = preparation;
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn council_code(&self) -> &str {
        &self.council_code
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn preparation(&self) -> &Preparation {
        &self.preparation
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn staged_paths(&self) -> impl Iterator<Item = &RelativePath> {
        self.staged.keys()
    }

    /// Stage UTF-8 text at `path`. The last write to a path wins.
    pub fn write(&mut self, path: &str, content: &str) -> Result<()> {
        self.write_bytes(path, content.as_bytes().to_vec())
    }

    pub fn write_bytes(&mut self, path: &str, content: impl Into<Vec<u8>>) -> Result<()> {
        self.assert_open()?;
        let key = RelativePath::parse(path)?;
        self.staged.insert(key, content.into());
        Ok(())
    }

    /// Stage a zero-length file.
    pub fn touch(&mut self, path: &str) -> Result<()> {
        self.write_bytes(path, Vec::new())
    }

    /// Read `path`, preferring staged content over durable state.
    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<FileContent> {
        self.assert_open()?;
        let key = RelativePath::parse(path)?;

        let bytes = match self.staged.get(&key) {
            Some(staged) => staged.clone(),
            None => self
                .source
                .fetch(&key)
                .await?
                .ok_or_else(|| StorageError::FileNotFound(key.to_string()))?,
        };

        match mode {
            OpenMode::Binary => Ok(FileContent::Binary(bytes)),
            OpenMode::Text => Ok(FileContent::Text(String::from_utf8(bytes)?)),
        }
    }

    pub async fn read_text(&self, path: &str) -> Result<String> {
        match self.open(path, OpenMode::Text).await? {
            FileContent::Text(text) => Ok(text),
            FileContent::Binary(bytes) => Ok(String::from_utf8(bytes)?),
        }
    }

    pub async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        Ok(self.open(path, OpenMode::Binary).await?.into_bytes())
    }

    /// Hand the staged files to the backend and close the session.
    pub fn take_staged(&mut self) -> Result<StagedFiles> {
        self.assert_open()?;
        self.state = SessionState::Closed;
        Ok(std::mem::take(&mut self.staged))
    }

    /// Close without committing; staged content is dropped.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.staged.clear();
    }

    fn assert_open(&self) -> Result<()> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Closed => Err(StorageError::SessionClosed),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("council_code", &self.council_code)
            .field("location", &self.location)
            .field("state", &self.state)
            .field("staged", &self.staged.len())
            .finish_non_exhaustive()
    }
}
