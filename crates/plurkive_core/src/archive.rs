use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::scan::ScanRange;

const POSTS_PREFIX: &str = "BackupData.plurks[\"";
const REPLIES_PREFIX: &str = "BackupData.responses[\"";

#[derive(Debug, Error)]
pub enum MalformedArchiveError {
    #[error("missing `{prefix}...\"]` label")]
    MissingLabel { prefix: &'static str },
    #[error("missing `]=[ ... ]` payload delimiters")]
    MissingPayload,
    #[error("payload is not a JSON array of records: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PostRecord {
    pub id: i64,
    #[serde(default)]
    pub base_id: Option<String>,
    #[serde(default)]
    pub content_raw: Option<String>,
    #[serde(default)]
    pub posted: Option<String>,
    #[serde(default)]
    pub response_count: Option<i64>,
    #[serde(default)]
    pub qualifier: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct ReplyAuthor {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub nick_name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReplyRecord {
    pub id: i64,
    #[serde(default)]
    pub content_raw: Option<String>,
    #[serde(default)]
    pub posted: Option<String>,
    #[serde(default)]
    pub user: Option<ReplyAuthor>,
}

/// One parsed fragment: its label (month key or thread id) and records in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment<T> {
    pub label: String,
    pub records: Vec<T>,
}

pub fn parse_post_fragment(text: &str) -> Result<Fragment<PostRecord>, MalformedArchiveError> {
    parse_fragment(text, POSTS_PREFIX)
}

pub fn parse_reply_fragment(text: &str) -> Result<Fragment<ReplyRecord>, MalformedArchiveError> {
    parse_fragment(text, REPLIES_PREFIX)
}

pub fn parse_post_file(path: &Path) -> Result<Fragment<PostRecord>> {
    let text = read_fragment(path)?;
    parse_post_fragment(&text).with_context(|| format!("malformed post file {}", path.display()))
}

pub fn parse_reply_file(path: &Path) -> Result<Fragment<ReplyRecord>> {
    let text = read_fragment(path)?;
    parse_reply_fragment(&text).with_context(|| format!("malformed reply file {}", path.display()))
}

fn read_fragment(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn parse_fragment<T>(text: &str, prefix: &'static str) -> Result<Fragment<T>, MalformedArchiveError>
where
    T: for<'de> Deserialize<'de>,
{
    let text = text.trim_start_matches('\u{feff}').trim_start();
    let rest = text
        .strip_prefix(prefix)
        .ok_or(MalformedArchiveError::MissingLabel { prefix })?;
    let label_end = rest
        .find('"')
        .ok_or(MalformedArchiveError::MissingLabel { prefix })?;
    let label = &rest[..label_end];
    if label.is_empty() {
        return Err(MalformedArchiveError::MissingLabel { prefix });
    }

    let after_label = &rest[label_end..];
    let assign = after_label
        .find("]=")
        .ok_or(MalformedArchiveError::MissingPayload)?;
    let payload_start = label_end + assign + 2;
    let payload_end = rest
        .rfind(']')
        .filter(|end| *end >= payload_start)
        .ok_or(MalformedArchiveError::MissingPayload)?;
    let payload = &rest[payload_start..=payload_end];

    let records: Vec<T> = serde_json::from_str(payload)?;
    Ok(Fragment {
        label: label.to_string(),
        records,
    })
}

/// The on-disk layout of an unpacked backup.
#[derive(Debug, Clone)]
pub struct BackupLayout {
    root: PathBuf,
}

impl BackupLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn posts_dir(&self) -> PathBuf {
        self.root.join("data").join("plurks")
    }

    pub fn replies_dir(&self) -> PathBuf {
        self.root.join("data").join("responses")
    }

    pub fn index_file(&self) -> PathBuf {
        self.root.join("data").join("indexes.js")
    }

    pub fn validate(&self) -> Result<()> {
        let missing = [self.posts_dir(), self.replies_dir(), self.index_file()]
            .into_iter()
            .filter(|path| !path.exists())
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            bail!(
                "{} is not a backup directory; missing: {}",
                self.root.display(),
                missing.join(", ")
            );
        }
        Ok(())
    }

    /// Post files whose `YYYY_MM` stem falls inside `range`, sorted by name.
    pub fn list_post_files(&self, range: &ScanRange) -> Result<Vec<PathBuf>> {
        let files = list_fragment_files(&self.posts_dir())?;
        Ok(files
            .into_iter()
            .filter(|path| file_stem(path).is_some_and(|stem| range.contains(&month_key(stem))))
            .collect())
    }

    /// Reply files named after one of `thread_ids`, sorted by name.
    pub fn list_reply_files(&self, thread_ids: &HashSet<String>) -> Result<Vec<PathBuf>> {
        if thread_ids.is_empty() {
            return Ok(Vec::new());
        }
        let files = list_fragment_files(&self.replies_dir())?;
        Ok(files
            .into_iter()
            .filter(|path| file_stem(path).is_some_and(|stem| thread_ids.contains(stem)))
            .collect())
    }
}

/// `2008_12` → `2008-12`
pub fn month_key(stem: &str) -> String {
    stem.replace('_', "-")
}

fn file_stem(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|stem| stem.to_str())
}

fn list_fragment_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        if path.extension().is_some_and(|ext| ext == "js") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs;
    use std::path::Path;

    /// Writes an empty backup skeleton under `root`.
    pub fn backup_skeleton(root: &Path) {
        fs::create_dir_all(root.join("data/plurks")).expect("plurks dir");
        fs::create_dir_all(root.join("data/responses")).expect("responses dir");
        fs::write(root.join("data/indexes.js"), "BackupData.indexes={};").expect("indexes");
    }

    pub fn write_posts(root: &Path, month: &str, json: &str) {
        fs::write(
            root.join("data/plurks").join(format!("{month}.js")),
            format!("BackupData.plurks[\"{month}\"]={json};"),
        )
        .expect("write posts");
    }

    pub fn write_replies(root: &Path, thread: &str, json: &str) {
        fs::write(
            root.join("data/responses").join(format!("{thread}.js")),
            format!("BackupData.responses[\"{thread}\"]={json};"),
        )
        .expect("write replies");
    }
}
