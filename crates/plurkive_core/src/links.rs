use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::archive::{BackupLayout, parse_post_file, parse_reply_file};
use crate::fts::{self, LINKS, MutatingStore};
use crate::import::FileFailure;
use crate::scan::ScanRange;
use crate::store::{ArchiveStore, table_exists};

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".svg"];
const URL_SCHEMES: &[&str] = &["http://", "https://"];
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];

const LINK_SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS link_metadata (
    url TEXT PRIMARY KEY,
    og_title TEXT,
    og_description TEXT,
    og_site_name TEXT,
    sources JSON,
    status TEXT DEFAULT 'pending',
    fetched_at TEXT
)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Pending,
    Success,
    NoOg,
    Timeout,
    Failed,
    Image,
}

impl LinkStatus {
    pub const ALL: [LinkStatus; 6] = [
        Self::Pending,
        Self::Success,
        Self::NoOg,
        Self::Timeout,
        Self::Failed,
        Self::Image,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::NoOg => "no_og",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| anyhow::anyhow!("unknown link status '{value}'"))
    }
}

/// Ids of the posts and replies that mention a URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSources {
    #[serde(default, alias = "plurk_ids")]
    pub post_ids: Vec<i64>,
    #[serde(default, alias = "response_ids")]
    pub reply_ids: Vec<i64>,
}

impl LinkSources {
    pub fn from_post(id: i64) -> Self {
        Self {
            post_ids: vec![id],
            reply_ids: Vec::new(),
        }
    }

    pub fn from_reply(id: i64) -> Self {
        Self {
            post_ids: Vec::new(),
            reply_ids: vec![id],
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize link sources")
    }

    /// Unparseable stored JSON reads as empty so a later merge can repair it.
    pub fn from_json(raw: Option<&str>) -> Self {
        raw.and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// Union of both id sets, deduplicated and sorted ascending.
pub fn merge_sources(existing: &LinkSources, new: &LinkSources) -> LinkSources {
    fn union(left: &[i64], right: &[i64]) -> Vec<i64> {
        left.iter()
            .chain(right)
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
    LinkSources {
        post_ids: union(&existing.post_ids, &new.post_ids),
        reply_ids: union(&existing.reply_ids, &new.reply_ids),
    }
}

fn is_url_terminator(ch: char) -> bool {
    ch.is_whitespace()
        || ('\u{4e00}'..='\u{9fff}').contains(&ch)
        || ('\u{3000}'..='\u{303f}').contains(&ch)
        || matches!(
            ch,
            '<' | '>' | '"' | '\'' | ']' | ')' | '）' | '」' | '』' | '】'
        )
}

/// Every `http://` or `https://` URL in `text`, in order of appearance.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let mut cursor = 0;
    while cursor < text.len() {
        let rest = &text[cursor..];
        let next = URL_SCHEMES
            .iter()
            .filter_map(|scheme| rest.find(scheme).map(|at| (at, scheme.len())))
            .min_by_key(|(at, _)| *at);
        let Some((at, scheme_len)) = next else {
            break;
        };
        let start = cursor + at;
        let body_start = start + scheme_len;
        let body_len = text[body_start..]
            .find(is_url_terminator)
            .unwrap_or(text.len() - body_start);
        let run = &text[body_start..body_start + body_len];
        let trimmed = run.trim_end_matches(TRAILING_PUNCTUATION);
        if !trimmed.is_empty() {
            urls.push(text[start..body_start + trimmed.len()].to_string());
        }
        cursor = body_start + body_len;
    }
    urls
}

/// True when the URL path (query and fragment ignored) ends in an image extension.
pub fn is_image_url(url: &str) -> bool {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment);
    let after_scheme = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest);
    let path = after_scheme
        .find('/')
        .map_or("", |slash| &after_scheme[slash..])
        .to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

pub fn is_image_content_type(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|value| value.trim().to_ascii_lowercase().starts_with("image/"))
}

/// Parses `YYYYMM` into a single-month range.
pub fn parse_month_arg(value: &str) -> Result<ScanRange> {
    let value = value.trim();
    if value.len() != 6 || !value.bytes().all(|b| b.is_ascii_digit()) {
        bail!("--month must be YYYYMM (e.g. 201810), got '{value}'");
    }
    let month: u32 = value[4..].parse().context("invalid month digits")?;
    if !(1..=12).contains(&month) {
        bail!("month must be 01-12, got '{}'", &value[4..]);
    }
    Ok(ScanRange::single_month(&format!(
        "{}-{}",
        &value[..4],
        &value[4..]
    )))
}

/// Creates the link table and its index on first use.
pub fn ensure_link_tables(connection: &Connection, tokenizer: &str) -> Result<()> {
    connection
        .execute_batch(LINK_SCHEMA_SQL)
        .context("failed to create link_metadata table")?;
    fts::ensure_index(connection, &LINKS, tokenizer)
}

/// Inserts a newly seen URL, or merges `sources` into an existing record.
/// Returns `true` for a new record.
pub fn upsert_link(store: &MutatingStore<'_>, url: &str, sources: &LinkSources) -> Result<bool> {
    let existing = store
        .connection()
        .query_row(
            "SELECT sources FROM link_metadata WHERE url = ?1",
            [url],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .with_context(|| format!("failed to look up link {url}"))?;

    match existing {
        None => {
            let status = if is_image_url(url) {
                LinkStatus::Image
            } else {
                LinkStatus::Pending
            };
            let merged = merge_sources(&LinkSources::default(), sources);
            store.insert_if_absent(
                &LINKS,
                &["url", "sources", "status"],
                &[&url, &merged.to_json()?, &status.as_str()],
            )
        }
        Some(raw) => {
            let merged = merge_sources(&LinkSources::from_json(raw.as_deref()), sources);
            store.update(&LINKS, &url, &[("sources", &merged.to_json()?)])?;
            Ok(false)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractReport {
    pub range: ScanRange,
    pub post_files: usize,
    pub reply_files: usize,
    pub unique_urls: usize,
    pub image_urls: usize,
    pub page_urls: usize,
    pub new_links: usize,
    pub new_images: usize,
    pub merged: usize,
    pub failures: Vec<FileFailure>,
    pub urls: Vec<String>,
}

/// Collects URLs from in-range post files and the reply files of their
/// threads, then upserts them in one transaction.
pub fn extract_links(
    store: &mut ArchiveStore,
    layout: &BackupLayout,
    range: &ScanRange,
) -> Result<ExtractReport> {
    layout.validate()?;
    let post_files = layout.list_post_files(range)?;
    if post_files.is_empty() {
        log::warn!("no post files found for {}", range.describe());
    }

    let mut found: BTreeMap<String, LinkSources> = BTreeMap::new();
    let mut failures = Vec::new();
    let mut thread_ids = HashSet::new();

    for path in &post_files {
        let fragment = match parse_post_file(path) {
            Ok(fragment) => fragment,
            Err(error) => {
                push_failure(&mut failures, path, &error);
                continue;
            }
        };
        let before = found.len();
        for record in &fragment.records {
            if let Some(base_id) = record.base_id.as_deref().filter(|id| !id.is_empty()) {
                thread_ids.insert(base_id.to_string());
            }
            for url in extract_urls(record.content_raw.as_deref().unwrap_or_default()) {
                collect(&mut found, url, LinkSources::from_post(record.id));
            }
        }
        log::debug!("{}: {} new URLs", path.display(), found.len() - before);
    }

    let reply_files = layout.list_reply_files(&thread_ids)?;
    for path in &reply_files {
        let fragment = match parse_reply_file(path) {
            Ok(fragment) => fragment,
            Err(error) => {
                push_failure(&mut failures, path, &error);
                continue;
            }
        };
        for record in &fragment.records {
            for url in extract_urls(record.content_raw.as_deref().unwrap_or_default()) {
                collect(&mut found, url, LinkSources::from_reply(record.id));
            }
        }
    }

    let image_urls = found.keys().filter(|url| is_image_url(url)).count();
    let tokenizer = store.tokenizer().to_string();
    let transaction = store
        .connection_mut()
        .transaction()
        .context("failed to start link extraction transaction")?;
    ensure_link_tables(&transaction, &tokenizer)?;

    let mut new_links = 0;
    let mut new_images = 0;
    let mut merged = 0;
    {
        let mutating = MutatingStore::new(&transaction);
        for (url, sources) in &found {
            if upsert_link(&mutating, url, sources)? {
                if is_image_url(url) {
                    new_images += 1;
                } else {
                    new_links += 1;
                }
            } else {
                merged += 1;
            }
        }
    }
    transaction
        .commit()
        .context("failed to commit link extraction")?;

    log::info!(
        "found {} unique URLs; {} new links, {} new images, {} merged",
        found.len(),
        new_links,
        new_images,
        merged
    );
    Ok(ExtractReport {
        range: range.clone(),
        post_files: post_files.len(),
        reply_files: reply_files.len(),
        unique_urls: found.len(),
        image_urls,
        page_urls: found.len() - image_urls,
        new_links,
        new_images,
        merged,
        failures,
        urls: found.into_keys().collect(),
    })
}

fn collect(found: &mut BTreeMap<String, LinkSources>, url: String, sources: LinkSources) {
    let entry = found.entry(url).or_default();
    *entry = merge_sources(entry, &sources);
}

fn push_failure(failures: &mut Vec<FileFailure>, path: &Path, error: &anyhow::Error) {
    log::warn!("skipping {}: {error:#}", path.display());
    failures.push(FileFailure {
        path: path.to_path_buf(),
        message: format!("{error:#}"),
    });
}

/// Link counts per status, or `None` before any extraction pass has run.
pub fn link_status_counts(connection: &Connection) -> Result<Option<BTreeMap<String, usize>>> {
    if !table_exists(connection, "link_metadata")? {
        return Ok(None);
    }
    let mut statement = connection
        .prepare("SELECT status, COUNT(*) FROM link_metadata GROUP BY status ORDER BY status")
        .context("failed to prepare link status query")?;
    let rows = statement
        .query_map([], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, i64>(1)?,
            ))
        })
        .context("failed to run link status query")?;

    let mut out = BTreeMap::new();
    for row in rows {
        let (status, count) = row.context("failed to decode link status row")?;
        let count = usize::try_from(count).context("status count does not fit into usize")?;
        out.insert(status.unwrap_or_else(|| "unknown".to_string()), count);
    }
    Ok(Some(out))
}
