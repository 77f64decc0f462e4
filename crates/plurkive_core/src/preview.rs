use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::io::{self, Read};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use rusqlite::{Connection, OptionalExtension};
use scraper::{Html, Selector};
use serde::Serialize;

use crate::config::FetchSettings;
use crate::fts::{LINKS, MutatingStore};
use crate::links::{LinkStatus, is_image_content_type};
use crate::store::{ArchiveStore, table_exists};

const MAX_BODY_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewResult {
    pub url: String,
    pub status: LinkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PreviewResult {
    pub fn bare(url: &str, status: LinkStatus) -> Self {
        Self {
            url: url.to_string(),
            status,
            title: None,
            description: None,
            site_name: None,
            error: None,
        }
    }

    fn errored(url: &str, status: LinkStatus, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::bare(url, status)
        }
    }
}

pub trait PreviewFetcher {
    fn fetch(&mut self, url: &str) -> PreviewResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    Timeout(String),
    Failed(String),
}

/// Runs `attempt` up to `attempts` times. A timeout ends the loop at once;
/// any other error is retried and the last one reported as `failed`.
pub fn fetch_with_retries<F>(url: &str, attempts: u32, mut attempt: F) -> PreviewResult
where
    F: FnMut(&str) -> Result<PreviewResult, AttemptError>,
{
    let mut last_error = None;
    for _ in 0..attempts.max(1) {
        match attempt(url) {
            Ok(result) => return result,
            Err(AttemptError::Timeout(message)) => {
                return PreviewResult::errored(url, LinkStatus::Timeout, message);
            }
            Err(AttemptError::Failed(message)) => {
                log::debug!("attempt for {url} failed: {message}");
                last_error = Some(message);
            }
        }
    }
    PreviewResult {
        error: last_error,
        ..PreviewResult::bare(url, LinkStatus::Failed)
    }
}

/// An image content type wins over the body; `<title>` stands in for a missing `og:title`.
pub fn classify_page(url: &str, content_type: Option<&str>, html: &str) -> PreviewResult {
    if is_image_content_type(content_type) {
        return PreviewResult::bare(url, LinkStatus::Image);
    }

    let document = Html::parse_document(html);
    let mut og: HashMap<String, String> = HashMap::new();
    if let Ok(selector) = Selector::parse(r#"meta[property^="og:"]"#) {
        for element in document.select(&selector) {
            let property = element.value().attr("property").unwrap_or_default();
            let content = element.value().attr("content").unwrap_or_default();
            if let Some(key) = property.strip_prefix("og:")
                && !content.is_empty()
            {
                og.insert(key.to_string(), content.to_string());
            }
        }
    }
    let page_title = Selector::parse("title")
        .ok()
        .and_then(|selector| {
            document
                .select(&selector)
                .next()
                .map(|element| element.text().collect::<String>())
        })
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty());

    if og.is_empty() && page_title.is_none() {
        return PreviewResult::bare(url, LinkStatus::NoOg);
    }

    let non_blank = |value: Option<&String>| {
        value
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    PreviewResult {
        title: non_blank(og.get("title")).or(page_title),
        description: non_blank(og.get("description")),
        site_name: non_blank(og.get("site_name")),
        ..PreviewResult::bare(url, LinkStatus::Success)
    }
}

pub struct HttpPreviewFetcher {
    client: Client,
    attempts: u32,
}

impl HttpPreviewFetcher {
    pub fn new(settings: &FetchSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .user_agent(settings.user_agent.clone())
            .build()
            .context("failed to build preview HTTP client")?;
        Ok(Self {
            client,
            attempts: settings.retries,
        })
    }

    fn fetch_once(&self, url: &str) -> Result<PreviewResult, AttemptError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .map_err(classify_request_error)?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        if is_image_content_type(content_type.as_deref()) {
            return Ok(PreviewResult::bare(url, LinkStatus::Image));
        }

        // error pages still carry usable titles, so the status code is not checked
        let mut body = Vec::new();
        response
            .take(MAX_BODY_BYTES)
            .read_to_end(&mut body)
            .map_err(|error| {
                if body_read_timed_out(&error) {
                    AttemptError::Timeout(error.to_string())
                } else {
                    AttemptError::Failed(error.to_string())
                }
            })?;
        let html = String::from_utf8_lossy(&body);
        Ok(classify_page(url, content_type.as_deref(), &html))
    }
}

fn classify_request_error(error: reqwest::Error) -> AttemptError {
    if error.is_timeout() {
        AttemptError::Timeout(error.to_string())
    } else {
        AttemptError::Failed(error.to_string())
    }
}

fn body_read_timed_out(error: &io::Error) -> bool {
    if error.kind() == io::ErrorKind::TimedOut {
        return true;
    }
    let mut current: Option<&(dyn StdError + 'static)> =
        error.get_ref().map(|inner| inner as &(dyn StdError + 'static));
    while let Some(inner) = current {
        if let Some(reqwest_error) = inner.downcast_ref::<reqwest::Error>()
            && reqwest_error.is_timeout()
        {
            return true;
        }
        if let Some(io_error) = inner.downcast_ref::<io::Error>()
            && io_error.kind() == io::ErrorKind::TimedOut
        {
            return true;
        }
        current = inner.source();
    }
    false
}

impl PreviewFetcher for HttpPreviewFetcher {
    fn fetch(&mut self, url: &str) -> PreviewResult {
        let attempts = self.attempts;
        fetch_with_retries(url, attempts, |url| self.fetch_once(url))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSelection {
    Pending { limit: Option<usize> },
    /// Only these URLs, and only while they are still pending.
    Urls(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub attempted: usize,
    pub by_status: BTreeMap<LinkStatus, usize>,
}

pub fn select_pending(connection: &Connection, selection: &FetchSelection) -> Result<Vec<String>> {
    if !table_exists(connection, "link_metadata")? {
        bail!("link_metadata table does not exist; run `plurkive links extract` first");
    }
    match selection {
        FetchSelection::Pending { limit } => {
            let limit = match limit {
                Some(limit) => i64::try_from(*limit).context("limit does not fit into i64")?,
                None => -1,
            };
            let mut statement = connection
                .prepare(
                    "SELECT url FROM link_metadata WHERE status = 'pending'
                     ORDER BY rowid LIMIT ?1",
                )
                .context("failed to prepare pending link query")?;
            let rows = statement
                .query_map([limit], |row| row.get::<_, String>(0))
                .context("failed to run pending link query")?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("failed to decode pending link row")?);
            }
            Ok(out)
        }
        FetchSelection::Urls(urls) => {
            let mut statement = connection
                .prepare("SELECT status FROM link_metadata WHERE url = ?1")
                .context("failed to prepare link status lookup")?;
            let mut out = Vec::new();
            for url in urls {
                let status: Option<Option<String>> = statement
                    .query_row([url], |row| row.get(0))
                    .optional()
                    .with_context(|| format!("failed to look up link {url}"))?;
                if status.flatten().as_deref() == Some(LinkStatus::Pending.as_str()) {
                    out.push(url.clone());
                }
            }
            Ok(out)
        }
    }
}

pub fn persist_preview(
    store: &MutatingStore<'_>,
    result: &PreviewResult,
    fetched_at: &str,
) -> Result<bool> {
    store.update(
        &LINKS,
        &result.url,
        &[
            ("og_title", &result.title),
            ("og_description", &result.description),
            ("og_site_name", &result.site_name),
            ("status", &result.status.as_str()),
            ("fetched_at", &fetched_at),
        ],
    )
}

/// Fetches every selected link in order, committing each result before the
/// next request so an interrupted pass resumes from the remaining pending links.
pub fn fetch_previews(
    store: &mut ArchiveStore,
    fetcher: &mut dyn PreviewFetcher,
    selection: &FetchSelection,
) -> Result<FetchReport> {
    let urls = select_pending(store.connection(), selection)?;
    let mut report = FetchReport::default();
    if urls.is_empty() {
        log::info!("no pending URLs to fetch");
        return Ok(report);
    }
    log::info!("fetching previews for {} URLs", urls.len());

    let total = urls.len();
    for (idx, url) in urls.iter().enumerate() {
        let result = fetcher.fetch(url);
        let fetched_at = chrono::Utc::now().to_rfc3339();
        let transaction = store
            .connection_mut()
            .transaction()
            .context("failed to start preview transaction")?;
        persist_preview(&MutatingStore::new(&transaction), &result, &fetched_at)?;
        transaction
            .commit()
            .with_context(|| format!("failed to commit preview for {url}"))?;

        log::info!("[{}/{total}] {} {url}", idx + 1, result.status);
        if let Some(error) = &result.error {
            log::debug!("{url}: {error}");
        }
        report.attempted += 1;
        *report.by_status.entry(result.status).or_default() += 1;
    }
    Ok(report)
}
