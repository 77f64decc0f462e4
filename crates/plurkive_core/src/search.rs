use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::config::ArchiveConfig;
use crate::links::LinkSources;
use crate::runtime::ResolvedPaths;
use crate::store::{TokenizerChoice, count_rows, open_existing, resolve_tokenizer, table_exists};

pub const RESULTS_PER_PAGE: usize = 50;

const LINK_TABLE_MISSING: &str =
    "Link search not available. Run `plurkive links extract` first.";
const LINK_INDEX_MISSING: &str = "FTS index not available for links.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    All,
    Posts,
    Replies,
    Links,
}

impl FromStr for SearchScope {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "all" => Ok(Self::All),
            "posts" | "plurks" => Ok(Self::Posts),
            "replies" | "responses" => Ok(Self::Replies),
            "links" => Ok(Self::Links),
            other => bail!("unknown search type '{other}' (expected all, posts, replies, links)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Fts,
    Like,
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "fts" => Ok(Self::Fts),
            "like" => Ok(Self::Like),
            other => bail!("unknown search mode '{other}' (expected fts, like)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostHit {
    pub id: i64,
    pub base_id: Option<String>,
    pub content_raw: Option<String>,
    pub posted: Option<String>,
    pub qualifier: Option<String>,
    pub response_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyHit {
    pub id: i64,
    pub base_id: Option<String>,
    pub content_raw: Option<String>,
    pub posted: Option<String>,
    pub user_nick: Option<String>,
    pub user_display: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkHit {
    pub url: String,
    pub og_title: Option<String>,
    pub og_description: Option<String>,
    pub og_site_name: Option<String>,
    pub sources: LinkSources,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchHit {
    Post(PostHit),
    Reply(ReplyHit),
    Link(LinkHit),
}

impl SearchHit {
    pub fn posted(&self) -> Option<&str> {
        match self {
            Self::Post(hit) => hit.posted.as_deref(),
            Self::Reply(hit) => hit.posted.as_deref(),
            Self::Link(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub total: usize,
    pub page: u32,
    pub pages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SearchResponse {
    fn empty(page: u32) -> Self {
        Self {
            results: Vec::new(),
            total: 0,
            page,
            pages: 1,
            error: None,
        }
    }

    fn unavailable(page: u32, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::empty(page)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveStats {
    pub post_count: usize,
    pub reply_count: usize,
    pub link_count: usize,
    pub link_with_preview: usize,
}

/// Where a post lives, enough for a viewer to open its thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostLocation {
    pub thread_id: Option<String>,
    pub posted: Option<String>,
}

/// Each whitespace-separated term becomes a quoted prefix query; terms are AND-ed.
pub fn build_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"*", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Substring pattern for `LIKE ... ESCAPE '\'`.
pub fn build_like_pattern(query: &str) -> String {
    let escaped = query
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn page_count(total: usize) -> usize {
    total.div_ceil(RESULTS_PER_PAGE).max(1)
}

fn page_bounds(page: u32) -> (i64, i64) {
    let limit = RESULTS_PER_PAGE as i64;
    (limit, i64::from(page) * limit)
}

struct ContentSource {
    select: &'static str,
    fts_from: &'static str,
    like_from: &'static str,
    fts_count: &'static str,
    like_count: &'static str,
}

const POST_SOURCE: ContentSource = ContentSource {
    select: "SELECT 'post' AS kind, c.id AS id, c.base_id AS base_id, c.content_raw AS content_raw,
                c.posted AS posted, c.qualifier AS qualifier, c.response_count AS response_count,
                NULL AS user_nick, NULL AS user_display",
    fts_from: "FROM posts c JOIN posts_fts ON posts_fts.rowid = c.id WHERE posts_fts MATCH ?1",
    like_from: "FROM posts c WHERE c.content_raw LIKE ?1 ESCAPE '\\'",
    fts_count: "SELECT COUNT(*) FROM posts_fts WHERE posts_fts MATCH ?1",
    like_count: "SELECT COUNT(*) FROM posts WHERE content_raw LIKE ?1 ESCAPE '\\'",
};

const REPLY_SOURCE: ContentSource = ContentSource {
    select: "SELECT 'reply' AS kind, c.id AS id, c.base_id AS base_id, c.content_raw AS content_raw,
                c.posted AS posted, NULL AS qualifier, NULL AS response_count,
                c.user_nick AS user_nick, c.user_display AS user_display",
    fts_from: "FROM replies c JOIN replies_fts ON replies_fts.rowid = c.id WHERE replies_fts MATCH ?1",
    like_from: "FROM replies c WHERE c.content_raw LIKE ?1 ESCAPE '\\'",
    fts_count: "SELECT COUNT(*) FROM replies_fts WHERE replies_fts MATCH ?1",
    like_count: "SELECT COUNT(*) FROM replies WHERE content_raw LIKE ?1 ESCAPE '\\'",
};

impl ContentSource {
    fn select_sql(&self, mode: SearchMode) -> String {
        let from = match mode {
            SearchMode::Fts => self.fts_from,
            SearchMode::Like => self.like_from,
        };
        format!("{} {from}", self.select)
    }

    fn count_sql(&self, mode: SearchMode) -> &'static str {
        match mode {
            SearchMode::Fts => self.fts_count,
            SearchMode::Like => self.like_count,
        }
    }
}

fn content_hit(row: &Row<'_>) -> rusqlite::Result<SearchHit> {
    let kind: String = row.get("kind")?;
    if kind == "post" {
        Ok(SearchHit::Post(PostHit {
            id: row.get("id")?,
            base_id: row.get("base_id")?,
            content_raw: row.get("content_raw")?,
            posted: row.get("posted")?,
            qualifier: row.get("qualifier")?,
            response_count: row.get("response_count")?,
        }))
    } else {
        Ok(SearchHit::Reply(ReplyHit {
            id: row.get("id")?,
            base_id: row.get("base_id")?,
            content_raw: row.get("content_raw")?,
            posted: row.get("posted")?,
            user_nick: row.get("user_nick")?,
            user_display: row.get("user_display")?,
        }))
    }
}

fn link_hit(row: &Row<'_>) -> rusqlite::Result<SearchHit> {
    let sources: Option<String> = row.get("sources")?;
    Ok(SearchHit::Link(LinkHit {
        url: row.get("url")?,
        og_title: row.get("og_title")?,
        og_description: row.get("og_description")?,
        og_site_name: row.get("og_site_name")?,
        sources: LinkSources::from_json(sources.as_deref()),
        status: row.get("status")?,
    }))
}

/// Read side of the archive: paginated search and lookups.
pub struct SearchDb {
    connection: Connection,
}

impl SearchDb {
    /// Opens an existing store; a missing database is an error.
    pub fn open(paths: &ResolvedPaths, config: &ArchiveConfig) -> Result<Self> {
        let settings = config.tokenizer_settings(&paths.project_root);
        let choice = resolve_tokenizer(&settings, &paths.lib_dir);
        Self::open_at(&paths.db_path, &choice)
    }

    pub fn open_at(db_path: &Path, choice: &TokenizerChoice) -> Result<Self> {
        let connection = open_existing(db_path, choice)?;
        Ok(Self { connection })
    }

    pub fn search(
        &self,
        query: &str,
        scope: SearchScope,
        mode: SearchMode,
        page: u32,
    ) -> Result<SearchResponse> {
        if query.trim().is_empty() {
            return Ok(SearchResponse::empty(page));
        }
        match scope {
            SearchScope::Links => self.search_links(query, mode, page),
            SearchScope::All => self.search_content(&[&POST_SOURCE, &REPLY_SOURCE], query, mode, page),
            SearchScope::Posts => self.search_content(&[&POST_SOURCE], query, mode, page),
            SearchScope::Replies => self.search_content(&[&REPLY_SOURCE], query, mode, page),
        }
    }

    fn search_content(
        &self,
        sources: &[&ContentSource],
        query: &str,
        mode: SearchMode,
        page: u32,
    ) -> Result<SearchResponse> {
        let pattern = match mode {
            SearchMode::Fts => build_fts_query(query),
            SearchMode::Like => build_like_pattern(query),
        };

        let mut total = 0usize;
        for source in sources {
            total += self.count(source.count_sql(mode), &pattern)?;
        }

        // posts and replies share one ordering, so a page can straddle both
        let union = sources
            .iter()
            .map(|source| source.select_sql(mode))
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        let sql = format!("{union} ORDER BY posted DESC, id DESC LIMIT ?2 OFFSET ?3");
        let (limit, offset) = page_bounds(page);
        let results = self.collect_hits(&sql, params![pattern, limit, offset], content_hit)?;

        Ok(SearchResponse {
            results,
            total,
            page,
            pages: page_count(total),
            error: None,
        })
    }

    fn search_links(&self, query: &str, mode: SearchMode, page: u32) -> Result<SearchResponse> {
        if !table_exists(&self.connection, "link_metadata")? {
            return Ok(SearchResponse::unavailable(page, LINK_TABLE_MISSING));
        }
        let (limit, offset) = page_bounds(page);

        let (results, total) = match mode {
            SearchMode::Fts => {
                if !table_exists(&self.connection, "link_metadata_fts")? {
                    return Ok(SearchResponse::unavailable(page, LINK_INDEX_MISSING));
                }
                let pattern = build_fts_query(query);
                let total = self.count(
                    "SELECT COUNT(*) FROM link_metadata_fts WHERE link_metadata_fts MATCH ?1",
                    &pattern,
                )?;
                let results = self.collect_hits(
                    "SELECT lm.url AS url, lm.og_title AS og_title, lm.og_description AS og_description,
                            lm.og_site_name AS og_site_name, lm.sources AS sources, lm.status AS status
                     FROM link_metadata lm
                     JOIN link_metadata_fts ON link_metadata_fts.rowid = lm.rowid
                     WHERE link_metadata_fts MATCH ?1
                     ORDER BY lm.rowid DESC
                     LIMIT ?2 OFFSET ?3",
                    params![pattern, limit, offset],
                    link_hit,
                )?;
                (results, total)
            }
            SearchMode::Like => {
                let pattern = build_like_pattern(query);
                let filter = "url LIKE ?1 ESCAPE '\\'
                    OR og_title LIKE ?1 ESCAPE '\\'
                    OR og_description LIKE ?1 ESCAPE '\\'
                    OR og_site_name LIKE ?1 ESCAPE '\\'";
                let total = self.count(
                    &format!("SELECT COUNT(*) FROM link_metadata WHERE {filter}"),
                    &pattern,
                )?;
                let results = self.collect_hits(
                    &format!(
                        "SELECT url, og_title, og_description, og_site_name, sources, status
                         FROM link_metadata WHERE {filter}
                         ORDER BY rowid DESC
                         LIMIT ?2 OFFSET ?3"
                    ),
                    params![pattern, limit, offset],
                    link_hit,
                )?;
                (results, total)
            }
        };

        Ok(SearchResponse {
            results,
            total,
            page,
            pages: page_count(total),
            error: None,
        })
    }

    fn count(&self, sql: &str, pattern: &str) -> Result<usize> {
        let count: i64 = self
            .connection
            .query_row(sql, [pattern], |row| row.get(0))
            .context("failed to count search matches")?;
        usize::try_from(count).context("match count does not fit into usize")
    }

    fn collect_hits<F>(&self, sql: &str, params: &[&dyn ToSql], map: F) -> Result<Vec<SearchHit>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<SearchHit>,
    {
        let mut statement = self
            .connection
            .prepare(sql)
            .context("failed to prepare search query")?;
        let rows = statement
            .query_map(params, map)
            .context("failed to run search query")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode search row")?);
        }
        Ok(out)
    }

    pub fn get_stats(&self) -> Result<ArchiveStats> {
        let post_count = count_rows(&self.connection, "posts")?;
        let reply_count = count_rows(&self.connection, "replies")?;
        let (link_count, link_with_preview) = if table_exists(&self.connection, "link_metadata")? {
            let with_preview: i64 = self
                .connection
                .query_row(
                    "SELECT COUNT(*) FROM link_metadata WHERE status = 'success'",
                    [],
                    |row| row.get(0),
                )
                .context("failed to count links with previews")?;
            (
                count_rows(&self.connection, "link_metadata")?,
                usize::try_from(with_preview).context("count does not fit into usize")?,
            )
        } else {
            (0, 0)
        };
        Ok(ArchiveStats {
            post_count,
            reply_count,
            link_count,
            link_with_preview,
        })
    }

    pub fn get_post(&self, id: i64) -> Result<Option<PostLocation>> {
        self.connection
            .query_row(
                "SELECT base_id, posted FROM posts WHERE id = ?1",
                [id],
                |row| {
                    Ok(PostLocation {
                        thread_id: row.get(0)?,
                        posted: row.get(1)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to look up post {id}"))
    }

    /// The owning post of a reply; `posted` is the post's timestamp, not the reply's.
    pub fn get_reply_owner(&self, id: i64) -> Result<Option<PostLocation>> {
        self.connection
            .query_row(
                "SELECT r.base_id, p.posted
                 FROM replies r
                 JOIN posts p ON r.base_id = p.base_id
                 WHERE r.id = ?1
                 LIMIT 1",
                [id],
                |row| {
                    Ok(PostLocation {
                        thread_id: row.get(0)?,
                        posted: row.get(1)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to look up owner of reply {id}"))
    }
}


#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::fixtures::seeded_db;
    use super::*;

    fn open(dir: &Path, posts: i64, with_links: bool) -> SearchDb {
        let db_path = seeded_db(dir, posts, with_links);
        SearchDb::open_at(&db_path, &TokenizerChoice::builtin()).expect("open")
    }

    #[test]
    fn query_builders_escape_input() {
        assert_eq!(build_fts_query("  hello  wor\"ld "), "\"hello\"* \"wor\"\"ld\"*");
        assert_eq!(build_fts_query("   "), "");
        assert_eq!(build_like_pattern(" 100%_a\\b "), "%100\\%\\_a\\\\b%");
    }

    #[test]
    fn scope_and_mode_parse() {
        assert_eq!("plurks".parse::<SearchScope>().expect("alias"), SearchScope::Posts);
        assert_eq!("replies".parse::<SearchScope>().expect("scope"), SearchScope::Replies);
        assert!("everything".parse::<SearchScope>().is_err());
        assert_eq!("like".parse::<SearchMode>().expect("mode"), SearchMode::Like);
        assert!("regex".parse::<SearchMode>().is_err());
    }

    #[test]
    fn all_scope_merges_by_posted_descending() {
        let temp = tempdir().expect("tempdir");
        let db = open(temp.path(), 3, false);
        let response = db
            .search("hello", SearchScope::All, SearchMode::Fts, 0)
            .expect("search");
        assert_eq!(response.total, 4);
        assert_eq!(response.pages, 1);
        // the reply is the newest
        assert!(matches!(response.results[0], SearchHit::Reply(_)));
        let posted = response
            .results
            .iter()
            .map(|hit| hit.posted().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        let mut sorted = posted.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(posted, sorted);
    }

    #[test]
    fn pagination_boundary() {
        let temp = tempdir().expect("tempdir");
        let db = open(temp.path(), 120, false);
        let first = db
            .search("number", SearchScope::Posts, SearchMode::Fts, 0)
            .expect("page 0");
        assert_eq!(first.total, 120);
        assert_eq!(first.pages, 3);
        assert_eq!(first.results.len(), 50);

        let last = db
            .search("number", SearchScope::Posts, SearchMode::Like, 2)
            .expect("page 2");
        assert_eq!(last.results.len(), 20);

        let past = db
            .search("number", SearchScope::Posts, SearchMode::Fts, 3)
            .expect("page 3");
        assert!(past.results.is_empty());
        assert_eq!(past.page, 3);
        assert_eq!(past.pages, 3);
        assert_eq!(past.total, 120);

        let far = db
            .search("number", SearchScope::Posts, SearchMode::Fts, u32::MAX)
            .expect("huge page");
        assert!(far.results.is_empty());
    }

    #[test]
    fn no_matches_still_report_one_page() {
        let temp = tempdir().expect("tempdir");
        let db = open(temp.path(), 2, false);
        let response = db
            .search("absent", SearchScope::Replies, SearchMode::Like, 0)
            .expect("search");
        assert_eq!(response.total, 0);
        assert_eq!(response.pages, 1);

        let blank = db
            .search("  ", SearchScope::All, SearchMode::Fts, 4)
            .expect("blank");
        assert_eq!(blank, SearchResponse::empty(4));
    }

    #[test]
    fn link_search_without_table_returns_error_payload() {
        let temp = tempdir().expect("tempdir");
        let db = open(temp.path(), 1, false);
        for mode in [SearchMode::Fts, SearchMode::Like] {
            let response = db.search("x", SearchScope::Links, mode, 2).expect("search");
            assert!(response.results.is_empty());
            assert_eq!(response.total, 0);
            assert_eq!(response.page, 2);
            assert_eq!(response.pages, 1);
            assert!(response.error.is_some());
        }
        let json = serde_json::to_value(db.search("x", SearchScope::Links, SearchMode::Fts, 0).expect("search"))
            .expect("json");
        assert!(json.get("error").is_some());
    }

    #[test]
    fn link_search_parses_sources_and_matches_urls() {
        let temp = tempdir().expect("tempdir");
        let db = open(temp.path(), 1, true);

        let fts = db
            .search("headline", SearchScope::Links, SearchMode::Fts, 0)
            .expect("fts");
        assert_eq!(fts.total, 1);
        let SearchHit::Link(hit) = &fts.results[0] else {
            panic!("expected link hit");
        };
        assert_eq!(hit.sources.reply_ids, vec![789]);
        assert_eq!(hit.status.as_deref(), Some("success"));

        // literal % and _ in the URL
        let like = db
            .search("100%_off", SearchScope::Links, SearchMode::Like, 0)
            .expect("like");
        assert_eq!(like.total, 1);
        let json = serde_json::to_value(&like.results[0]).expect("json");
        assert_eq!(json["type"], "link");
        assert_eq!(json["sources"]["post_ids"][0], 1);

        let newest_first = db
            .search("example", SearchScope::Links, SearchMode::Like, 0)
            .expect("like");
        let urls = newest_first
            .results
            .iter()
            .filter_map(|hit| match hit {
                SearchHit::Link(link) => Some(link.url.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(urls, vec!["https://news.example/story", "https://example.com/100%_off"]);
    }

    #[test]
    fn stats_and_lookups() {
        let temp = tempdir().expect("tempdir");
        let db = open(temp.path(), 2, true);
        assert_eq!(
            db.get_stats().expect("stats"),
            ArchiveStats {
                post_count: 2,
                reply_count: 1,
                link_count: 2,
                link_with_preview: 1,
            }
        );
        let post = db.get_post(2).expect("post").expect("exists");
        assert_eq!(post.thread_id.as_deref(), Some("t2"));
        assert!(db.get_post(404).expect("missing").is_none());

        let owner = db.get_reply_owner(789).expect("owner").expect("exists");
        assert_eq!(owner.thread_id.as_deref(), Some("t1"));
        assert_eq!(owner.posted, db.get_post(1).expect("post").and_then(|p| p.posted));
        assert!(db.get_reply_owner(1).expect("missing").is_none());
    }

    #[test]
    fn open_fails_for_missing_database() {
        let temp = tempdir().expect("tempdir");
        assert!(SearchDb::open_at(&temp.path().join("nope.db"), &TokenizerChoice::builtin()).is_err());
    }
}
