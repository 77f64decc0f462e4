use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;

use crate::archive::{BackupLayout, PostRecord, ReplyRecord, parse_post_file, parse_reply_file};
use crate::config::ScanPolicy;
use crate::fts::{MutatingStore, POSTS, REPLIES};
use crate::scan::{ScanRange, latest_imported_date, plan_range};
use crate::store::ArchiveStore;

const POST_COLUMNS: &[&str] = &[
    "id",
    "base_id",
    "content_raw",
    "posted",
    "response_count",
    "qualifier",
];

const REPLY_COLUMNS: &[&str] = &[
    "id",
    "base_id",
    "content_raw",
    "posted",
    "user_id",
    "user_nick",
    "user_display",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportCounts {
    pub new: usize,
    pub skipped: usize,
}

impl ImportCounts {
    fn absorb(&mut self, other: ImportCounts) {
        self.new += other.new;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub range: ScanRange,
    pub post_files: usize,
    pub reply_files: usize,
    pub posts: ImportCounts,
    pub replies: ImportCounts,
    pub failures: Vec<FileFailure>,
    pub total_posts: usize,
    pub total_replies: usize,
}

/// Inserts each post unless its id is already stored.
pub fn import_posts(store: &MutatingStore<'_>, records: &[PostRecord]) -> Result<ImportCounts> {
    let mut counts = ImportCounts::default();
    for record in records {
        let inserted = store
            .insert_if_absent(
                &POSTS,
                POST_COLUMNS,
                &[
                    &record.id,
                    &record.base_id,
                    &record.content_raw,
                    &record.posted,
                    &record.response_count,
                    &record.qualifier,
                ],
            )
            .with_context(|| format!("failed to import post {}", record.id))?;
        if inserted {
            counts.new += 1;
        } else {
            counts.skipped += 1;
        }
    }
    Ok(counts)
}

/// Inserts each reply of `thread_id` unless its id is already stored.
pub fn import_replies(
    store: &MutatingStore<'_>,
    thread_id: &str,
    records: &[ReplyRecord],
) -> Result<ImportCounts> {
    let mut counts = ImportCounts::default();
    for record in records {
        let author = record.user.clone().unwrap_or_default();
        let inserted = store
            .insert_if_absent(
                &REPLIES,
                REPLY_COLUMNS,
                &[
                    &record.id,
                    &thread_id,
                    &record.content_raw,
                    &record.posted,
                    &author.id,
                    &author.nick_name,
                    &author.display_name,
                ],
            )
            .with_context(|| format!("failed to import reply {}", record.id))?;
        if inserted {
            counts.new += 1;
        } else {
            counts.skipped += 1;
        }
    }
    Ok(counts)
}

/// One incremental import pass over `layout`.
///
/// Every file commits in its own transaction. A file that cannot be read or
/// parsed is recorded in the report and skipped without undoing earlier files.
pub fn run_import(
    store: &mut ArchiveStore,
    layout: &BackupLayout,
    today: NaiveDate,
    policy: &ScanPolicy,
) -> Result<ImportReport> {
    layout.validate()?;
    let latest = latest_imported_date(store.connection())?;
    let range = plan_range(latest, today, policy);
    log::info!("scan range: {}", range.describe());

    let post_files = layout.list_post_files(&range)?;
    let mut failures = Vec::new();
    let mut posts = ImportCounts::default();
    let mut thread_ids = HashSet::new();

    for path in &post_files {
        let fragment = match parse_post_file(path) {
            Ok(fragment) => fragment,
            Err(error) => {
                record_failure(&mut failures, path, &error);
                continue;
            }
        };
        let counts = import_in_transaction(store, path, |mutating| {
            import_posts(mutating, &fragment.records)
        })?;
        log::debug!(
            "{}: {} new, {} skipped",
            path.display(),
            counts.new,
            counts.skipped
        );
        posts.absorb(counts);
        thread_ids.extend(
            fragment
                .records
                .iter()
                .filter_map(|record| record.base_id.clone())
                .filter(|id| !id.is_empty()),
        );
    }

    let reply_files = layout.list_reply_files(&thread_ids)?;
    let mut replies = ImportCounts::default();
    for path in &reply_files {
        let fragment = match parse_reply_file(path) {
            Ok(fragment) => fragment,
            Err(error) => {
                record_failure(&mut failures, path, &error);
                continue;
            }
        };
        let counts = import_in_transaction(store, path, |mutating| {
            import_replies(mutating, &fragment.label, &fragment.records)
        })?;
        replies.absorb(counts);
    }

    let report = ImportReport {
        range,
        post_files: post_files.len(),
        reply_files: reply_files.len(),
        posts,
        replies,
        failures,
        total_posts: store.post_count()?,
        total_replies: store.reply_count()?,
    };
    log::info!(
        "imported {} new posts ({} skipped) and {} new replies ({} skipped)",
        report.posts.new,
        report.posts.skipped,
        report.replies.new,
        report.replies.skipped
    );
    Ok(report)
}

fn import_in_transaction<F>(store: &mut ArchiveStore, path: &Path, apply: F) -> Result<ImportCounts>
where
    F: FnOnce(&MutatingStore<'_>) -> Result<ImportCounts>,
{
    let transaction = store
        .connection_mut()
        .transaction()
        .with_context(|| format!("failed to start import of {}", path.display()))?;
    let counts = apply(&MutatingStore::new(&transaction))?;
    transaction
        .commit()
        .with_context(|| format!("failed to commit import of {}", path.display()))?;
    Ok(counts)
}

fn record_failure(failures: &mut Vec<FileFailure>, path: &Path, error: &anyhow::Error) {
    log::warn!("skipping {}: {error:#}", path.display());
    failures.push(FileFailure {
        path: path.to_path_buf(),
        message: format!("{error:#}"),
    });
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::archive::fixtures::{backup_skeleton, write_posts, write_replies};
    use crate::store::TokenizerChoice;

    fn open_store(dir: &Path) -> ArchiveStore {
        ArchiveStore::open_at(&dir.join("data/plurks.db"), &TokenizerChoice::builtin())
            .expect("open store")
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 2).expect("date")
    }

    fn fts_hits(store: &ArchiveStore, index: &str, term: &str) -> i64 {
        store
            .connection()
            .query_row(
                &format!("SELECT COUNT(*) FROM {index} WHERE {index} MATCH ?1"),
                [term],
                |row| row.get(0),
            )
            .expect("fts count")
    }

    #[test]
    fn import_is_idempotent() {
        let temp = tempdir().expect("tempdir");
        let backup = temp.path().join("backup");
        backup_skeleton(&backup);
        write_posts(
            &backup,
            "2026_01",
            r#"[{"id": 1, "base_id": "abc", "content_raw": "hello archive", "posted": "Thu, 01 Jan 2026 10:00:00 GMT"},
                {"id": 2, "base_id": "def", "content_raw": "second post", "posted": "Fri, 02 Jan 2026 10:00:00 GMT"}]"#,
        );
        write_replies(
            &backup,
            "abc",
            r#"[{"id": 789, "content_raw": "nice archive", "posted": "Thu, 01 Jan 2026 11:00:00 GMT", "user": {"id": 9, "nick_name": "n"}}]"#,
        );
        let layout = BackupLayout::new(&backup);
        let mut store = open_store(temp.path());

        let first = run_import(&mut store, &layout, today(), &ScanPolicy::default()).expect("first");
        assert!(first.range.is_unbounded());
        assert_eq!(first.posts, ImportCounts { new: 2, skipped: 0 });
        assert_eq!(first.replies, ImportCounts { new: 1, skipped: 0 });
        assert!(first.failures.is_empty());

        let second =
            run_import(&mut store, &layout, today(), &ScanPolicy::default()).expect("second");
        assert_eq!(second.range, ScanRange {
            start: Some("2025-08".to_string()),
            end: Some("2026-02".to_string()),
        });
        assert_eq!(second.posts, ImportCounts { new: 0, skipped: 2 });
        assert_eq!(second.replies, ImportCounts { new: 0, skipped: 1 });
        assert_eq!(second.total_posts, 2);
        assert_eq!(second.total_replies, 1);
        assert_eq!(fts_hits(&store, "posts_fts", "archive"), 1);
        assert_eq!(fts_hits(&store, "replies_fts", "archive"), 1);

        let owner: String = store
            .connection()
            .query_row("SELECT base_id FROM replies WHERE id = 789", [], |row| {
                row.get(0)
            })
            .expect("reply owner");
        assert_eq!(owner, "abc");
    }

    #[test]
    fn existing_rows_are_never_overwritten() {
        let temp = tempdir().expect("tempdir");
        let backup = temp.path().join("backup");
        backup_skeleton(&backup);
        write_posts(
            &backup,
            "2026_01",
            r#"[{"id": 1, "content_raw": "original text", "posted": "2026-01-01"}]"#,
        );
        let layout = BackupLayout::new(&backup);
        let mut store = open_store(temp.path());
        run_import(&mut store, &layout, today(), &ScanPolicy::default()).expect("first");

        write_posts(
            &backup,
            "2026_01",
            r#"[{"id": 1, "content_raw": "edited text", "posted": "2026-01-01"}]"#,
        );
        let report = run_import(&mut store, &layout, today(), &ScanPolicy::default()).expect("second");
        assert_eq!(report.posts.skipped, 1);
        let content: String = store
            .connection()
            .query_row("SELECT content_raw FROM posts WHERE id = 1", [], |row| {
                row.get(0)
            })
            .expect("content");
        assert_eq!(content, "original text");
        assert_eq!(fts_hits(&store, "posts_fts", "edited"), 0);
    }

    #[test]
    fn malformed_file_is_skipped_and_earlier_files_stay_committed() {
        let temp = tempdir().expect("tempdir");
        let backup = temp.path().join("backup");
        backup_skeleton(&backup);
        write_posts(&backup, "2025_01", r#"[{"id": 1, "content_raw": "kept"}]"#);
        std::fs::write(
            backup.join("data/plurks/2025_02.js"),
            "BackupData.plurks[\"2025_02\"]=[{\"id\": ",
        )
        .expect("write broken");
        write_posts(&backup, "2025_03", r#"[{"id": 3, "content_raw": "also kept"}]"#);
        let layout = BackupLayout::new(&backup);
        let mut store = open_store(temp.path());

        let report = run_import(&mut store, &layout, today(), &ScanPolicy::default()).expect("import");
        assert_eq!(report.post_files, 3);
        assert_eq!(report.posts.new, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].path.ends_with("2025_02.js"));
        assert!(report.failures[0].message.contains("malformed post file"));
        assert_eq!(store.post_count().expect("count"), 2);
    }

    #[test]
    fn replies_only_come_from_in_range_threads() {
        let temp = tempdir().expect("tempdir");
        let backup = temp.path().join("backup");
        backup_skeleton(&backup);
        write_posts(
            &backup,
            "2026_01",
            r#"[{"id": 1, "base_id": "recent", "content_raw": "new", "posted": "2026-01-05"}]"#,
        );
        write_posts(
            &backup,
            "2020_01",
            r#"[{"id": 2, "base_id": "old", "content_raw": "old", "posted": "2020-01-05"}]"#,
        );
        write_replies(&backup, "recent", r#"[{"id": 10, "content_raw": "r1"}]"#);
        write_replies(&backup, "old", r#"[{"id": 20, "content_raw": "r2"}]"#);
        write_replies(&backup, "orphan", r#"[{"id": 30, "content_raw": "r3"}]"#);
        let layout = BackupLayout::new(&backup);
        let mut store = open_store(temp.path());

        // seed the store so the planner picks a bounded range
        let transaction = store.connection_mut().transaction().expect("tx");
        import_posts(
            &MutatingStore::new(&transaction),
            &[PostRecord {
                id: 99,
                base_id: Some("seed".to_string()),
                content_raw: None,
                posted: Some("2026-01-01".to_string()),
                response_count: None,
                qualifier: None,
            }],
        )
        .expect("seed");
        transaction.commit().expect("commit");

        let report = run_import(&mut store, &layout, today(), &ScanPolicy::default()).expect("import");
        assert_eq!(report.post_files, 1);
        assert_eq!(report.reply_files, 1);
        assert_eq!(report.replies.new, 1);
        let ids: Vec<i64> = store
            .connection()
            .prepare("SELECT id FROM replies ORDER BY id")
            .expect("prepare")
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<rusqlite::Result<_>>()
            .expect("rows");
        assert_eq!(ids, vec![10]);
    }

    #[test]
    fn invalid_backup_fails_before_touching_store() {
        let temp = tempdir().expect("tempdir");
        let mut store = open_store(temp.path());
        let layout = BackupLayout::new(temp.path().join("nope"));
        let error = run_import(&mut store, &layout, today(), &ScanPolicy::default())
            .expect_err("invalid backup");
        assert!(error.to_string().contains("not a backup directory"));
    }
}
