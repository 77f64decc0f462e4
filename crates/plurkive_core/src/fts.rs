use anyhow::{Context, Result};
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, Transaction};

use crate::store::{META_FTS_TOKENIZER, count_rows, set_meta, table_exists};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtsBinding {
    pub table: &'static str,
    pub index: &'static str,
    pub rowid_column: &'static str,
    pub key_column: &'static str,
    pub columns: &'static [&'static str],
}

pub const POSTS: FtsBinding = FtsBinding {
    table: "posts",
    index: "posts_fts",
    rowid_column: "id",
    key_column: "id",
    columns: &["content_raw"],
};

pub const REPLIES: FtsBinding = FtsBinding {
    table: "replies",
    index: "replies_fts",
    rowid_column: "id",
    key_column: "id",
    columns: &["content_raw"],
};

pub const LINKS: FtsBinding = FtsBinding {
    table: "link_metadata",
    index: "link_metadata_fts",
    rowid_column: "rowid",
    key_column: "url",
    columns: &["og_title", "og_description", "og_site_name"],
};

pub const ALL_BINDINGS: &[FtsBinding] = &[POSTS, REPLIES, LINKS];

impl FtsBinding {
    fn column_list(&self) -> String {
        self.columns.join(", ")
    }

    pub fn create_sql(&self, tokenizer: &str) -> String {
        format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {index} USING fts5(
                {columns},
                content='{table}',
                content_rowid='{rowid}',
                tokenize='{tokenizer}'
            )",
            index = self.index,
            columns = self.column_list(),
            table = self.table,
            rowid = self.rowid_column,
            tokenizer = tokenizer.replace('\'', "''"),
        )
    }

    fn index_row_sql(&self) -> String {
        let columns = self.column_list();
        format!(
            "INSERT INTO {index}(rowid, {columns})
             SELECT {rowid}, {columns} FROM {table} WHERE {rowid} = ?1",
            index = self.index,
            rowid = self.rowid_column,
            table = self.table,
        )
    }

    fn retract_row_sql(&self) -> String {
        let columns = self.column_list();
        format!(
            "INSERT INTO {index}({index}, rowid, {columns})
             SELECT 'delete', {rowid}, {columns} FROM {table} WHERE {rowid} = ?1",
            index = self.index,
            rowid = self.rowid_column,
            table = self.table,
        )
    }

    fn legacy_triggers(&self) -> [String; 3] {
        [
            format!("{}_ai", self.table),
            format!("{}_ad", self.table),
            format!("{}_au", self.table),
        ]
    }
}

pub fn ensure_content_indexes(connection: &Connection, tokenizer: &str) -> Result<()> {
    for binding in [POSTS, REPLIES] {
        ensure_index(connection, &binding, tokenizer)?;
    }
    Ok(())
}

pub fn ensure_index(connection: &Connection, binding: &FtsBinding, tokenizer: &str) -> Result<()> {
    connection
        .execute_batch(&binding.create_sql(tokenizer))
        .with_context(|| format!("failed to create {}", binding.index))
}

/// Content-table writes that also write the matching FTS index rows.
pub struct MutatingStore<'a> {
    connection: &'a Connection,
}

impl<'a> MutatingStore<'a> {
    pub fn new(transaction: &'a Transaction<'_>) -> Self {
        Self {
            connection: transaction,
        }
    }

    pub fn connection(&self) -> &Connection {
        self.connection
    }

    pub fn insert_if_absent(
        &self,
        binding: &FtsBinding,
        columns: &[&str],
        values: &[&dyn ToSql],
    ) -> Result<bool> {
        let placeholders = (1..=values.len())
            .map(|n| format!("?{n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({placeholders})",
            binding.table,
            columns.join(", ")
        );
        let changed = self
            .connection
            .execute(&sql, values)
            .with_context(|| format!("failed to insert into {}", binding.table))?;
        if changed == 0 {
            return Ok(false);
        }
        let rowid = self.connection.last_insert_rowid();
        self.index_row(binding, rowid)?;
        Ok(true)
    }

    /// Updates the row with `key`: the old index entry is retracted before the
    /// write and the new one added after it. Returns `false` when no row matched.
    pub fn update(
        &self,
        binding: &FtsBinding,
        key: &dyn ToSql,
        assignments: &[(&str, &dyn ToSql)],
    ) -> Result<bool> {
        let Some(rowid) = self.find_rowid(binding, key)? else {
            return Ok(false);
        };
        if assignments.is_empty() {
            return Ok(true);
        }
        self.retract_row(binding, rowid)?;

        let set_clause = assignments
            .iter()
            .enumerate()
            .map(|(idx, (column, _))| format!("{column} = ?{}", idx + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {set_clause} WHERE {} = ?{}",
            binding.table,
            binding.rowid_column,
            assignments.len() + 1
        );
        let mut values: Vec<&dyn ToSql> = assignments.iter().map(|(_, value)| *value).collect();
        values.push(&rowid);
        self.connection
            .execute(&sql, values.as_slice())
            .with_context(|| format!("failed to update {}", binding.table))?;

        self.index_row(binding, rowid)?;
        Ok(true)
    }

    pub fn delete(&self, binding: &FtsBinding, key: &dyn ToSql) -> Result<bool> {
        let Some(rowid) = self.find_rowid(binding, key)? else {
            return Ok(false);
        };
        self.retract_row(binding, rowid)?;
        self.connection
            .execute(
                &format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    binding.table, binding.rowid_column
                ),
                [rowid],
            )
            .with_context(|| format!("failed to delete from {}", binding.table))?;
        Ok(true)
    }

    pub fn find_rowid(&self, binding: &FtsBinding, key: &dyn ToSql) -> Result<Option<i64>> {
        self.connection
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE {} = ?1",
                    binding.rowid_column, binding.table, binding.key_column
                ),
                [key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up row in {}", binding.table))
    }

    fn index_row(&self, binding: &FtsBinding, rowid: i64) -> Result<()> {
        self.connection
            .execute(&binding.index_row_sql(), [rowid])
            .with_context(|| format!("failed to index row {rowid} in {}", binding.index))?;
        Ok(())
    }

    fn retract_row(&self, binding: &FtsBinding, rowid: i64) -> Result<()> {
        self.connection
            .execute(&binding.retract_row_sql(), [rowid])
            .with_context(|| format!("failed to retract row {rowid} from {}", binding.index))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RebuiltIndex {
    pub index: &'static str,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct RebuildReport {
    pub tokenizer: String,
    pub rebuilt: Vec<RebuiltIndex>,
}

/// Drops and repopulates every index, one transaction per content table.
pub fn rebuild_indexes(connection: &mut Connection, tokenizer: &str) -> Result<RebuildReport> {
    let mut rebuilt = Vec::new();
    for binding in ALL_BINDINGS {
        if !table_exists(connection, binding.table)? {
            log::debug!("skipping {}: {} does not exist", binding.index, binding.table);
            continue;
        }
        let rows = rebuild_index(connection, binding, tokenizer)?;
        log::info!("rebuilt {} ({rows} rows, tokenizer '{tokenizer}')", binding.index);
        rebuilt.push(RebuiltIndex {
            index: binding.index,
            rows,
        });
    }
    set_meta(connection, META_FTS_TOKENIZER, tokenizer)?;
    Ok(RebuildReport {
        tokenizer: tokenizer.to_string(),
        rebuilt,
    })
}

fn rebuild_index(connection: &mut Connection, binding: &FtsBinding, tokenizer: &str) -> Result<usize> {
    let transaction = connection
        .transaction()
        .with_context(|| format!("failed to start rebuild of {}", binding.index))?;
    for trigger in binding.legacy_triggers() {
        transaction
            .execute_batch(&format!("DROP TRIGGER IF EXISTS {trigger}"))
            .with_context(|| format!("failed to drop trigger {trigger}"))?;
    }
    transaction
        .execute_batch(&format!("DROP TABLE IF EXISTS {}", binding.index))
        .with_context(|| format!("failed to drop {}", binding.index))?;
    ensure_index(&transaction, binding, tokenizer)?;
    transaction
        .execute_batch(&format!(
            "INSERT INTO {index}({index}) VALUES('rebuild')",
            index = binding.index
        ))
        .with_context(|| format!("failed to repopulate {}", binding.index))?;
    let rows = indexed_row_count(&transaction, binding)?;
    transaction
        .commit()
        .with_context(|| format!("failed to commit rebuild of {}", binding.index))?;
    Ok(rows)
}

pub fn indexed_row_count(connection: &Connection, binding: &FtsBinding) -> Result<usize> {
    count_rows(connection, &format!("{}_docsize", binding.index))
}

#[cfg(test)]
mod tests {
    use rusqlite::params;

    use super::*;
    use crate::links::{LinkSources, ensure_link_tables, upsert_link};
    use crate::migrate::run_migrations;

    fn connection() -> Connection {
        let connection = Connection::open_in_memory().expect("open");
        run_migrations(&connection).expect("migrate");
        ensure_content_indexes(&connection, "unicode61").expect("indexes");
        connection
    }

    fn insert_post(store: &MutatingStore<'_>, id: i64, content: &str) -> bool {
        store
            .insert_if_absent(
                &POSTS,
                &["id", "base_id", "content_raw"],
                &[&id, &"abc", &content],
            )
            .expect("insert post")
    }

    fn match_ids(connection: &Connection, index: &str, query: &str) -> Vec<i64> {
        let mut statement = connection
            .prepare(&format!(
                "SELECT rowid FROM {index} WHERE {index} MATCH ?1 ORDER BY rowid"
            ))
            .expect("prepare");
        statement
            .query_map([query], |row| row.get(0))
            .expect("query")
            .collect::<rusqlite::Result<Vec<i64>>>()
            .expect("rows")
    }

    #[test]
    fn insert_if_absent_indexes_once() {
        let mut connection = connection();
        let tx = connection.transaction().expect("tx");
        let store = MutatingStore::new(&tx);
        assert!(insert_post(&store, 1, "hello world"));
        assert!(!insert_post(&store, 1, "something else"));
        tx.commit().expect("commit");

        assert_eq!(match_ids(&connection, "posts_fts", "hello"), vec![1]);
        assert!(match_ids(&connection, "posts_fts", "something").is_empty());
        assert_eq!(indexed_row_count(&connection, &POSTS).expect("count"), 1);
    }

    #[test]
    fn update_retracts_old_tokens() {
        let mut connection = connection();
        let tx = connection.transaction().expect("tx");
        let store = MutatingStore::new(&tx);
        insert_post(&store, 7, "alpha bravo");
        let updated = store
            .update(&POSTS, &7_i64, &[("content_raw", &"charlie delta")])
            .expect("update");
        assert!(updated);
        assert!(
            !store
                .update(&POSTS, &99_i64, &[("content_raw", &"x")])
                .expect("update missing")
        );
        tx.commit().expect("commit");

        assert!(match_ids(&connection, "posts_fts", "alpha").is_empty());
        assert_eq!(match_ids(&connection, "posts_fts", "charlie"), vec![7]);
        assert_eq!(indexed_row_count(&connection, &POSTS).expect("count"), 1);
    }

    #[test]
    fn delete_removes_index_entry() {
        let mut connection = connection();
        let tx = connection.transaction().expect("tx");
        let store = MutatingStore::new(&tx);
        insert_post(&store, 3, "ephemeral note");
        assert!(store.delete(&POSTS, &3_i64).expect("delete"));
        assert!(!store.delete(&POSTS, &3_i64).expect("delete again"));
        tx.commit().expect("commit");

        assert!(match_ids(&connection, "posts_fts", "ephemeral").is_empty());
        assert_eq!(indexed_row_count(&connection, &POSTS).expect("count"), 0);
    }

    #[test]
    fn rolled_back_transaction_leaves_no_index_entry() {
        let mut connection = connection();
        {
            let tx = connection.transaction().expect("tx");
            let store = MutatingStore::new(&tx);
            insert_post(&store, 5, "never committed");
        }
        assert_eq!(count_rows(&connection, "posts").expect("count"), 0);
        assert!(match_ids(&connection, "posts_fts", "committed").is_empty());
    }

    #[test]
    fn rebuild_preserves_search_results_and_counts() {
        let mut connection = connection();
        let tx = connection.transaction().expect("tx");
        let store = MutatingStore::new(&tx);
        insert_post(&store, 1, "hello world");
        insert_post(&store, 2, "goodbye world");
        store
            .insert_if_absent(
                &REPLIES,
                &["id", "base_id", "content_raw"],
                &[&10_i64, &"abc", &"world replies"],
            )
            .expect("insert reply");
        tx.commit().expect("commit");

        // an older store kept its index in sync with triggers
        connection
            .execute_batch(
                "CREATE TRIGGER posts_ai AFTER INSERT ON posts BEGIN
                    INSERT INTO posts_fts(rowid, content_raw) VALUES (new.id, new.content_raw);
                 END;",
            )
            .expect("legacy trigger");

        let before = match_ids(&connection, "posts_fts", "world");
        let report = rebuild_indexes(&mut connection, "unicode61").expect("rebuild");
        assert_eq!(report.rebuilt.len(), 2);
        assert_eq!(report.rebuilt[0].rows, 2);
        assert_eq!(report.rebuilt[1].rows, 1);

        assert_eq!(match_ids(&connection, "posts_fts", "world"), before);
        assert_eq!(match_ids(&connection, "replies_fts", "world"), vec![10]);
        assert_eq!(count_rows(&connection, "posts").expect("posts"), 2);
        let triggers: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger'",
                [],
                |row| row.get(0),
            )
            .expect("triggers");
        assert_eq!(triggers, 0);

        // idempotent
        let again = rebuild_indexes(&mut connection, "unicode61").expect("rebuild again");
        assert_eq!(again.rebuilt[0].rows, 2);
        assert_eq!(indexed_row_count(&connection, &POSTS).expect("count"), 2);
        let built_with: String = connection
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                params![META_FTS_TOKENIZER],
                |row| row.get(0),
            )
            .expect("meta");
        assert_eq!(built_with, "unicode61");
    }

    #[test]
    fn rebuild_keeps_link_titles_searchable() {
        let mut connection = connection();
        ensure_link_tables(&connection, "unicode61").expect("link tables");
        let tx = connection.transaction().expect("tx");
        let store = MutatingStore::new(&tx);
        upsert_link(&store, "https://news.example/a", &LinkSources::from_post(1)).expect("upsert a");
        upsert_link(&store, "https://news.example/b", &LinkSources::from_post(2)).expect("upsert b");
        store
            .update(
                &LINKS,
                &"https://news.example/a",
                &[("og_title", &"Harbour headline"), ("status", &"success")],
            )
            .expect("title");
        tx.commit().expect("commit");

        let before = match_ids(&connection, "link_metadata_fts", "harbour");
        assert_eq!(before.len(), 1);

        let report = rebuild_indexes(&mut connection, "unicode61").expect("rebuild");
        let links = report
            .rebuilt
            .iter()
            .find(|rebuilt| rebuilt.index == "link_metadata_fts")
            .expect("link index rebuilt");
        assert_eq!(links.rows, 2);
        assert_eq!(match_ids(&connection, "link_metadata_fts", "harbour"), before);
        assert_eq!(indexed_row_count(&connection, &LINKS).expect("count"), 2);
    }

    #[test]
    fn create_sql_escapes_tokenizer_quotes() {
        let sql = LINKS.create_sql("porter 'x'");
        assert!(sql.contains("tokenize='porter ''x'''"));
        assert!(sql.contains("content_rowid='rowid'"));
    }
}
