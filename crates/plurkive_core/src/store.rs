use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, LoadExtensionGuard, OpenFlags, OptionalExtension, params};

use crate::config::{ArchiveConfig, TokenizerSettings};
use crate::fts;
use crate::migrate::run_migrations;
use crate::runtime::ResolvedPaths;

pub const DEFAULT_TOKENIZER: &str = "unicode61";
pub const META_FTS_TOKENIZER: &str = "fts_tokenizer";

#[cfg(target_os = "windows")]
pub const TOKENIZER_LIBRARY: &str = "fts5_icu.dll";
#[cfg(target_os = "macos")]
pub const TOKENIZER_LIBRARY: &str = "libfts5_icu.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const TOKENIZER_LIBRARY: &str = "libfts5_icu.so";

/// Which FTS5 tokenizer to build indexes with, and the extension that provides it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerChoice {
    pub tokenizer: String,
    pub extension: Option<PathBuf>,
}

impl TokenizerChoice {
    pub fn builtin() -> Self {
        Self {
            tokenizer: DEFAULT_TOKENIZER.to_string(),
            extension: None,
        }
    }
}

/// Configured extension path if it exists, then `<lib_dir>/<platform library>`,
/// then the built-in `unicode61` tokenizer.
pub fn resolve_tokenizer(settings: &TokenizerSettings, lib_dir: &Path) -> TokenizerChoice {
    if let Some(path) = settings.extension_path.as_deref() {
        if path.is_file() {
            return TokenizerChoice {
                tokenizer: settings.extension_tokenizer.clone(),
                extension: Some(path.to_path_buf()),
            };
        }
        log::warn!(
            "tokenizer extension {} does not exist; trying {}",
            path.display(),
            lib_dir.display()
        );
    }
    let bundled = lib_dir.join(TOKENIZER_LIBRARY);
    if bundled.is_file() {
        return TokenizerChoice {
            tokenizer: settings.extension_tokenizer.clone(),
            extension: Some(bundled),
        };
    }
    TokenizerChoice::builtin()
}

/// Loads the extension named by `choice` into `connection` and returns the
/// tokenizer that is actually usable. A failed load degrades to `unicode61`.
pub fn activate_tokenizer(connection: &Connection, choice: &TokenizerChoice) -> String {
    let Some(extension) = choice.extension.as_deref() else {
        return choice.tokenizer.clone();
    };
    match load_extension(connection, extension) {
        Ok(()) => {
            log::debug!("loaded tokenizer extension {}", extension.display());
            choice.tokenizer.clone()
        }
        Err(error) => {
            log::warn!(
                "failed to load tokenizer extension {}: {error:#}; using {DEFAULT_TOKENIZER}",
                extension.display()
            );
            DEFAULT_TOKENIZER.to_string()
        }
    }
}

fn load_extension(connection: &Connection, path: &Path) -> Result<()> {
    // SAFETY: the guard disables extension loading again when dropped, and the
    // library path comes from local configuration only.
    unsafe {
        let _guard = LoadExtensionGuard::new(connection)
            .context("failed to enable extension loading")?;
        connection
            .load_extension(path, None::<&str>)
            .with_context(|| format!("failed to load {}", path.display()))?;
    }
    Ok(())
}

/// Writable handle on the archive database with its schema and indexes in place.
pub struct ArchiveStore {
    connection: Connection,
    tokenizer: String,
}

impl ArchiveStore {
    pub fn open(paths: &ResolvedPaths, config: &ArchiveConfig) -> Result<Self> {
        let settings = config.tokenizer_settings(&paths.project_root);
        let choice = resolve_tokenizer(&settings, &paths.lib_dir);
        Self::open_at(&paths.db_path, &choice)
    }

    /// Opens (creating if needed) the database at `db_path`, applies migrations
    /// and creates any missing post and reply indexes with the active tokenizer.
    pub fn open_at(db_path: &Path, choice: &TokenizerChoice) -> Result<Self> {
        ensure_db_parent(db_path)?;
        let connection = open_connection(db_path)?;
        let tokenizer = activate_tokenizer(&connection, choice);
        run_migrations(&connection)?;
        fts::ensure_content_indexes(&connection, &tokenizer)?;

        match get_meta(&connection, META_FTS_TOKENIZER)? {
            Some(built_with) if built_with != tokenizer => {
                log::warn!(
                    "indexes were built with tokenizer '{built_with}' but '{tokenizer}' is active; run `plurkive reindex`"
                );
            }
            Some(_) => {}
            None => set_meta(&connection, META_FTS_TOKENIZER, &tokenizer)?,
        }

        Ok(Self {
            connection,
            tokenizer,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Tokenizer new indexes are created with on this connection.
    pub fn tokenizer(&self) -> &str {
        &self.tokenizer
    }

    pub fn post_count(&self) -> Result<usize> {
        count_rows(&self.connection, "posts")
    }

    pub fn reply_count(&self) -> Result<usize> {
        count_rows(&self.connection, "replies")
    }
}

/// Opens an existing database without creating or migrating it, loading the
/// tokenizer extension so extension-built indexes stay queryable.
pub fn open_existing(db_path: &Path, choice: &TokenizerChoice) -> Result<Connection> {
    if !db_path.exists() {
        bail!(
            "database not found at {}; run `plurkive import` first",
            db_path.display()
        );
    }
    let connection = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    activate_tokenizer(&connection, choice);
    Ok(connection)
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn ensure_db_parent(db_path: &Path) -> Result<()> {
    let parent = db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

pub fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

pub fn count_rows(connection: &Connection, table_name: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(&format!("SELECT COUNT(*) FROM {table_name}"), [], |row| {
            row.get(0)
        })
        .with_context(|| format!("failed to count rows in {table_name}"))?;
    usize::try_from(count).context("count does not fit into usize")
}

pub fn get_meta(connection: &Connection, key: &str) -> Result<Option<String>> {
    if !table_exists(connection, "store_meta")? {
        return Ok(None);
    }
    connection
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1 LIMIT 1",
            [key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to read store meta key {key}"))
}

pub fn set_meta(connection: &Connection, key: &str, value: &str) -> Result<()> {
    connection
        .execute(
            "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .with_context(|| format!("failed to set store meta key {key}"))?;
    Ok(())
}
