use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; plurkive/0.1)";
pub const DEFAULT_EXTENSION_TOKENIZER: &str = "icu zh";
pub const DEFAULT_RESCAN_WINDOW_MONTHS: u32 = 6;
pub const DEFAULT_RESUME_GAP_MONTHS: u32 = 6;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub archive: ArchiveSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub import: ImportSection,
    #[serde(default)]
    pub links: LinksSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ArchiveSection {
    pub backup_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SearchSection {
    pub tokenizer_extension: Option<String>,
    pub extension_tokenizer: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ImportSection {
    pub rescan_window_months: Option<u32>,
    pub resume_gap_months: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LinksSection {
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub user_agent: Option<String>,
}

/// Thresholds consumed by the scan planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanPolicy {
    pub rescan_window_months: u32,
    pub resume_gap_months: u32,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            rescan_window_months: DEFAULT_RESCAN_WINDOW_MONTHS,
            resume_gap_months: DEFAULT_RESUME_GAP_MONTHS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    pub timeout_ms: u64,
    pub retries: u32,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerSettings {
    pub extension_path: Option<PathBuf>,
    pub extension_tokenizer: String,
}

impl ArchiveConfig {
    /// Backup root configured by `init`, resolved against `project_root` when relative.
    pub fn backup_path(&self, project_root: &Path) -> Option<PathBuf> {
        let raw = self.archive.backup_path.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            Some(path)
        } else {
            Some(project_root.join(path))
        }
    }

    pub fn scan_policy(&self) -> ScanPolicy {
        ScanPolicy {
            rescan_window_months: self
                .import
                .rescan_window_months
                .unwrap_or(DEFAULT_RESCAN_WINDOW_MONTHS),
            resume_gap_months: self
                .import
                .resume_gap_months
                .unwrap_or(DEFAULT_RESUME_GAP_MONTHS),
        }
    }

    /// Resolve user agent: env PLURKIVE_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        if let Some(value) = env_value("PLURKIVE_USER_AGENT") {
            return value;
        }
        self.links
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            timeout_ms: self.links.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            retries: self.links.retries.unwrap_or(DEFAULT_RETRIES).max(1),
            user_agent: self.user_agent(),
        }
    }

    /// Tokenizer extension: env PLURKIVE_TOKENIZER_EXTENSION > config.
    pub fn tokenizer_settings(&self, project_root: &Path) -> TokenizerSettings {
        let raw = env_value("PLURKIVE_TOKENIZER_EXTENSION")
            .or_else(|| self.search.tokenizer_extension.clone())
            .filter(|value| !value.trim().is_empty());
        let extension_path = raw.map(|value| {
            let path = PathBuf::from(value.trim());
            if path.is_absolute() {
                path
            } else {
                project_root.join(path)
            }
        });
        TokenizerSettings {
            extension_path,
            extension_tokenizer: self
                .search
                .extension_tokenizer
                .clone()
                .unwrap_or_else(|| DEFAULT_EXTENSION_TOKENIZER.to_string()),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Load and parse an ArchiveConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ArchiveConfig> {
    if !config_path.exists() {
        return Ok(ArchiveConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ArchiveConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Set `[archive] backup_path` while preserving every other key.
/// Returns `true` when a write occurred.
pub fn patch_backup_path(config_path: &Path, backup_path: &Path) -> Result<bool> {
    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!(
            "top-level TOML must be a table in {}",
            config_path.display()
        )
    })?;
    let archive_table = root_table
        .entry("archive".to_string())
        .or_insert_with(|| Value::Table(Default::default()))
        .as_table_mut()
        .ok_or_else(|| anyhow::anyhow!("[archive] must be a table in {}", config_path.display()))?;
    archive_table.insert(
        "backup_path".to_string(),
        Value::String(backup_path.to_string_lossy().replace('\\', "/")),
    );

    if root == original {
        return Ok(false);
    }

    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let rendered = toml::to_string_pretty(&root).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_policy() {
        let config = ArchiveConfig::default();
        assert_eq!(config.scan_policy(), ScanPolicy::default());
        assert_eq!(config.scan_policy().rescan_window_months, 6);
        let fetch = config.fetch_settings();
        assert_eq!(fetch.timeout_ms, 10_000);
        assert_eq!(fetch.retries, 3);
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert!(config.archive.backup_path.is_none());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[archive]
backup_path = "backup"

[search]
tokenizer_extension = "/opt/icu/libfts5_icu.so"
extension_tokenizer = "icu ja"

[import]
rescan_window_months = 3
resume_gap_months = 12

[links]
timeout_ms = 2500
retries = 0
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.backup_path(Path::new("/root/viewer")),
            Some(PathBuf::from("/root/viewer/backup"))
        );
        assert_eq!(
            config.scan_policy(),
            ScanPolicy {
                rescan_window_months: 3,
                resume_gap_months: 12,
            }
        );
        assert_eq!(config.fetch_settings().timeout_ms, 2500);
        // at least one attempt is always made
        assert_eq!(config.fetch_settings().retries, 1);
        assert_eq!(config.search.extension_tokenizer.as_deref(), Some("icu ja"));
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[archive\nbackup_path = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn patch_backup_path_preserves_other_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("state").join("config.toml");
        fs::create_dir_all(config_path.parent().expect("parent")).expect("mkdir");
        fs::write(&config_path, "[links]\nretries = 5\n").expect("write config");

        let wrote = patch_backup_path(&config_path, Path::new("/data/backup")).expect("patch");
        assert!(wrote);
        let again = patch_backup_path(&config_path, Path::new("/data/backup")).expect("patch");
        assert!(!again);

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.archive.backup_path.as_deref(), Some("/data/backup"));
        assert_eq!(config.links.retries, Some(5));
    }
}
