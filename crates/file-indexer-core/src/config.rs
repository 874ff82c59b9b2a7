use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use tracing::debug;

use crate::archive::{
    ArchiveOptions, DEFAULT_FAIL_THRESHOLD, DEFAULT_MAX_ARCHIVE_SIZE, DEFAULT_MAX_ENTRY_SIZE,
};
use crate::batch::DEFAULT_BATCH_SIZE;
use crate::engine::ScanOptions;
use crate::error::Result;
use crate::scanner::SkipRules;

pub const ENV_PREFIX: &str = "INDEXER";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub machine_name: String,
    pub db_path: String,
    pub log_path: String,
    pub scan_archives: bool,
    pub max_archive_size: u64,
    pub max_archive_file_size: u64,
    pub archive_entry_fail_threshold: usize,
    pub batch_size: usize,
    /// Unset means one worker per logical CPU.
    pub workers: Option<usize>,
    pub enable_ignore_rules: bool,
    pub ignore_file: String,
    pub ignore_dirs: Vec<String>,
    pub ignore_partial_dirs: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub progress_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            machine_name: "localhost".to_string(),
            db_path: "indexer.db".to_string(),
            log_path: "indexer.log".to_string(),
            scan_archives: true,
            max_archive_size: DEFAULT_MAX_ARCHIVE_SIZE,
            max_archive_file_size: DEFAULT_MAX_ENTRY_SIZE,
            archive_entry_fail_threshold: DEFAULT_FAIL_THRESHOLD,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: None,
            enable_ignore_rules: false,
            ignore_file: ".ignore".to_string(),
            ignore_dirs: Vec::new(),
            ignore_partial_dirs: Vec::new(),
            ignore_patterns: Vec::new(),
            progress_interval_ms: 500,
        }
    }
}

/// Loads `Config.{toml,yaml,json}` from the working directory (optional)
/// overlaid with `INDEXER_*` environment variables.
pub fn load_configuration() -> std::result::Result<AppConfig, ConfigError> {
    build(ConfigFile::with_name("Config").required(false))
}

/// Same as [`load_configuration`] but reads the given file, which must exist.
pub fn load_configuration_from(path: &Path) -> std::result::Result<AppConfig, ConfigError> {
    build(ConfigFile::from(path).required(true))
}

fn build<S>(file: S) -> std::result::Result<AppConfig, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let settings = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ignore_dirs")
                .with_list_parse_key("ignore_partial_dirs")
                .with_list_parse_key("ignore_patterns"),
        )
        .build()?;
    settings.try_deserialize::<AppConfig>()
}

impl AppConfig {
    /// Human-readable problems that do not prevent a scan.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.machine_name.trim().is_empty() {
            warnings.push("machine_name is empty, rows will not be attributable".to_string());
        }
        if self.scan_archives {
            if self.max_archive_size == 0 {
                warnings.push("max_archive_size is 0, no archive will be opened".to_string());
            }
            if self.max_archive_file_size == 0 {
                warnings.push(
                    "max_archive_file_size is 0, every archive entry will be skipped".to_string(),
                );
            }
        }
        if self.batch_size == 0 {
            warnings.push("batch_size is 0, using 1".to_string());
        }
        if self.workers == Some(0) {
            warnings.push("workers is 0, using 1".to_string());
        }
        warnings
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Builds the directory skip policy, or `None` when ignore rules are off.
    pub fn skip_rules(&self) -> Result<Option<SkipRules>> {
        if !self.enable_ignore_rules {
            return Ok(None);
        }
        let mut rules = SkipRules::load(Path::new(&self.ignore_file))?;
        for name in &self.ignore_dirs {
            rules.add_name(name);
        }
        for fragment in &self.ignore_partial_dirs {
            rules.add_partial(fragment);
        }
        rules.add_patterns(&self.ignore_patterns);
        Ok(Some(rules))
    }

    pub fn scan_options(&self) -> Result<ScanOptions> {
        let options = ScanOptions {
            machine_name: self.machine_name.clone(),
            workers: self.worker_count(),
            walker_threads: num_cpus::get(),
            batch_size: self.batch_size.max(1),
            skip_rules: self.skip_rules()?,
            archives: ArchiveOptions {
                enabled: self.scan_archives,
                max_archive_size: self.max_archive_size,
                max_entry_size: self.max_archive_file_size,
                fail_threshold: self.archive_entry_fail_threshold,
            },
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        };
        debug!("Scan options: {:?}", options);
        Ok(options)
    }

    /// Key/value view used by `print-config`.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("machine_name", self.machine_name.clone()),
            ("db_path", self.db_path.clone()),
            ("log_path", self.log_path.clone()),
            ("scan_archives", self.scan_archives.to_string()),
            ("max_archive_size", self.max_archive_size.to_string()),
            ("max_archive_file_size", self.max_archive_file_size.to_string()),
            (
                "archive_entry_fail_threshold",
                self.archive_entry_fail_threshold.to_string(),
            ),
            ("batch_size", self.batch_size.to_string()),
            ("workers", self.worker_count().to_string()),
            ("enable_ignore_rules", self.enable_ignore_rules.to_string()),
            ("ignore_file", self.ignore_file.clone()),
            ("ignore_dirs", self.ignore_dirs.join(",")),
            ("ignore_partial_dirs", self.ignore_partial_dirs.join(",")),
            ("ignore_patterns", self.ignore_patterns.join(",")),
            ("progress_interval_ms", self.progress_interval_ms.to_string()),
        ]
    }
}

/// Drops paths nested under another path in the list, keeping first-seen order.
pub fn non_overlapping_directories(dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for dir in dirs {
        if result.iter().any(|kept| dir.starts_with(kept)) {
            continue;
        }
        result.retain(|kept| !kept.starts_with(&dir));
        result.push(dir);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(items: &[&str]) -> Vec<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_non_overlapping_no_overlap() {
        let result =
            non_overlapping_directories(paths(&["/home/user/photos", "/home/user/docs", "/var/data"]));
        assert_eq!(result, paths(&["/home/user/photos", "/home/user/docs", "/var/data"]));
    }

    #[test]
    fn test_non_overlapping_with_subdirectory() {
        let result =
            non_overlapping_directories(paths(&["/home/user", "/home/user/docs", "/var/data"]));
        assert_eq!(result, paths(&["/home/user", "/var/data"]));
    }

    #[test]
    fn test_non_overlapping_parent_after_children() {
        let result = non_overlapping_directories(paths(&[
            "/home/user/docs",
            "/home/user/photos",
            "/home/user",
            "/home/username",
        ]));
        assert_eq!(result, paths(&["/home/user", "/home/username"]));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.max_archive_size, 500 * 1024 * 1024);
        assert_eq!(config.max_archive_file_size, 100 * 1024 * 1024);
        assert_eq!(config.archive_entry_fail_threshold, 50);
        assert_eq!(config.batch_size, 200);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Config.toml");
        std::fs::write(
            &path,
            "machine_name = \"nas\"\nbatch_size = 50\nscan_archives = false\nignore_dirs = [\"tmp\"]\n",
        )
        .unwrap();

        let config = load_configuration_from(&path).unwrap();
        assert_eq!(config.machine_name, "nas");
        assert_eq!(config.batch_size, 50);
        assert!(!config.scan_archives);
        assert_eq!(config.ignore_dirs, vec!["tmp".to_string()]);
        assert_eq!(config.db_path, "indexer.db");
    }

    #[test]
    fn validate_flags_unusable_values() {
        let config = AppConfig {
            machine_name: " ".into(),
            max_archive_file_size: 0,
            workers: Some(0),
            ..AppConfig::default()
        };
        assert_eq!(config.validate().len(), 3);
        assert_eq!(config.worker_count(), 1);
    }

    #[test]
    fn skip_rules_merge_file_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let ignore = dir.path().join(".ignore");
        std::fs::write(&ignore, "build\nvendor/cache\n").unwrap();
        let config = AppConfig {
            enable_ignore_rules: true,
            ignore_file: ignore.to_string_lossy().into_owned(),
            ignore_dirs: vec!["dist".into()],
            ..AppConfig::default()
        };

        let rules = config.skip_rules().unwrap().unwrap();
        assert!(rules.should_skip(Path::new("/p/build")));
        assert!(rules.should_skip(Path::new("/p/dist")));
        assert!(rules.should_skip(Path::new("/p/vendor/cache")));
        assert!(!rules.should_skip(Path::new("/p/src")));

        let disabled = AppConfig::default();
        assert!(disabled.skip_rules().unwrap().is_none());
    }
}
