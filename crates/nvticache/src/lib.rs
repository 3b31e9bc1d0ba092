//! File-backed cache of parsed plugin descriptions
//!
//! One `<file>.nvti` JSON document per plugin script lives under the cache
//! directory. An entry is only served while it is at least as new as the
//! script and its detached signature.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, trace};

const ENTRY_SUFFIX: &str = "nvti";
const SIGNATURE_SUFFIX: &str = "asc";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache directory {0} does not exist")]
    MissingDirectory(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot encode cache entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Plugin preference map keyed by `"{plugin}[{type}]:{name}"`.
pub type Preferences = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginPreference {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub default: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginEntry {
    pub oid: String,
    pub name: String,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub preferences: Vec<PluginPreference>,
}

impl PluginEntry {
    pub fn new(oid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            name: name.into(),
            family: None,
            preferences: Vec::new(),
        }
    }

    pub fn with_preference(
        mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
        default: impl Into<String>,
    ) -> Self {
        self.preferences.push(PluginPreference {
            name: name.into(),
            kind: kind.into(),
            default: default.into(),
        });
        self
    }
}

pub struct NvtCache {
    cache_dir: PathBuf,
    source_dir: PathBuf,
}

impl NvtCache {
    pub fn init(
        cache_dir: impl Into<PathBuf>,
        source_dir: impl Into<PathBuf>,
    ) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.into();
        if !cache_dir.is_dir() {
            return Err(CacheError::MissingDirectory(cache_dir));
        }
        Ok(Self {
            cache_dir,
            source_dir: source_dir.into(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_path(&self, file: &str) -> PathBuf {
        with_suffix(&self.cache_dir.join(file), ENTRY_SUFFIX)
    }

    /// Write `entry` for the script `file` (relative, may contain
    /// subdirectories).
    pub fn store(&self, entry: &PluginEntry, file: &str) -> Result<(), CacheError> {
        let path = self.entry_path(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(entry)?;
        fs::write(&path, data)?;
        debug!(file, path = %path.display(), "cache entry stored");
        Ok(())
    }

    /// Fetch the entry for `file` and merge its preferences into `prefs`.
    /// A missing, stale or unreadable entry is a miss.
    pub fn load(&self, file: &str, prefs: &mut Preferences) -> Option<PluginEntry> {
        let entry_path = self.entry_path(file);
        let entry_time = modified(&entry_path)?;

        let source = self.source_dir.join(file);
        let Some(source_time) = modified(&source) else {
            trace!(file, "source script missing");
            return None;
        };
        let signature_time = modified(&with_suffix(&source, SIGNATURE_SUFFIX));

        let now = SystemTime::now();
        for stamp in std::iter::once(source_time).chain(signature_time) {
            if stamp > now {
                debug!(file, "source timestamp lies in the future");
                return None;
            }
            if stamp > entry_time {
                debug!(file, "cache entry is stale");
                return None;
            }
        }

        let entry: PluginEntry = match fs::read(&entry_path)
            .map_err(CacheError::from)
            .and_then(|data| serde_json::from_slice(&data).map_err(CacheError::from))
        {
            Ok(entry) => entry,
            Err(e) => {
                debug!(file, error = %e, "cache entry unreadable");
                return None;
            }
        };

        for pref in &entry.preferences {
            add_plugin_preference(prefs, &entry.name, &pref.name, &pref.kind, &pref.default);
        }
        Some(entry)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Register a default for one plugin preference. Existing keys win.
pub fn add_plugin_preference(
    prefs: &mut Preferences,
    plugin_name: &str,
    name: &str,
    kind: &str,
    default: &str,
) {
    let key = format!("{}[{}]:{}", plugin_name, kind, name.trim_end_matches(' '));
    prefs.entry(key).or_insert_with(|| default.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _cache: TempDir,
        source: TempDir,
        cache: NvtCache,
    }

    fn fixture() -> Fixture {
        let cache_dir = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let cache = NvtCache::init(cache_dir.path(), source.path()).unwrap();
        Fixture {
            _cache: cache_dir,
            source,
            cache,
        }
    }

    fn touch(path: &Path, at: SystemTime) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let file = File::options().create(true).append(true).open(path).unwrap();
        file.set_modified(at).unwrap();
    }

    fn ago(secs: u64) -> SystemTime {
        SystemTime::now() - Duration::from_secs(secs)
    }

    fn entry() -> PluginEntry {
        PluginEntry::new("1.3.6.1.4.1.25623.1.0.10330", "Services")
            .with_preference("Network connection timeout :  ", "entry", "5")
    }

    #[test]
    fn test_init_requires_cache_dir() {
        let source = TempDir::new().unwrap();
        let missing = source.path().join("nope");
        assert!(matches!(
            NvtCache::init(&missing, source.path()),
            Err(CacheError::MissingDirectory(p)) if p == missing
        ));
    }

    #[test]
    fn test_store_then_load() {
        let fx = fixture();
        touch(&fx.source.path().join("x.nasl"), ago(3600));
        fx.cache.store(&entry(), "x.nasl").unwrap();
        assert!(fx.cache.cache_dir().join("x.nasl.nvti").exists());

        let mut prefs = Preferences::new();
        let loaded = fx.cache.load("x.nasl", &mut prefs).unwrap();
        assert_eq!(loaded, entry());
        assert_eq!(
            prefs.get("Services[entry]:Network connection timeout :"),
            Some(&"5".to_string())
        );
    }

    #[test]
    fn test_newer_source_invalidates_entry() {
        let fx = fixture();
        let script = fx.source.path().join("x.nasl");
        touch(&script, ago(7200));
        fx.cache.store(&entry(), "x.nasl").unwrap();
        touch(&fx.cache.cache_dir().join("x.nasl.nvti"), ago(3600));
        assert!(fx.cache.load("x.nasl", &mut Preferences::new()).is_some());

        touch(&script, ago(60));
        assert!(fx.cache.load("x.nasl", &mut Preferences::new()).is_none());
    }

    #[test]
    fn test_newer_signature_invalidates_entry() {
        let fx = fixture();
        touch(&fx.source.path().join("x.nasl"), ago(7200));
        fx.cache.store(&entry(), "x.nasl").unwrap();
        touch(&fx.cache.cache_dir().join("x.nasl.nvti"), ago(3600));
        touch(&fx.source.path().join("x.nasl.asc"), ago(60));
        assert!(fx.cache.load("x.nasl", &mut Preferences::new()).is_none());
    }

    #[test]
    fn test_future_timestamp_is_a_miss() {
        let fx = fixture();
        let script = fx.source.path().join("x.nasl");
        touch(&script, SystemTime::now() + Duration::from_secs(86_400));
        fx.cache.store(&entry(), "x.nasl").unwrap();
        touch(
            &fx.cache.cache_dir().join("x.nasl.nvti"),
            SystemTime::now() + Duration::from_secs(2 * 86_400),
        );
        assert!(fx.cache.load("x.nasl", &mut Preferences::new()).is_none());
    }

    #[test]
    fn test_missing_source_or_entry_is_a_miss() {
        let fx = fixture();
        assert!(fx.cache.load("x.nasl", &mut Preferences::new()).is_none());

        fx.cache.store(&entry(), "sub/dir/y.nasl").unwrap();
        assert!(fx.cache.cache_dir().join("sub/dir/y.nasl.nvti").exists());
        assert!(fx.cache.load("sub/dir/y.nasl", &mut Preferences::new()).is_none());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let fx = fixture();
        touch(&fx.source.path().join("x.nasl"), ago(3600));
        fs::write(fx.cache.cache_dir().join("x.nasl.nvti"), b"not json").unwrap();
        assert!(fx.cache.load("x.nasl", &mut Preferences::new()).is_none());
    }

    #[test]
    fn test_preferences_are_not_overwritten() {
        let mut prefs = Preferences::new();
        prefs.insert("Services[entry]:Timeout".to_string(), "10".to_string());
        add_plugin_preference(&mut prefs, "Services", "Timeout  ", "entry", "5");
        add_plugin_preference(&mut prefs, "Services", "Retries", "entry", "2");
        assert_eq!(prefs["Services[entry]:Timeout"], "10");
        assert_eq!(prefs["Services[entry]:Retries"], "2");
    }
}
