//! Daemon configuration file.
//!
//! # Storage layout
//!
//! ```text
//! ~/.spaced/
//!   config.yaml      (mode 0600, written by `spaced config init`)
//! ```
//!
//! # API pattern
//!
//! Every I/O function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const SPACED_DIR: &str = ".spaced";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_ROOT_DIR: &str = "Space";

// ---------------------------------------------------------------------------
// 1. Sections
// ---------------------------------------------------------------------------

/// How to launch and judge the storage node process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Executable name (looked up on `$PATH`) or absolute path.
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// When set, the node only counts as ready once this address accepts TCP.
    pub ready_probe: Option<SocketAddr>,
    pub ready_timeout_ms: u64,
    pub probe_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL on stop.
    pub stop_grace_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ipfs"),
            args: vec!["daemon".to_string()],
            env: BTreeMap::new(),
            working_dir: None,
            ready_probe: None,
            ready_timeout_ms: 30_000,
            probe_interval_ms: 200,
            stop_grace_ms: 5_000,
        }
    }
}

impl NodeConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Absolute directories watched recursively.
    pub roots: Vec<PathBuf>,
    /// Bound on buffered raw notifications before overflow is reported.
    pub capacity: usize,
    /// How long an unpaired rename-from waits for its rename-to.
    pub rename_window_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            roots: vec![],
            capacity: 1024,
            rename_window_ms: 100,
        }
    }
}

impl WatcherConfig {
    pub fn rename_window(&self) -> Duration {
        Duration::from_millis(self.rename_window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// A cached entry older than this is refetched even without an event.
    pub entry_ttl_secs: u64,
    /// Entries not read for this long are evicted.
    pub idle_eviction_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_ttl_secs: 300,
            idle_eviction_secs: 900,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub node: NodeConfig,
    pub watcher: WatcherConfig,
    pub cache: CacheConfig,
    pub log: LogConfig,
}

impl DaemonConfig {
    /// Defaults with the watched root set to `<home>/Space`.
    pub fn default_for(home: &Path) -> Self {
        let mut config = Self::default();
        config.watcher.roots = vec![home.join(DEFAULT_ROOT_DIR)];
        config
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.binary.as_os_str().is_empty() {
            return Err(invalid("node.binary", "must not be empty"));
        }
        if self.node.probe_interval_ms == 0 {
            return Err(invalid("node.probe_interval_ms", "must be greater than zero"));
        }
        if self.node.ready_probe.is_some() && self.node.ready_timeout_ms == 0 {
            return Err(invalid(
                "node.ready_timeout_ms",
                "must be greater than zero when ready_probe is set",
            ));
        }
        if self.watcher.roots.is_empty() {
            return Err(invalid("watcher.roots", "at least one root is required"));
        }
        if let Some(root) = self.watcher.roots.iter().find(|r| !r.is_absolute()) {
            return Err(invalid(
                "watcher.roots",
                format!("'{}' is not an absolute path", root.display()),
            ));
        }
        if self.watcher.capacity == 0 {
            return Err(invalid("watcher.capacity", "must be greater than zero"));
        }
        if self.cache.entry_ttl_secs == 0 {
            return Err(invalid("cache.entry_ttl_secs", "must be greater than zero"));
        }
        if self.cache.idle_eviction_secs == 0 {
            return Err(invalid("cache.idle_eviction_secs", "must be greater than zero"));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(invalid("cache.sweep_interval_secs", "must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// 2. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.spaced/`: pure, no I/O.
pub fn spaced_dir_at(home: &Path) -> PathBuf {
    home.join(SPACED_DIR)
}

/// `<home>/.spaced/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    spaced_dir_at(home).join(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// 3. Load
// ---------------------------------------------------------------------------

/// Load `<home>/.spaced/config.yaml`.
///
/// A missing file yields [`DaemonConfig::default_for`]; malformed YAML yields
/// `ConfigError::Parse` with path and line context. The result is not validated.
pub fn load_at(home: &Path) -> Result<DaemonConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(DaemonConfig::default_for(home));
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<DaemonConfig, ConfigError> {
    load_at(&home()?)
}

// ---------------------------------------------------------------------------
// 4. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the config.
///
/// Write flow: serialize → `config.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &DaemonConfig) -> Result<(), ConfigError> {
    let dir = spaced_dir_at(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name(format!("{CONFIG_FILE}.tmp"));

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &DaemonConfig) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// 5. Init
// ---------------------------------------------------------------------------

/// Write the default config if none exists.
///
/// Idempotent: an existing file is loaded and returned unchanged. The boolean
/// is `true` when a new file was written.
pub fn init_at(home: &Path) -> Result<(DaemonConfig, bool), ConfigError> {
    if config_path_at(home).exists() {
        return Ok((load_at(home)?, false));
    }
    let config = DaemonConfig::default_for(home);
    save_at(home, &config)?;
    Ok((config, true))
}

/// `init_at` convenience wrapper.
pub fn init() -> Result<(DaemonConfig, bool), ConfigError> {
    init_at(&home()?)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

/// `dirs::home_dir()`, or `ConfigError::HomeNotFound`.
pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_home() -> TempDir {
        TempDir::new().expect("tempdir")
    }

    #[test]
    fn config_path_is_correct() {
        let home = make_home();
        assert!(config_path_at(home.path()).ends_with(".spaced/config.yaml"));
    }

    #[test]
    fn missing_file_yields_defaults_for_home() {
        let home = make_home();
        let config = load_at(home.path()).expect("load");
        assert_eq!(config.watcher.roots, vec![home.path().join("Space")]);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn save_and_load_roundtrip() {
        let home = make_home();
        let mut config = DaemonConfig::default_for(home.path());
        config.node.ready_probe = Some("127.0.0.1:5001".parse().unwrap());
        config.node.env.insert("IPFS_PATH".into(), "/tmp/ipfs".into());
        save_at(home.path(), &config).expect("save");
        assert_eq!(load_at(home.path()).expect("load"), config);
    }

    #[test]
    fn config_file_has_owner_only_perms() {
        let home = make_home();
        save_at(home.path(), &DaemonConfig::default_for(home.path())).expect("save");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(config_path_at(home.path()))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let home = make_home();
        let dir = spaced_dir_at(home.path());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            config_path_at(home.path()),
            "watcher:\n  roots: [/data]\nnode:\n  binary: /usr/local/bin/ipfs\n",
        )
        .unwrap();
        let config = load_at(home.path()).expect("load");
        assert_eq!(config.watcher.roots, vec![PathBuf::from("/data")]);
        assert_eq!(config.watcher.capacity, 1024);
        assert_eq!(config.node.args, vec!["daemon".to_string()]);
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn validate_rejects_relative_root() {
        let mut config = DaemonConfig::default();
        config.watcher.roots = vec![PathBuf::from("relative/dir")];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "watcher.roots", .. }));
        assert!(err.to_string().contains("relative/dir"));
    }

    #[test]
    fn validate_rejects_missing_roots_and_empty_binary() {
        let config = DaemonConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "watcher.roots", .. })
        ));

        let mut config = DaemonConfig::default_for(Path::new("/home/me"));
        config.node.binary = PathBuf::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "node.binary", .. })
        ));
    }

    #[test]
    fn init_is_idempotent() {
        let home = make_home();
        let (first, created) = init_at(home.path()).expect("init");
        assert!(created);
        let (second, created) = init_at(home.path()).expect("init again");
        assert!(!created);
        assert_eq!(first, second);
    }

    #[test]
    fn home_not_found_error_message() {
        assert!(ConfigError::HomeNotFound.to_string().contains("home directory"));
    }
}
