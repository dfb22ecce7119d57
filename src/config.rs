//! Configuration for vmsetup paths and cache behavior.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (VMSETUP_HOME, VMSETUP_CACHE_DIR, VMSETUP_ARCH)
//! 2. Config file (.vmsetup/config.yaml)
//! 3. Defaults (~/.vmsetup)
//!
//! Config file discovery:
//! - Searches current directory and parents for .vmsetup/config.yaml
//! - Paths in config file are relative to the .vmsetup/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::DEFAULT_SHELL;
use crate::core::host_arch;
use crate::domain::expand_home;

pub const ENV_HOME: &str = "VMSETUP_HOME";
pub const ENV_CACHE_DIR: &str = "VMSETUP_CACHE_DIR";
pub const ENV_ARCH: &str = "VMSETUP_ARCH";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub shell: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (ledger, journals)
    pub home: Option<String>,
    /// Artifact cache root
    pub cache: Option<String>,
    /// Directory holding pipeline files
    pub pipelines: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub enabled: Option<bool>,
    pub arch: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// Artifact cache root (its existence is what makes the cache available)
    pub cache_root: PathBuf,
    /// Directory searched for named pipelines
    pub pipelines_dir: PathBuf,
    /// Whether to consult the artifact cache at all
    pub cache_enabled: bool,
    /// Architecture used in cache keys
    pub arch: String,
    /// Interpreter for step scripts
    pub shell: String,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Completion ledger directory
    pub fn ledger_dir(&self) -> PathBuf {
        self.home.join("ledger")
    }

    /// Run journal directory
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Lock file guarding against concurrent invocations
    pub fn lock_path(&self) -> PathBuf {
        self.home.join("vmsetup.lock")
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".vmsetup").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = expand_home(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(&path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path))
    }
}

/// Combine a config file (if any) with environment lookups
fn resolve_config(
    config_path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".vmsetup");

    let config = config_path.map(load_config_file).transpose()?;
    // Relative paths in the file resolve against .vmsetup/
    let config_dir = config_path
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let from_file = |value: Option<&String>| value.map(|v| resolve_path(config_dir, v));

    let home = env(ENV_HOME)
        .map(|v| expand_home(&v))
        .or_else(|| from_file(config.as_ref().and_then(|c| c.paths.home.as_ref())))
        .unwrap_or(default_home);

    let cache_root = env(ENV_CACHE_DIR)
        .map(|v| expand_home(&v))
        .or_else(|| from_file(config.as_ref().and_then(|c| c.paths.cache.as_ref())))
        .unwrap_or_else(|| home.join("artifact-cache"));

    let pipelines_dir = from_file(config.as_ref().and_then(|c| c.paths.pipelines.as_ref()))
        .unwrap_or_else(|| PathBuf::from("pipelines"));

    let cache_settings = config.as_ref().and_then(|c| c.cache.as_ref());

    let cache_enabled = cache_settings.and_then(|c| c.enabled).unwrap_or(true);

    let arch = env(ENV_ARCH)
        .or_else(|| cache_settings.and_then(|c| c.arch.clone()))
        .unwrap_or_else(host_arch);

    let shell = config
        .as_ref()
        .and_then(|c| c.shell.clone())
        .unwrap_or_else(|| DEFAULT_SHELL.to_string());

    Ok(ResolvedConfig {
        home,
        cache_root,
        pipelines_dir,
        cache_enabled,
        arch,
        shell,
        config_file: config_path.map(Path::to_path_buf),
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let config_file = find_config_file(&cwd);

    resolve_config(config_file.as_deref(), |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| {
        load_config().map_err(|e| format!("{:#}", e))
    });

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (bypasses the cache)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve_config(None, no_env).unwrap();

        let expected_home = dirs::home_dir().unwrap().join(".vmsetup");
        assert_eq!(config.home, expected_home);
        assert_eq!(config.ledger_dir(), expected_home.join("ledger"));
        assert_eq!(config.cache_root, expected_home.join("artifact-cache"));
        assert_eq!(config.pipelines_dir, PathBuf::from("pipelines"));
        assert!(config.cache_enabled);
        assert_eq!(config.arch, host_arch());
        assert_eq!(config.shell, "bash");
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing_and_resolution() {
        let temp = TempDir::new().unwrap();
        let vmsetup_dir = temp.path().join(".vmsetup");
        std::fs::create_dir_all(&vmsetup_dir).unwrap();

        let config_path = vmsetup_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
paths:
  home: state
  cache: /mnt/snapshot/cache
  pipelines: ../pipelines
cache:
  enabled: false
  arch: arm64
shell: zsh
"#
        )
        .unwrap();

        let raw = load_config_file(&config_path).unwrap();
        assert_eq!(raw.version, "1");
        assert_eq!(raw.paths.home, Some("state".to_string()));

        let config = resolve_config(Some(&config_path), no_env).unwrap();
        assert_eq!(config.home, vmsetup_dir.join("state"));
        assert_eq!(config.cache_root, PathBuf::from("/mnt/snapshot/cache"));
        assert!(config.pipelines_dir.ends_with("pipelines"));
        assert!(!config.cache_enabled);
        assert_eq!(config.arch, "arm64");
        assert_eq!(config.shell, "zsh");
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let vmsetup_dir = temp.path().join(".vmsetup");
        std::fs::create_dir_all(&vmsetup_dir).unwrap();
        let config_path = vmsetup_dir.join("config.yaml");
        std::fs::write(
            &config_path,
            "version: \"1\"\npaths:\n  home: state\ncache:\n  arch: amd64\n",
        )
        .unwrap();

        let vars: HashMap<&str, String> = [
            (ENV_HOME, "/srv/vmsetup".to_string()),
            (ENV_ARCH, "arm64".to_string()),
        ]
        .into_iter()
        .collect();

        let config = resolve_config(Some(&config_path), |k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.home, PathBuf::from("/srv/vmsetup"));
        assert_eq!(config.cache_root, PathBuf::from("/srv/vmsetup/artifact-cache"));
        assert_eq!(config.arch, "arm64");
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let temp = TempDir::new().unwrap();
        let vmsetup_dir = temp.path().join(".vmsetup");
        std::fs::create_dir_all(&vmsetup_dir).unwrap();
        std::fs::write(vmsetup_dir.join("config.yaml"), "version: \"1\"\n").unwrap();

        let nested = temp.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(
            find_config_file(&nested),
            Some(vmsetup_dir.join("config.yaml"))
        );
    }

    #[test]
    fn test_reload_config_bypasses_cache() {
        let cached = config().unwrap();
        let fresh = reload_config().unwrap();

        assert_eq!(fresh.config_file, cached.config_file);
        assert_eq!(
            fresh.config_file,
            find_config_file(&std::env::current_dir().unwrap())
        );
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.vmsetup");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/.vmsetup/./subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            resolve_path(&base, "~/cache"),
            dirs::home_dir().unwrap().join("cache")
        );
    }
}
