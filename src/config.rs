//! Manager configuration.
//!
//! Describes where addons live on disk, where temporary archives and backups
//! go, which database receives addon SQL, and how the registry is contacted.
//! Loaded from a TOML file; every key has a default so an empty file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Application root. Relative paths below resolve against it.
    pub root: PathBuf,
    pub addons_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub public_static_dir: PathBuf,
    pub app_dir: PathBuf,
    /// Output directory for `pack`.
    pub build_dir: PathBuf,
    pub database: DatabaseConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file, relative to root, or `:memory:`.
    pub path: String,
    /// Replaces the `__PREFIX__` token in addon SQL scripts.
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub accept_invalid_certs: bool,
    /// Treat non-2xx responses as download failures.
    pub raise_for_status: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            addons_dir: PathBuf::from("addons"),
            runtime_dir: PathBuf::from("runtime"),
            public_static_dir: PathBuf::from("public/static"),
            app_dir: PathBuf::from("app"),
            build_dir: PathBuf::from("runtime"),
            database: DatabaseConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "runtime/addons.db".to_string(),
            prefix: String::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 30,
            accept_invalid_certs: true,
            raise_for_status: false,
        }
    }
}

impl ManagerConfig {
    /// Default layout rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content).context(format!("Invalid config file: {:?}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ManagerConfig = toml::from_str(content)?;
        Ok(config)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Directory holding one subdirectory per installed addon.
    pub fn addons_path(&self) -> PathBuf {
        self.resolve(&self.addons_dir)
    }

    /// Directory of a single addon.
    pub fn addon_path(&self, name: &str) -> PathBuf {
        self.addons_path().join(name)
    }

    /// Temporary zips and backups.
    pub fn temp_path(&self) -> PathBuf {
        self.resolve(&self.runtime_dir).join("addons")
    }

    /// Shared public assets tree that addon `static/` files are copied into.
    pub fn public_static_path(&self) -> PathBuf {
        self.resolve(&self.public_static_dir)
    }

    /// Application source tree that addon `app/` overlays are merged into.
    pub fn app_path(&self) -> PathBuf {
        self.resolve(&self.app_dir)
    }

    pub fn build_path(&self) -> PathBuf {
        self.resolve(&self.build_dir)
    }

    /// Database location; `None` means an in-memory database.
    pub fn database_path(&self) -> Option<PathBuf> {
        if self.database.path == ":memory:" {
            None
        } else {
            Some(self.resolve(Path::new(&self.database.path)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve_under_root() {
        let config = ManagerConfig::with_root("/srv/app");
        assert_eq!(config.addon_path("cms"), PathBuf::from("/srv/app/addons/cms"));
        assert_eq!(config.temp_path(), PathBuf::from("/srv/app/runtime/addons"));
        assert_eq!(
            config.public_static_path(),
            PathBuf::from("/srv/app/public/static")
        );
        assert_eq!(config.app_path(), PathBuf::from("/srv/app/app"));
        assert_eq!(
            config.database_path(),
            Some(PathBuf::from("/srv/app/runtime/addons.db"))
        );
        assert_eq!(config.transport.timeout_secs, 30);
        assert!(config.transport.accept_invalid_certs);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ManagerConfig::from_toml(
            r#"
root = "/var/www"
addons_dir = "/opt/addons"

[database]
path = ":memory:"
prefix = "fa_"

[transport]
raise_for_status = true
"#,
        )
        .unwrap();

        assert_eq!(config.addons_path(), PathBuf::from("/opt/addons"));
        assert_eq!(config.app_path(), PathBuf::from("/var/www/app"));
        assert_eq!(config.database_path(), None);
        assert_eq!(config.database.prefix, "fa_");
        assert!(config.transport.raise_for_status);
        assert_eq!(config.transport.connect_timeout_secs, 30);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = ManagerConfig::load(Path::new("/nonexistent/addondepot.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
