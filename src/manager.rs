//! Addon lifecycle orchestration.
//!
//! `AddonManager` drives the install / upgrade / uninstall / enable / disable
//! transitions, coordinating the package transport, the descriptor and config
//! stores, the SQL import and the addon's own hooks.
//!
//! # States
//!
//! - **Absent**: no directory under the addons root
//! - **Installed, disabled**: directory present, `status = 0`
//! - **Installed, enabled**: directory present, `status = 1`
//!
//! Upgrades are only accepted from the disabled state.
//!
//! # Failure handling
//!
//! A failed install removes the directory it created. A failed upgrade puts
//! the pre-upgrade directory back from its backup archive when one was taken.
//! Database work (status flip, install hook, SQL import) runs inside a single
//! transaction; files copied outside the addon directory are not covered.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::addon::{Addon, AddonRegistry, AppContext, HookContext};
use crate::config::ManagerConfig;
use crate::database::{import_sql, Database, SqlImportReport, SqliteDatabase};
use crate::error::{AddonError, AddonResult};
use crate::fsutil::{copy_dirs, remove_dirs, rmdirs};
use crate::info::{is_valid_name, read_info, write_info, AddonInfo, AddonStatus, INFO_FILE};
use crate::package::{self, BackupOutcome};
use crate::settings::{self, ConfigField, ConfigValues};
use crate::transport::{download, HttpPackageSource, PackageSource};

/// Extra query parameters sent to the registry (version, token, ...).
pub type DownloadParams = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub info: AddonInfo,
    /// Whether the addon ships a non-empty config schema.
    pub has_config: bool,
    pub sql: SqlImportReport,
}

#[derive(Debug, Clone)]
pub struct UpgradeOutcome {
    pub info: AddonInfo,
    pub has_config: bool,
    pub backup: BackupOutcome,
    pub sql: SqlImportReport,
}

/// Which best-effort cleanup steps of an uninstall succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UninstallOutcome {
    pub assets_removed: bool,
    pub app_removed: bool,
    pub directory_removed: bool,
}

pub struct AddonManager {
    config: ManagerConfig,
    registry: AddonRegistry,
    source: Box<dyn PackageSource>,
    db: Box<dyn Database>,
}

impl AddonManager {
    pub fn new(
        config: ManagerConfig,
        registry: AddonRegistry,
        source: Box<dyn PackageSource>,
        db: Box<dyn Database>,
    ) -> Self {
        Self {
            config,
            registry,
            source,
            db,
        }
    }

    /// Manager backed by the HTTP registry client and the configured SQLite database.
    pub fn from_config(config: ManagerConfig, registry: AddonRegistry) -> AddonResult<Self> {
        let source = HttpPackageSource::new(config.transport.clone());
        let db = match config.database_path() {
            Some(path) => SqliteDatabase::open(&path, &config.database.prefix)?,
            None => SqliteDatabase::open_in_memory(&config.database.prefix)?,
        };
        Ok(Self::new(config, registry, Box::new(source), Box::new(db)))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry_mut(&mut self) -> &mut AddonRegistry {
        &mut self.registry
    }

    pub fn addon_dir(&self, name: &str) -> PathBuf {
        self.config.addon_path(name)
    }

    pub fn is_installed(&self, name: &str) -> bool {
        is_valid_name(name) && self.addon_dir(name).is_dir()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Download, extract, verify and activate a new addon.
    pub fn install(
        &mut self,
        name: &str,
        url: &str,
        params: &DownloadParams,
    ) -> AddonResult<InstallOutcome> {
        ensure_name(name)?;
        let addon_dir = self.addon_dir(name);
        if addon_dir.exists() {
            return Err(AddonError::operation("Addon already exists"));
        }
        info!("[ADDON-INSTALL] Installing {} from {}", name, url);

        let addons_root = self.config.addons_path();
        fs::create_dir_all(&addons_root).map_err(|e| {
            AddonError::Operation(format!("Failed to create {:?}: {}", addons_root, e))
        })?;

        let tmp_file = download(
            self.source.as_ref(),
            &self.config.temp_path(),
            name,
            url,
            params,
        )?;

        let extracted = package::unzip(&tmp_file, &addon_dir).and_then(|_| self.check(name));
        remove_temp_file(&tmp_file);
        let mut info = match extracted {
            Ok(info) => info,
            Err(e) => {
                warn!("[ADDON-INSTALL] {} rejected: {}", name, e);
                discard_dir(&addon_dir);
                return Err(e);
            }
        };
        let addon = self.resolve(name)?;

        let sql = self.transaction(|manager| {
            if !info.status.is_enabled() {
                info.status = AddonStatus::Enabled;
                info.url = Some(url.to_string());
                write_info(&addon_dir, &info)?;
            }
            manager.run_hook(name, addon.as_ref(), |addon, ctx| addon.install(ctx))?;
            Ok(import_sql(manager.db.as_mut(), &addon_dir)?)
        });
        let sql = match sql {
            Ok(report) => report,
            Err(e) => {
                warn!("[ADDON-INSTALL] {} failed during activation: {}", name, e);
                discard_dir(&addon_dir);
                return Err(e);
            }
        };

        self.enable(name)?;
        self.copy_overlays(name)?;

        let info = self.get_info(name)?;
        info!("[ADDON-INSTALL] {} {} installed", info.name, info.version);
        Ok(InstallOutcome {
            info,
            has_config: self.has_config(name),
            sql,
        })
    }

    /// Replace a disabled addon's files with a newer package.
    ///
    /// The returned descriptor is the pre-upgrade one with its version set to
    /// `params["version"]`, or left unchanged when no version was requested.
    pub fn upgrade(
        &mut self,
        name: &str,
        url: &str,
        params: &DownloadParams,
    ) -> AddonResult<UpgradeOutcome> {
        ensure_name(name)?;
        self.ensure_installed(name)?;
        let addon_dir = self.addon_dir(name);

        // Old descriptor: the rollback reference handed to the upgrade hook.
        let previous = self.get_info(name)?;
        if previous.status.is_enabled() {
            return Err(AddonError::operation("Please disable addon first"));
        }
        let saved_config = self.get_config(name)?;
        info!("[ADDON-UPGRADE] Upgrading {} {} from {}", name, previous.version, url);

        let temp_dir = self.config.temp_path();
        let tmp_file = download(self.source.as_ref(), &temp_dir, name, url, params)?;

        let backup = match package::backup(&addon_dir, &temp_dir, name) {
            Ok(path) => BackupOutcome::Created(path),
            Err(e) => {
                warn!("[ADDON-UPGRADE] Backup of {} failed: {:#}", name, e);
                BackupOutcome::Failed(format!("{:#}", e))
            }
        };

        let extracted = package::unzip(&tmp_file, &addon_dir).and_then(|_| self.check(name));
        remove_temp_file(&tmp_file);
        if let Err(e) = extracted {
            self.restore(name, &backup);
            return Err(e);
        }

        if let Err(e) = self.restore_config(name, &saved_config) {
            self.restore(name, &backup);
            return Err(e);
        }

        let sql = self.transaction(|manager| Ok(import_sql(manager.db.as_mut(), &addon_dir)?));
        let sql = match sql {
            Ok(report) => report,
            Err(e) => {
                self.restore(name, &backup);
                return Err(e);
            }
        };

        // New entry point: the hook runs against the freshly extracted code.
        let hooked = self.resolve(name).and_then(|addon| {
            self.run_hook(name, addon.as_ref(), |addon, ctx| addon.upgrade(ctx, &previous))
        });
        if let Err(e) = hooked {
            self.restore(name, &backup);
            return Err(e);
        }

        self.copy_overlays(name)?;

        let mut info = previous.clone();
        info.version = params
            .get("version")
            .cloned()
            .unwrap_or_else(|| previous.version.clone());
        info!("[ADDON-UPGRADE] {} upgraded {} -> {}", name, previous.version, info.version);
        Ok(UpgradeOutcome {
            info,
            has_config: self.has_config(name),
            backup,
            sql,
        })
    }

    /// Run the uninstall hook, then remove overlays and the addon directory.
    pub fn uninstall(&mut self, name: &str) -> AddonResult<UninstallOutcome> {
        ensure_name(name)?;
        self.ensure_installed(name)?;
        let addon_dir = self.addon_dir(name);

        if let Some(addon) = self.registry.resolve(&AppContext::new(&self.config, name)) {
            self.run_hook(name, addon.as_ref(), |addon, ctx| addon.uninstall(ctx))?;
        }

        let assets_removed = report_cleanup(
            "static assets",
            remove_dirs(&addon_dir.join("static"), &self.config.public_static_path()).map(|_| ()),
        );
        let app_removed = report_cleanup(
            "app overlay",
            remove_dirs(&addon_dir.join("app"), &self.config.app_path()).map(|_| ()),
        );
        let directory_removed = report_cleanup("addon directory", rmdirs(&addon_dir));

        info!("[ADDON-UNINSTALL] {} uninstalled", name);
        Ok(UninstallOutcome {
            assets_removed,
            app_removed,
            directory_removed,
        })
    }

    /// Mark an addon enabled, then run its enable hook.
    pub fn enable(&mut self, name: &str) -> AddonResult<AddonInfo> {
        self.switch_status(name, AddonStatus::Enabled)
    }

    /// Mark an addon disabled, then run its disable hook.
    pub fn disable(&mut self, name: &str) -> AddonResult<AddonInfo> {
        self.switch_status(name, AddonStatus::Disabled)
    }

    // The status is persisted before the hook runs and is kept if the hook fails.
    fn switch_status(&mut self, name: &str, status: AddonStatus) -> AddonResult<AddonInfo> {
        ensure_name(name)?;
        self.ensure_installed(name)?;

        let mut info = self.get_info(name)?;
        info.status = status;
        info.url = None;
        self.set_info(name, &info)?;
        debug!("[ADDON-STATUS] {} -> {:?}", name, status);

        if let Some(addon) = self.registry.resolve(&AppContext::new(&self.config, name)) {
            self.run_hook(name, addon.as_ref(), |addon, ctx| match status {
                AddonStatus::Enabled => addon.enable(ctx),
                AddonStatus::Disabled => addon.disable(ctx),
            })?;
        }

        Ok(info)
    }

    /// Verify an installed addon: entry point resolvable and descriptor valid.
    pub fn check(&self, name: &str) -> AddonResult<AddonInfo> {
        ensure_name(name)?;
        self.ensure_installed(name)?;

        let addon = self.resolve(name)?;
        let info = read_info(&self.addon_dir(name))
            .map_err(|_| AddonError::operation("The configuration file content is incorrect"))?;
        if !addon.check_info(name, &info) {
            return Err(AddonError::operation(
                "The configuration file content is incorrect",
            ));
        }
        Ok(info)
    }

    /// Build a distribution archive for a local addon.
    pub fn pack(&self, name: &str) -> AddonResult<PathBuf> {
        pack_addon(&self.config, name)
    }

    /// Installed addons with a readable descriptor, sorted by name.
    pub fn list(&self) -> AddonResult<Vec<AddonInfo>> {
        let root = self.config.addons_path();
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&root)
            .map_err(|e| AddonError::Operation(format!("Failed to read {:?}: {}", root, e)))?;
        let mut addons = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || !path.join(INFO_FILE).is_file() {
                continue;
            }
            match read_info(&path) {
                Ok(info) if !info.name.is_empty() => addons.push(info),
                Ok(_) => debug!("[ADDON-LIST] {:?} has no name", path),
                Err(e) => debug!("[ADDON-LIST] Skipping {:?}: {:#}", path, e),
            }
        }
        addons.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(addons)
    }

    // ------------------------------------------------------------------
    // Descriptor and config stores
    // ------------------------------------------------------------------

    pub fn get_info(&self, name: &str) -> AddonResult<AddonInfo> {
        ensure_name(name)?;
        Ok(read_info(&self.addon_dir(name))?)
    }

    pub fn set_info(&self, name: &str, info: &AddonInfo) -> AddonResult<()> {
        ensure_name(name)?;
        write_info(&self.addon_dir(name), info)
    }

    pub fn get_fullconfig(&self, name: &str) -> AddonResult<Vec<ConfigField>> {
        ensure_name(name)?;
        settings::get_fullconfig(&self.addon_dir(name))
    }

    pub fn set_fullconfig(&self, name: &str, fields: &[ConfigField]) -> AddonResult<()> {
        ensure_name(name)?;
        settings::set_fullconfig(&self.addon_dir(name), fields)
    }

    pub fn get_config(&self, name: &str) -> AddonResult<ConfigValues> {
        ensure_name(name)?;
        settings::get_config(&self.addon_dir(name))
    }

    pub fn set_config(&self, name: &str, values: &ConfigValues) -> AddonResult<()> {
        ensure_name(name)?;
        settings::set_config(&self.addon_dir(name), values)
    }

    pub fn has_config(&self, name: &str) -> bool {
        self.get_config(name)
            .map(|values| !values.is_empty())
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn ensure_installed(&self, name: &str) -> AddonResult<()> {
        if self.addon_dir(name).is_dir() {
            Ok(())
        } else {
            Err(AddonError::operation("Addon not exists"))
        }
    }

    fn resolve(&self, name: &str) -> AddonResult<Box<dyn Addon>> {
        self.registry
            .resolve(&AppContext::new(&self.config, name))
            .ok_or_else(|| AddonError::operation("The addon file does not exist"))
    }

    fn run_hook<F>(&mut self, name: &str, addon: &dyn Addon, hook: F) -> AddonResult<()>
    where
        F: FnOnce(&dyn Addon, &mut HookContext<'_>) -> anyhow::Result<()>,
    {
        let addon_dir = self.addon_dir(name);
        let mut ctx = HookContext {
            name,
            addon_dir: &addon_dir,
            db: self.db.as_mut(),
        };
        hook(addon, &mut ctx).map_err(|e| AddonError::Operation(format!("{:#}", e)))
    }

    /// Run `work` inside a database transaction, rolling back on error.
    fn transaction<T, F>(&mut self, work: F) -> AddonResult<T>
    where
        F: FnOnce(&mut Self) -> AddonResult<T>,
    {
        self.db.begin()?;
        match work(self) {
            Ok(value) => {
                self.db.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.db.rollback() {
                    warn!("[ADDON-DB] Rollback failed: {:#}", rollback);
                }
                Err(e)
            }
        }
    }

    /// Merge the addon's `static/` and `app/` trees into the host application.
    fn copy_overlays(&self, name: &str) -> AddonResult<()> {
        let addon_dir = self.addon_dir(name);

        let assets = addon_dir.join("static");
        if assets.is_dir() {
            copy_dirs(&assets, &self.config.public_static_path())?;
            debug!("[ADDON-OVERLAY] Copied static assets of {}", name);
        }

        let app = addon_dir.join("app");
        if app.is_dir() {
            copy_dirs(&app, &self.config.app_path())?;
            debug!("[ADDON-OVERLAY] Merged app overlay of {}", name);
        }

        Ok(())
    }

    /// Carry the previous config values into the new package's schema.
    fn restore_config(&self, name: &str, saved: &ConfigValues) -> AddonResult<()> {
        if saved.is_empty() {
            return Ok(());
        }
        if self.get_fullconfig(name)?.is_empty() {
            warn!("[ADDON-UPGRADE] New package of {} has no config schema; previous values dropped", name);
            return Ok(());
        }
        self.set_config(name, saved)
    }

    fn restore(&self, name: &str, backup: &BackupOutcome) {
        let addon_dir = self.addon_dir(name);
        match backup {
            BackupOutcome::Created(path) => {
                if let Err(e) = package::restore_backup(path, &addon_dir) {
                    warn!("[ADDON-UPGRADE] Restoring {} from {:?} failed: {:#}", name, path, e);
                }
            }
            BackupOutcome::Failed(_) => {
                warn!("[ADDON-UPGRADE] No backup of {}; directory left as extracted", name);
            }
        }
    }
}

/// Build `<build>/<name>-<version>.zip` from an addon in the configured layout.
///
/// Needs no database or registry, so packaging never touches the runtime tree
/// before the descriptor has been validated.
pub fn pack_addon(config: &ManagerConfig, name: &str) -> AddonResult<PathBuf> {
    ensure_name(name)?;
    package::pack(
        &config.addon_path(name),
        &config.public_static_path(),
        &config.build_path(),
    )
}

fn ensure_name(name: &str) -> AddonResult<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(AddonError::operation("Invalid parameters"))
    }
}

fn remove_temp_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!("[ADDON] Could not remove {:?}: {}", path, e);
    }
}

fn discard_dir(dir: &Path) {
    if let Err(e) = rmdirs(dir) {
        warn!("[ADDON] Could not remove {:?}: {:#}", dir, e);
    }
}

fn report_cleanup(what: &str, result: anyhow::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!("[ADDON-UNINSTALL] Removing {} failed: {:#}", what, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct NoSource;

    impl PackageSource for NoSource {
        fn get(&self, _url: &str, _query: &[(String, String)]) -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("offline")
        }
    }

    fn manager(root: &Path) -> AddonManager {
        AddonManager::new(
            ManagerConfig::with_root(root),
            AddonRegistry::permissive(),
            Box::new(NoSource),
            Box::new(SqliteDatabase::open_in_memory("").unwrap()),
        )
    }

    fn seed(root: &Path, name: &str, info: &str) {
        let dir = root.join("addons").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(INFO_FILE), info).unwrap();
    }

    #[test]
    fn test_rejects_unsafe_names() {
        let tmp = TempDir::new().unwrap();
        let mut manager = manager(tmp.path());

        for name in ["", "../etc", "my-addon", "a/b"] {
            let err = manager.enable(name).unwrap_err();
            assert_eq!(err.to_string(), "Invalid parameters");
        }
    }

    #[test]
    fn test_list_sorted_and_skips_invalid() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), "shop", "name = shop\ntitle = Shop\nversion = 1.0.0\n");
        seed(tmp.path(), "blog", "name = blog\ntitle = Blog\nversion = 2.0.0\nstatus = 1\n");
        seed(tmp.path(), "broken", "not an ini line\n");
        fs::create_dir_all(tmp.path().join("addons/empty")).unwrap();

        let names: Vec<String> = manager(tmp.path())
            .list()
            .unwrap()
            .into_iter()
            .map(|info| info.name)
            .collect();
        assert_eq!(names, vec!["blog", "shop"]);
    }

    #[test]
    fn test_list_without_addons_root() {
        let tmp = TempDir::new().unwrap();
        assert!(manager(tmp.path()).list().unwrap().is_empty());
    }

    #[test]
    fn test_check_reports_incorrect_descriptor() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), "shop", "name = store\ntitle = Shop\nversion = 1.0.0\n");
        let manager = manager(tmp.path());

        let err = manager.check("shop").unwrap_err();
        assert_eq!(err.to_string(), "The configuration file content is incorrect");
        assert_eq!(manager.check("blog").unwrap_err().to_string(), "Addon not exists");
    }

    #[test]
    fn test_pack_bad_version_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), "cms", "name = cms\ntitle = CMS\nversion = 1.0\n");
        let config = ManagerConfig::with_root(tmp.path());

        let err = pack_addon(&config, "cms").unwrap_err();

        assert_eq!(err.to_string(), "Addon info version incorrect");
        assert!(!tmp.path().join("runtime").exists());
    }

    #[test]
    fn test_pack_rejects_path_like_names() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), "cms", "name = cms\ntitle = CMS\nversion = 1.0.0\n");
        let config = ManagerConfig::with_root(tmp.path());

        for name in ["../cms", "addons/cms", ""] {
            let err = pack_addon(&config, name).unwrap_err();
            assert_eq!(err.to_string(), "Invalid parameters");
        }
        assert!(!tmp.path().join("runtime").exists());
    }

    #[test]
    fn test_pack_through_config_layout() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), "cms", "name = cms\ntitle = CMS\nversion = 1.0.0\n");

        let archive = manager(tmp.path()).pack("cms").unwrap();

        assert_eq!(archive, tmp.path().join("runtime/cms-1.0.0.zip"));
        assert!(archive.is_file());
    }
}
