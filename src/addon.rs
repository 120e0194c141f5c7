//! Addon entry points and the registry that resolves them.
//!
//! An addon's code is a value implementing [`Addon`]. Every lifecycle hook has
//! a no-op default, so an addon only overrides the phases it cares about.
//! The [`AddonRegistry`] maps addon names to factories and is owned by the
//! manager; nothing here is process-global.

use anyhow::Result;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::ManagerConfig;
use crate::database::Database;
use crate::info::AddonInfo;

/// Application handle passed to addon factories.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub name: String,
    pub addon_dir: PathBuf,
    pub root: PathBuf,
    pub public_static_dir: PathBuf,
    pub app_dir: PathBuf,
}

impl AppContext {
    pub fn new(config: &ManagerConfig, name: &str) -> Self {
        Self {
            name: name.to_string(),
            addon_dir: config.addon_path(name),
            root: config.root.clone(),
            public_static_dir: config.public_static_path(),
            app_dir: config.app_path(),
        }
    }
}

/// What a hook gets to work with while it runs.
pub struct HookContext<'a> {
    pub name: &'a str,
    pub addon_dir: &'a Path,
    pub db: &'a mut dyn Database,
}

/// Lifecycle callbacks supplied by an addon.
pub trait Addon {
    fn install(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn uninstall(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn enable(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn disable(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Runs against the newly extracted code. `previous` is the descriptor
    /// as it was before the upgrade.
    fn upgrade(&self, _ctx: &mut HookContext<'_>, _previous: &AddonInfo) -> Result<()> {
        Ok(())
    }

    /// Descriptor integrity check used after extraction.
    fn check_info(&self, name: &str, info: &AddonInfo) -> bool {
        info.name == name && !info.title.is_empty() && !info.version.is_empty()
    }
}

/// Entry point for addons that ship no code of their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassiveAddon;

impl Addon for PassiveAddon {}

pub type AddonFactory = Box<dyn Fn(&AppContext) -> Box<dyn Addon> + Send + Sync>;

/// Name to entry-point factory map.
pub struct AddonRegistry {
    factories: HashMap<String, AddonFactory>,
    permissive: bool,
}

impl Default for AddonRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AddonRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("AddonRegistry")
            .field("addons", &names)
            .field("permissive", &self.permissive)
            .finish()
    }
}

impl AddonRegistry {
    /// Only registered names resolve.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            permissive: false,
        }
    }

    /// Unregistered names resolve to [`PassiveAddon`].
    pub fn permissive() -> Self {
        Self {
            factories: HashMap::new(),
            permissive: true,
        }
    }

    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&AppContext) -> Box<dyn Addon> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
        self
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Construct the entry point for `ctx.name`, or `None` if it cannot be resolved.
    pub fn resolve(&self, ctx: &AppContext) -> Option<Box<dyn Addon>> {
        match self.factories.get(&ctx.name) {
            Some(factory) => Some(factory(ctx)),
            None if self.permissive => Some(Box::new(PassiveAddon)),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteDatabase;

    struct Counter;

    impl Addon for Counter {
        fn install(&self, ctx: &mut HookContext<'_>) -> Result<()> {
            ctx.db.execute("CREATE TABLE installed (name TEXT);")
        }
    }

    fn context(name: &str) -> AppContext {
        AppContext::new(&ManagerConfig::with_root("/srv"), name)
    }

    #[test]
    fn test_strict_registry_resolves_registered_only() {
        let mut registry = AddonRegistry::new();
        registry.register("cms", |_| Box::new(Counter));

        assert!(registry.resolve(&context("cms")).is_some());
        assert!(registry.resolve(&context("blog")).is_none());
        assert!(registry.is_registered("cms"));
    }

    #[test]
    fn test_permissive_registry_falls_back() {
        let registry = AddonRegistry::permissive();
        let addon = registry.resolve(&context("blog")).unwrap();

        let mut db = SqliteDatabase::open_in_memory("").unwrap();
        let mut ctx = HookContext {
            name: "blog",
            addon_dir: Path::new("/srv/addons/blog"),
            db: &mut db,
        };
        addon.install(&mut ctx).unwrap();
        addon.upgrade(&mut ctx, &AddonInfo::default()).unwrap();
    }

    #[test]
    fn test_default_check_info() {
        let addon = PassiveAddon;
        assert!(addon.check_info("cms", &AddonInfo::new("cms", "CMS", "1.0.0")));
        assert!(!addon.check_info("cms", &AddonInfo::new("blog", "CMS", "1.0.0")));
        assert!(!addon.check_info("cms", &AddonInfo::new("cms", "", "1.0.0")));
    }

    #[test]
    fn test_hook_gets_database() {
        let mut registry = AddonRegistry::new();
        registry.register("cms", |_| Box::new(Counter));
        let addon = registry.resolve(&context("cms")).unwrap();

        let mut db = SqliteDatabase::open_in_memory("").unwrap();
        let mut ctx = HookContext {
            name: "cms",
            addon_dir: Path::new("/srv/addons/cms"),
            db: &mut db,
        };
        addon.install(&mut ctx).unwrap();

        let tables: i64 = db
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'installed'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[test]
    fn test_app_context_paths() {
        let ctx = context("cms");
        assert_eq!(ctx.addon_dir, PathBuf::from("/srv/addons/cms"));
        assert_eq!(ctx.public_static_dir, PathBuf::from("/srv/public/static"));
    }
}
