//! AddonDepot Core Library
//!
//! Lifecycle manager for application addons: packaged extensions distributed as
//! zip archives from a remote registry and installed into a host application's
//! directory tree.
//!
//! # Architecture
//!
//! [`AddonManager`] owns every dependency it needs. The remote registry sits
//! behind [`PackageSource`], the host database behind [`Database`], and addon
//! code behind [`Addon`] entry points resolved through an [`AddonRegistry`].
//! The `addondepot` binary wires them to reqwest and SQLite.
//!
//! # Modules
//!
//! ## Lifecycle (`manager` module)
//! - `install()` - Download, extract, verify, run SQL and activate
//! - `upgrade()` - Back up, replace files, carry config over, rerun SQL
//! - `uninstall()` - Run the hook, remove overlays and the addon directory
//! - `enable()` / `disable()` - Flip the persisted status and run the hook
//! - `check()` / `list()` / `pack()`
//!
//! ## Addon Data (`info`, `settings` modules)
//! - `AddonInfo` - INI descriptor (`info.ini`)
//! - `ConfigField` - Config schema entry (`config.json`)
//!
//! ## Plumbing
//! - `transport` - Registry download with JSON pointer / error envelopes
//! - `package` - Extraction, backup archives, distribution packing
//! - `database` - `install.sql` replay with prefix substitution
//! - `fsutil` - Directory merge / mirror removal / writability probe

pub mod addon;
pub mod config;
pub mod database;
pub mod error;
pub mod fsutil;
pub mod info;
pub mod logging;
pub mod manager;
pub mod package;
pub mod settings;
pub mod transport;

pub use addon::{Addon, AddonRegistry, AppContext, HookContext, PassiveAddon};
pub use config::ManagerConfig;
pub use database::{Database, SqlImportReport, SqliteDatabase};
pub use error::{AddonError, AddonResult};
pub use info::{AddonInfo, AddonStatus};
pub use manager::{
    pack_addon, AddonManager, DownloadParams, InstallOutcome, UninstallOutcome, UpgradeOutcome,
};
pub use package::BackupOutcome;
pub use settings::{ConfigField, ConfigValues};
pub use transport::{HttpPackageSource, PackageSource};
