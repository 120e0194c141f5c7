use std::env;
use std::path::{Path, PathBuf};
use std::process;

use addondepot_core::manager::pack_addon;
use addondepot_core::{
    logging, AddonError, AddonManager, AddonRegistry, DownloadParams, ManagerConfig,
};

const DEFAULT_CONFIG_FILE: &str = "addondepot.toml";

const USAGE: &str = "Usage: addondepot [--config <file>] [--root <dir>] <command> [args]

Commands:
  pack <name>                       Build <build_dir>/<name>-<version>.zip
  list                              List installed addons
  install <name> <url> [key=value]  Download and install an addon
  upgrade <name> <url> [key=value]  Upgrade a disabled addon
  uninstall <name>                  Remove an addon
  enable <name>                     Enable an addon
  disable <name>                    Disable an addon";

fn main() -> anyhow::Result<()> {
    logging::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    let (options, command) = split_options(&args)?;
    let config = load_config(&options)?;

    if let Err(e) = run(config, &command) {
        match &e {
            AddonError::Registry { code, .. } => eprintln!("Error: {} (code {})", e, code),
            AddonError::Operation(_) => eprintln!("Error: {}", e),
        }
        process::exit(1);
    }

    Ok(())
}

#[derive(Default)]
struct Options {
    config: Option<PathBuf>,
    root: Option<PathBuf>,
}

fn split_options(args: &[String]) -> anyhow::Result<(Options, Vec<String>)> {
    let mut options = Options::default();
    let mut rest = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config needs a file"))?;
                options.config = Some(PathBuf::from(value));
            }
            "--root" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--root needs a directory"))?;
                options.root = Some(PathBuf::from(value));
            }
            _ => rest.push(arg.clone()),
        }
    }

    Ok((options, rest))
}

fn load_config(options: &Options) -> anyhow::Result<ManagerConfig> {
    let mut config = match &options.config {
        Some(path) => ManagerConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
            ManagerConfig::load(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => ManagerConfig::default(),
    };
    if let Some(root) = &options.root {
        config.root = root.clone();
    }
    Ok(config)
}

fn run(config: ManagerConfig, command: &[String]) -> Result<(), AddonError> {
    let arg = |index: usize| positional(command, index);

    // Packaging only reads the addon tree; no database is opened for it.
    if arg(0)? == "pack" {
        let path = pack_addon(&config, arg(1)?)?;
        println!("{}", pack_message(&path));
        return Ok(());
    }

    let mut manager = AddonManager::from_config(config, AddonRegistry::permissive())?;
    match arg(0)? {
        "list" => {
            for info in manager.list()? {
                let state = if info.status.is_enabled() { "enabled" } else { "disabled" };
                println!("{}\t{}\t{}\t{}", info.name, info.version, state, info.title);
            }
        }
        "install" => {
            let params = parse_params(command.get(3..).unwrap_or_default())?;
            let outcome = manager.install(arg(1)?, arg(2)?, &params)?;
            println!("Installed {} {}", outcome.info.name, outcome.info.version);
            report_sql(&outcome.sql);
        }
        "upgrade" => {
            let params = parse_params(command.get(3..).unwrap_or_default())?;
            let outcome = manager.upgrade(arg(1)?, arg(2)?, &params)?;
            println!("Upgraded {} to {}", outcome.info.name, outcome.info.version);
            if let Some(backup) = outcome.backup.path() {
                println!("Backup: {}", backup.display());
            }
            report_sql(&outcome.sql);
        }
        "uninstall" => {
            let name = arg(1)?;
            let outcome = manager.uninstall(name)?;
            println!("Uninstalled {}", name);
            if !(outcome.assets_removed && outcome.app_removed && outcome.directory_removed) {
                eprintln!("Some files could not be removed; see the log for details");
            }
        }
        "enable" => {
            let info = manager.enable(arg(1)?)?;
            println!("Enabled {}", info.name);
        }
        "disable" => {
            let info = manager.disable(arg(1)?)?;
            println!("Disabled {}", info.name);
        }
        other => {
            return Err(AddonError::Operation(format!("Unknown command: {}", other)));
        }
    }

    Ok(())
}

fn pack_message(path: &Path) -> String {
    format!("Package succeeded! File path: \n{}", path.display())
}

fn positional(command: &[String], index: usize) -> Result<&str, AddonError> {
    command
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| AddonError::operation("Invalid parameters"))
}

fn parse_params(pairs: &[String]) -> Result<DownloadParams, AddonError> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| AddonError::Operation(format!("Expected key=value, got {}", pair)))
        })
        .collect()
}

fn report_sql(report: &addondepot_core::SqlImportReport) {
    if !report.is_clean() {
        eprintln!(
            "{} SQL statement(s) failed; see the log for details",
            report.failed.len()
        );
    }
}
