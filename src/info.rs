//! Addon descriptor (`info.ini`).
//!
//! The descriptor is a flat `key = value` file with optional `[section]`
//! blocks. `name`, `title`, `version` and `status` are typed; every other key
//! is carried through untouched so rewriting a descriptor never loses metadata.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::{AddonError, AddonResult};

/// Descriptor file name inside an addon directory.
pub const INFO_FILE: &str = "info.ini";

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^[a-z]+$").expect("valid regex"));
static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("valid regex"));

/// Addon names are plain letters; they double as directory names.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// `MAJOR.MINOR.PATCH`, digits only.
pub fn is_valid_version(version: &str) -> bool {
    VERSION_RE.is_match(version)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddonStatus {
    #[default]
    Disabled,
    Enabled,
}

impl AddonStatus {
    pub fn from_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "false" | "off" | "no" => AddonStatus::Disabled,
            _ => AddonStatus::Enabled,
        }
    }

    pub fn as_value(&self) -> &'static str {
        match self {
            AddonStatus::Disabled => "0",
            AddonStatus::Enabled => "1",
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, AddonStatus::Enabled)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IniSection {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonInfo {
    pub name: String,
    pub title: String,
    pub version: String,
    pub status: AddonStatus,
    /// Download URL recorded by the installer. Dropped on enable/disable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Remaining top-level keys in file order.
    pub extra: Vec<(String, String)>,
    pub sections: Vec<IniSection>,
}

impl AddonInfo {
    pub fn new(name: &str, title: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            version: version.to_string(),
            ..Self::default()
        }
    }

    /// Parse descriptor text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut info = AddonInfo::default();
        let mut section: Option<IniSection> = None;

        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                if let Some(done) = section.take() {
                    info.sections.push(done);
                }
                section = Some(IniSection {
                    name: line[1..line.len() - 1].trim().to_string(),
                    entries: Vec::new(),
                });
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                bail!("Invalid descriptor line {}: {}", index + 1, line);
            };
            let key = key.trim().to_string();
            let value = unquote(value.trim()).to_string();
            if key.is_empty() {
                bail!("Empty key on descriptor line {}", index + 1);
            }

            match section.as_mut() {
                Some(section) => section.entries.push((key, value)),
                None => info.set_field(key, value),
            }
        }

        if let Some(done) = section.take() {
            info.sections.push(done);
        }

        Ok(info)
    }

    fn set_field(&mut self, key: String, value: String) {
        match key.as_str() {
            "name" => self.name = value,
            "title" => self.title = value,
            "version" => self.version = value,
            "status" => self.status = AddonStatus::from_value(&value),
            "url" => self.url = Some(value),
            _ => match self.extra.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => self.extra.push((key, value)),
            },
        }
    }

    /// Look up a top-level metadata key that has no typed field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Render as descriptor text.
    pub fn to_ini(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "name = {}", self.name);
        let _ = writeln!(out, "title = {}", self.title);
        let _ = writeln!(out, "version = {}", self.version);
        let _ = writeln!(out, "status = {}", self.status.as_value());
        if let Some(url) = &self.url {
            let _ = writeln!(out, "url = {}", url);
        }
        for (key, value) in &self.extra {
            let _ = writeln!(out, "{} = {}", key, value);
        }
        for section in &self.sections {
            let _ = writeln!(out, "[{}]", section.name);
            for (key, value) in &section.entries {
                let _ = writeln!(out, "{} = {}", key, value);
            }
        }
        out
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Read `info.ini` from an addon directory.
pub fn read_info(addon_dir: &Path) -> Result<AddonInfo> {
    let path = addon_dir.join(INFO_FILE);
    let content =
        fs::read_to_string(&path).context(format!("Failed to read descriptor: {:?}", path))?;
    AddonInfo::parse(&content).context(format!("Malformed descriptor: {:?}", path))
}

/// Persist `info.ini`. Name, title and version are required.
pub fn write_info(addon_dir: &Path, info: &AddonInfo) -> AddonResult<()> {
    if info.name.is_empty() || info.title.is_empty() || info.version.is_empty() {
        return Err(AddonError::operation("Addon info write failed"));
    }
    let path = addon_dir.join(INFO_FILE);
    fs::write(&path, info.to_ini())
        .map_err(|e| AddonError::Operation(format!("No write permission: {:?}: {}", path, e)))
}
