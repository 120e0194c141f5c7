//! Package download from the remote addon registry.
//!
//! The registry answers a download request either with the archive bytes or
//! with a JSON envelope. An envelope carrying `data.url` points at the real
//! archive; any other envelope is a registry error (`msg`, `code`, `data`).

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::{AddonError, AddonResult};
use crate::package::temp_zip_path;

/// Something that can answer an HTTP-style GET.
pub trait PackageSource {
    /// Fetch `url` with `query` appended; returns the full response body.
    fn get(&self, url: &str, query: &[(String, String)]) -> Result<Vec<u8>>;
}

/// reqwest-backed source. The client is built on first use and reused.
pub struct HttpPackageSource {
    config: TransportConfig,
    client: OnceCell<Client>,
}

impl HttpPackageSource {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    fn build_client(&self) -> Result<Client> {
        let mut headers = HeaderMap::new();
        headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));

        Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .danger_accept_invalid_certs(self.config.accept_invalid_certs)
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")
    }

    fn client(&self) -> Result<&Client> {
        self.client.get_or_try_init(|| self.build_client())
    }
}

impl PackageSource for HttpPackageSource {
    fn get(&self, url: &str, query: &[(String, String)]) -> Result<Vec<u8>> {
        let mut request = self.client()?.get(url);
        if !query.is_empty() {
            request = request.query(query);
        }

        let mut response = request.send().context(format!("GET {} failed", url))?;
        debug!("[ADDON-DOWNLOAD] GET {} -> {}", url, response.status());
        if self.config.raise_for_status {
            response = response.error_for_status()?;
        }

        let body = response.bytes().context("Failed to read response body")?;
        Ok(body.to_vec())
    }
}

/// Download the package for `name` from `url` into `<temp_dir>/<name>.zip`.
///
/// `params` are merged over `{name}` as query parameters. Transport failures
/// become a generic "download failed" error; a JSON error envelope becomes
/// [`AddonError::Registry`] with its fields unchanged.
pub fn download(
    source: &dyn PackageSource,
    temp_dir: &Path,
    name: &str,
    url: &str,
    params: &BTreeMap<String, String>,
) -> AddonResult<PathBuf> {
    let mut query: BTreeMap<String, String> = BTreeMap::new();
    query.insert("name".to_string(), name.to_string());
    for (key, value) in params {
        query.insert(key.clone(), value.clone());
    }
    let query: Vec<(String, String)> = query.into_iter().collect();

    info!("[ADDON-DOWNLOAD] Fetching {} from {}", name, url);
    let mut content = fetch(source, url, &query)?;

    if content.first() == Some(&b'{') {
        let json: Value = serde_json::from_slice(&content).map_err(|e| {
            warn!("[ADDON-DOWNLOAD] Unreadable registry response for {}: {}", name, e);
            AddonError::operation("Invalid response from addon registry")
        })?;

        match redirect_url(&json) {
            Some(real_url) => {
                debug!("[ADDON-DOWNLOAD] Registry redirected {} to {}", name, real_url);
                content = fetch(source, &real_url, &[])?;
            }
            None => return Err(registry_error(json)),
        }
    }

    write_temp_package(temp_dir, name, &content)
}

fn fetch(source: &dyn PackageSource, url: &str, query: &[(String, String)]) -> AddonResult<Vec<u8>> {
    source.get(url, query).map_err(|e| {
        warn!("[ADDON-DOWNLOAD] {} failed: {:#}", url, e);
        AddonError::operation("Addon package download failed")
    })
}

fn redirect_url(json: &Value) -> Option<String> {
    json.get("data")?
        .get("url")?
        .as_str()
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

fn registry_error(mut json: Value) -> AddonError {
    let msg = match json.get("msg") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let code = match json.get("code") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_default(),
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        _ => 0,
    };
    let data = json.get_mut("data").map(Value::take).unwrap_or(Value::Null);
    AddonError::Registry { msg, code, data }
}

fn write_temp_package(temp_dir: &Path, name: &str, content: &[u8]) -> AddonResult<PathBuf> {
    let path = temp_zip_path(temp_dir, name);
    let no_permission = |e: std::io::Error| {
        warn!("[ADDON-DOWNLOAD] Cannot write {:?}: {}", path, e);
        AddonError::operation("No permission to write temporary files")
    };

    fs::create_dir_all(temp_dir).map_err(no_permission)?;
    let mut file = File::create(&path).map_err(no_permission)?;
    file.write_all(content).map_err(no_permission)?;
    file.sync_all().map_err(no_permission)?;

    info!("[ADDON-DOWNLOAD] Saved {} bytes to {:?}", content.len(), path);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Serves canned bodies by URL and records every request.
    struct CannedSource {
        bodies: Vec<(String, Vec<u8>)>,
        calls: RefCell<Vec<(String, Vec<(String, String)>)>>,
    }

    impl CannedSource {
        fn new(bodies: &[(&str, &[u8])]) -> Self {
            Self {
                bodies: bodies
                    .iter()
                    .map(|(url, body)| (url.to_string(), body.to_vec()))
                    .collect(),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl PackageSource for CannedSource {
        fn get(&self, url: &str, query: &[(String, String)]) -> Result<Vec<u8>> {
            self.calls.borrow_mut().push((url.to_string(), query.to_vec()));
            self.bodies
                .iter()
                .find(|(u, _)| u == url)
                .map(|(_, body)| body.clone())
                .ok_or_else(|| anyhow::anyhow!("connection reset"))
        }
    }

    #[test]
    fn test_http_client_built_once() {
        let source = HttpPackageSource::new(TransportConfig::default());
        let first: *const Client = source.client().unwrap();
        let second: *const Client = source.client().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_download_writes_raw_body() {
        let tmp = TempDir::new().unwrap();
        let source = CannedSource::new(&[("https://reg/download", &b"PK\x03\x04raw"[..])]);
        let mut params = BTreeMap::new();
        params.insert("version".to_string(), "1.2.0".to_string());

        let path = download(&source, tmp.path(), "cms", "https://reg/download", &params).unwrap();

        assert_eq!(path, tmp.path().join("cms.zip"));
        assert_eq!(fs::read(&path).unwrap(), &b"PK\x03\x04raw"[..]);
        let calls = source.calls.borrow();
        assert_eq!(
            calls[0].1,
            vec![
                ("name".to_string(), "cms".to_string()),
                ("version".to_string(), "1.2.0".to_string()),
            ]
        );
    }

    #[test]
    fn test_download_follows_json_pointer() {
        let tmp = TempDir::new().unwrap();
        let pointer = json!({"code": 1, "msg": "", "data": {"url": "https://cdn/cms.zip"}});
        let pointer = serde_json::to_vec(&pointer).unwrap();
        let source = CannedSource::new(&[
            ("https://reg/download", pointer.as_slice()),
            ("https://cdn/cms.zip", &b"second body"[..]),
        ]);

        let path = download(&source, tmp.path(), "cms", "https://reg/download", &BTreeMap::new())
            .unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second body");
        let calls = source.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, "https://cdn/cms.zip");
        assert!(calls[1].1.is_empty());
    }

    #[test]
    fn test_download_surfaces_registry_error() {
        let tmp = TempDir::new().unwrap();
        let envelope = json!({"code": -3, "msg": "Please login first", "data": {"login": true}});
        let envelope = serde_json::to_vec(&envelope).unwrap();
        let source = CannedSource::new(&[("https://reg/download", envelope.as_slice())]);

        let err = download(&source, tmp.path(), "cms", "https://reg/download", &BTreeMap::new())
            .unwrap_err();

        match err {
            AddonError::Registry { msg, code, data } => {
                assert_eq!(msg, "Please login first");
                assert_eq!(code, -3);
                assert_eq!(data, json!({"login": true}));
            }
            other => panic!("expected registry error, got {:?}", other),
        }
        assert!(!tmp.path().join("cms.zip").exists());
    }

    #[test]
    fn test_download_transport_failure() {
        let tmp = TempDir::new().unwrap();
        let source = CannedSource::new(&[]);

        let err = download(&source, tmp.path(), "cms", "https://reg/download", &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "Addon package download failed");
    }

    #[test]
    fn test_download_unwritable_temp_dir() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("runtime");
        fs::write(&blocker, "a file where a directory should be").unwrap();
        let source = CannedSource::new(&[("https://reg/download", &b"zip"[..])]);

        let err = download(&source, &blocker, "cms", "https://reg/download", &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "No permission to write temporary files");
    }
}
