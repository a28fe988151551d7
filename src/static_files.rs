//! Static content serving for routes carrying a static-content descriptor.

use crate::config::StaticCacheConfig;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Descriptor attached to a static route: requests under the route's
/// pattern are mapped onto files below `source`.
#[derive(Debug, Clone)]
pub struct StaticMount {
    pub source: PathBuf,
    /// File names tried, in order, when the request resolves to a directory.
    pub defaults: Vec<String>,
    pub cache: StaticCacheConfig,
}

impl StaticMount {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            defaults: vec!["index.html".to_string()],
            cache: StaticCacheConfig::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: Vec<String>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_cache(mut self, cache: StaticCacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Map a URL sub-path onto a file below the mount, refusing traversal.
    fn map_path(&self, url_path: &str) -> Option<PathBuf> {
        let clean = url_path.trim_start_matches('/');
        let mut pb = self.source.clone();
        for comp in Path::new(clean).components() {
            match comp {
                Component::Normal(s) => pb.push(s),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(pb)
    }

    /// Load the file for a request path.
    ///
    /// Directory hits fall through to the configured default files. Returns
    /// the content plus its content type.
    pub fn load(&self, url_path: &str) -> io::Result<(Vec<u8>, &'static str)> {
        let path = self
            .map_path(url_path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "invalid path"))?;

        let path = if path.is_dir() {
            self.defaults
                .iter()
                .map(|d| path.join(d))
                .find(|p| p.is_file())
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no default file"))?
        } else {
            path
        };

        if !path.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        }
        let bytes = fs::read(&path)?;
        Ok((bytes, content_type(&path)))
    }

    /// The `Cache-Control` header value for responses from this mount.
    pub fn cache_control(&self) -> Option<String> {
        self.cache
            .enable
            .then(|| format!("max-age={}", self.cache.max_age))
    }
}

fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_lowercase()
        .as_str()
    {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}
