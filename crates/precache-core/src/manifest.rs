use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;

/// Generation name shipped with the site's current asset set.
pub const DEFAULT_VERSION: &str = "ai-hub-v1";

/// Static assets every generation must hold before it can become current.
pub const DEFAULT_URLS: &[&str] = &[
    "/",
    "/css/critical.css",
    "/css/style.min.css",
    "/css/aihub.v8.patch.css",
    "/js/app.min.js",
    "/js/aihub.v8.enhance.js",
    "/assets/hero.webp",
    "/assets/lovescape.webp",
    "/assets/replika.webp",
    "/assets/crushon.webp",
    "/assets/janitorai.webp",
];

/// The precache manifest: an ordered list of URLs plus the generation name
/// they are stored under. Both are bumped together when assets change.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawManifest")]
pub struct PrecacheManifest {
    version: String,
    urls: Vec<String>,
}

#[derive(Deserialize)]
struct RawManifest {
    version: String,
    urls: Vec<String>,
}

impl TryFrom<RawManifest> for PrecacheManifest {
    type Error = Error;

    fn try_from(raw: RawManifest) -> Result<Self> {
        PrecacheManifest::new(raw.version, raw.urls)
    }
}

impl PrecacheManifest {
    pub fn new(version: impl Into<String>, urls: Vec<String>) -> Result<Self> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(Error::InvalidManifest("version must not be empty".into()));
        }

        let mut seen = HashSet::with_capacity(urls.len());
        for url in &urls {
            if url.is_empty() {
                return Err(Error::InvalidManifest("empty URL".into()));
            }
            if !seen.insert(url.as_str()) {
                return Err(Error::InvalidManifest(format!("duplicate URL {url}")));
            }
        }

        Ok(Self { version, urls })
    }

    /// Generation name for this manifest.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }
}

impl Default for PrecacheManifest {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            urls: DEFAULT_URLS.iter().map(|u| u.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_manifest_is_valid() {
        let m = PrecacheManifest::default();
        assert_eq!(m.version(), "ai-hub-v1");
        assert_eq!(m.urls().len(), 11);
        assert_eq!(m.urls()[0], "/");
        assert!(PrecacheManifest::new(m.version(), m.urls().to_vec()).is_ok());
    }

    #[test]
    fn rejects_duplicates_and_empty_version() {
        let dup = PrecacheManifest::new("v2", vec!["/".into(), "/".into()]);
        assert!(matches!(dup, Err(Error::InvalidManifest(_))));

        let empty = PrecacheManifest::new("  ", vec!["/".into()]);
        assert!(matches!(empty, Err(Error::InvalidManifest(_))));
    }

    #[test]
    fn deserialize_validates() {
        let ok: PrecacheManifest =
            serde_json::from_str(r#"{"version":"v2","urls":["/","/app.js"]}"#).unwrap();
        assert_eq!(ok.urls(), ["/".to_string(), "/app.js".to_string()]);

        let bad = serde_json::from_str::<PrecacheManifest>(r#"{"version":"v2","urls":["/","/"]}"#);
        assert!(bad.is_err());
    }
}
