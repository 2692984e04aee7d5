//! Plugin manifest loader.
//!
//! `manifest.json` in the working directory declares the plugin catalog
//! this deployment may run. It is read once at bootstrap to seed the
//! `Plugins` table.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::OsFamily;

/// One catalog entry from `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPlugin {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "OS")]
    pub os: OsFamily,
}

/// Errors raised while loading the manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("manifest {0} contains no plugins")]
    Empty(String),
}

/// Load and validate the plugin manifest.
///
/// A manifest with zero entries is an error: a controller with nothing
/// to control is a deployment mistake, surfaced at bootstrap.
pub fn load_manifest(path: &Path) -> Result<Vec<ManifestPlugin>, ManifestError> {
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: display.clone(),
        source,
    })?;
    let plugins: Vec<ManifestPlugin> =
        serde_json::from_str(&content).map_err(|source| ManifestError::Parse {
            path: display.clone(),
            source,
        })?;
    if plugins.is_empty() {
        return Err(ManifestError::Empty(display));
    }
    Ok(plugins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_manifest(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_entries() {
        let file = write_manifest(
            r#"[{"Name": "Harness", "OS": "all"}, {"Name": "Gopher", "OS": "nt"}]"#,
        );
        let plugins = load_manifest(file.path()).unwrap();
        assert_eq!(plugins.len(), 2);
        assert_eq!(plugins[0].name, "Harness");
        assert_eq!(plugins[0].os, OsFamily::All);
        assert_eq!(plugins[1].os, OsFamily::Nt);
    }

    #[test]
    fn empty_manifest_is_an_error() {
        let file = write_manifest("[]");
        let err = load_manifest(file.path()).unwrap_err();
        assert!(matches!(err, ManifestError::Empty(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_manifest(Path::new("/nonexistent/manifest.json")).unwrap_err();
        assert!(matches!(err, ManifestError::Io { .. }));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let file = write_manifest(r#"{"Name": "not-an-array"}"#);
        let err = load_manifest(file.path()).unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
    }
}
