//! Configuration loading.
//!
//! Optional TOML file resolved from a short search path. Every field has a
//! default, so running with no file at all is the common case.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const PROJECT_FILE: &str = ".pty-warden.toml";
const USER_FILE: &str = "config.toml";
const USER_DIR: &str = "pty-warden";
const SOCKET_FILE: &str = "pty-warden.sock";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WardenConfig {
    /// Where the supervisor socket lives. Defaults to the runtime dir.
    pub socket_path: Option<PathBuf>,
    /// Tracing filter used when `-v` flags are absent.
    pub log_filter: Option<String>,
}

impl WardenConfig {
    /// Loads config from the first file found on the search path, falling
    /// back to defaults when none exists.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a file exists but cannot be read or
    /// parsed.
    pub fn load() -> Result<Self, ConfigError> {
        for path in search_paths() {
            if path.is_file() {
                debug!(path = %path.display(), "loading config");
                return Self::load_from(&path);
            }
        }
        debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    /// Loads config from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The socket path to use, preferring an explicit override.
    #[must_use]
    pub fn resolve_socket_path(&self, override_path: Option<&Path>) -> PathBuf {
        if let Some(path) = override_path {
            return path.to_path_buf();
        }
        if let Some(path) = &self.socket_path {
            return path.clone();
        }
        default_socket_path()
    }
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(PROJECT_FILE));
    }
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join(USER_DIR).join(USER_FILE));
    }
    paths
}

/// Default socket location: the user runtime dir when available, else the
/// cache dir, else the system temp dir.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(SOCKET_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_file_is_a_read_error() {
        let err = WardenConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn parses_all_fields() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "socket_path = \"/run/user/1000/warden.sock\"").unwrap();
        writeln!(file, "log_filter = \"debug\"").unwrap();

        let config = WardenConfig::load_from(file.path()).unwrap();
        assert_eq!(
            config.socket_path.as_deref(),
            Some(Path::new("/run/user/1000/warden.sock"))
        );
        assert_eq!(config.log_filter.as_deref(), Some("debug"));
    }

    #[test]
    fn empty_file_yields_defaults() {
        let file = NamedTempFile::new().unwrap();
        let config = WardenConfig::load_from(file.path()).unwrap();
        assert_eq!(config, WardenConfig::default());
    }

    #[test]
    fn unknown_field_is_a_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sokket_path = \"/tmp/x.sock\"").unwrap();

        let err = WardenConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn override_beats_config_beats_default() {
        let config = WardenConfig {
            socket_path: Some(PathBuf::from("/tmp/from-config.sock")),
            log_filter: None,
        };
        assert_eq!(
            config.resolve_socket_path(Some(Path::new("/tmp/override.sock"))),
            PathBuf::from("/tmp/override.sock")
        );
        assert_eq!(
            config.resolve_socket_path(None),
            PathBuf::from("/tmp/from-config.sock")
        );
        assert!(WardenConfig::default()
            .resolve_socket_path(None)
            .ends_with("pty-warden.sock"));
    }
}
