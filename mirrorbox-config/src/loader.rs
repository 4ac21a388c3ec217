//! Config file discovery, parsing, env overrides, and validation.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::models::Config;

/// Default config file name, looked up in the working directory when no
/// explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "mirrorbox.toml";

/// Environment override for the local root.
pub const ENV_LOCAL_ROOT: &str = "MIRRORBOX_LOCAL_ROOT";

/// Environment override for the state directory.
pub const ENV_STATE_DIR: &str = "MIRRORBOX_STATE_DIR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config in {path}: {source}")]
    Invalid {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("local_root is not set; pass --config or set {ENV_LOCAL_ROOT}")]
    MissingLocalRoot,

    #[error("local_root does not exist or is not a directory: {0}")]
    BadLocalRoot(PathBuf),

    #[error("cannot create state_dir {path}: {source}")]
    BadStateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Load the configuration: `.env`, then the TOML file, then environment
/// overrides, then validation. `path = None` falls back to
/// `mirrorbox.toml` when present, or pure env/default configuration when
/// not.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    // A missing .env is fine; an unreadable one is not worth dying over.
    let _ = dotenvy::dotenv();

    let mut config = match path {
        Some(explicit) => parse_file(explicit)?,
        None => {
            let fallback = Path::new(DEFAULT_CONFIG_FILE);
            if fallback.exists() {
                parse_file(fallback)?
            } else {
                debug!("no config file, starting from env and defaults");
                env_only_config()?
            }
        }
    };

    if let Ok(root) = std::env::var(ENV_LOCAL_ROOT) {
        config.local_root = PathBuf::from(root);
    }
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        config.state_dir = PathBuf::from(dir);
    }

    validate(&config)?;
    Ok(config)
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Invalid {
        path: path.to_path_buf(),
        source,
    })
}

fn env_only_config() -> Result<Config, ConfigError> {
    let root = std::env::var(ENV_LOCAL_ROOT).map_err(|_| ConfigError::MissingLocalRoot)?;
    // Everything except local_root has a serde default; reuse them by
    // parsing a minimal document.
    let doc = format!("local_root = {:?}", root);
    toml::from_str(&doc).map_err(|source| ConfigError::Invalid {
        path: PathBuf::from("<env>"),
        source,
    })
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.local_root.as_os_str().is_empty() {
        return Err(ConfigError::MissingLocalRoot);
    }
    if !config.local_root.is_dir() {
        return Err(ConfigError::BadLocalRoot(config.local_root.clone()));
    }
    std::fs::create_dir_all(&config.state_dir).map_err(|source| ConfigError::BadStateDir {
        path: config.state_dir.clone(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorbox_core::HashAlgorithm;

    #[test]
    fn parses_full_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        std::fs::create_dir_all(&root).unwrap();
        let config_path = dir.path().join("mirrorbox.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
local_root = {root:?}
state_dir = {state:?}
checksum = "sha256"
log_filter = "mirrorbox=debug"

[drive]
credentials_dir = "creds"
client_secret = "secret.json"
"#,
                root = root,
                state = dir.path().join("state"),
            ),
        )
        .unwrap();

        let config = load(Some(&config_path)).unwrap();
        assert_eq!(config.local_root, root);
        assert_eq!(config.checksum, HashAlgorithm::Sha256);
        assert_eq!(config.log_filter, "mirrorbox=debug");
        assert_eq!(config.drive.credentials_dir, PathBuf::from("creds"));
        assert!(dir.path().join("state").is_dir());
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        std::fs::create_dir_all(&root).unwrap();
        let config_path = dir.path().join("mirrorbox.toml");
        std::fs::write(&config_path, format!("local_root = {root:?}")).unwrap();

        let config = load(Some(&config_path)).unwrap();
        assert_eq!(config.checksum, HashAlgorithm::Md5);
        assert_eq!(config.log_filter, "info");
        assert_eq!(
            config.drive.client_secret,
            PathBuf::from("client_secret.json")
        );
    }

    #[test]
    fn missing_file_and_bad_root_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));

        let config_path = dir.path().join("mirrorbox.toml");
        std::fs::write(&config_path, "local_root = \"/definitely/not/here\"").unwrap();
        let err = load(Some(&config_path)).unwrap_err();
        assert!(matches!(err, ConfigError::BadLocalRoot(_)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("mirrorbox.toml");
        std::fs::write(&config_path, "local_root = \"/tmp\"\nsurprise = 1").unwrap();
        let err = load(Some(&config_path)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
