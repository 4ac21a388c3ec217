use std::path::PathBuf;

use mirrorbox_core::HashAlgorithm;
use serde::Deserialize;

/// Top-level daemon configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local directory mirroring the drive root.
    pub local_root: PathBuf,
    /// Working directory for manifests, the change queue, and crash logs.
    /// Defaults to the current directory.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub drive: DriveConfig,
    /// Content hash used for change classification. MD5 matches the hash
    /// the drive reports, so local and remote checksums stay comparable.
    #[serde(default)]
    pub checksum: HashAlgorithm,
    /// Default tracing filter, overridable with `RUST_LOG`.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

/// Collaborator-owned auth artifact locations.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriveConfig {
    /// Directory the credential helper keeps its cached tokens in.
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: PathBuf,
    /// OAuth client secret file; read by the credential helper, not by the
    /// engine.
    #[serde(default = "default_client_secret")]
    pub client_secret: PathBuf,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            credentials_dir: default_credentials_dir(),
            client_secret: default_client_secret(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_credentials_dir() -> PathBuf {
    PathBuf::from("google_drive_credentials")
}

fn default_client_secret() -> PathBuf {
    PathBuf::from("client_secret.json")
}

fn default_log_filter() -> String {
    "info".to_string()
}
