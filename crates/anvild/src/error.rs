//! Error types for anvild.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors that can occur while bringing the server up. Nothing past
/// initialization is fatal: per-request failures are reported to clients
/// through the request records themselves.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to read settings file {path}: {message}")]
    SettingsRead { path: Utf8PathBuf, message: String },

    #[error("settings file {path} is missing required key `{key}`")]
    SettingsMissingKey { path: Utf8PathBuf, key: &'static str },

    #[error("invalid value for settings key `{key}`: {message}")]
    SettingsInvalidValue { key: &'static str, message: String },

    #[error("failed to create directory {path}: {message}")]
    CreateDir { path: Utf8PathBuf, message: String },

    #[error("failed to bind resource server port {port}: {message}")]
    Bind { port: u16, message: String },

    #[error("failed to watch {path}: {message}")]
    Watch { path: Utf8PathBuf, message: String },
}

/// Result type for server setup operations.
pub type Result<T> = std::result::Result<T, ServerError>;
