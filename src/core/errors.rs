//! DSN-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, DsnError>;

/// Top-level error type for disk sentinel.
#[derive(Debug, Error)]
pub enum DsnError {
    #[error("[DSN-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[DSN-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[DSN-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[DSN-1101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[DSN-2001] filesystem stats failure for {path}: {details}")]
    FsStats { path: PathBuf, details: String },

    #[error("[DSN-2002] mount table parse failure: {details}")]
    MountParse { details: String },

    #[error("[DSN-2003] mount not found: {path}")]
    MountNotFound { path: PathBuf },

    #[error("[DSN-2004] open-handle enumeration unavailable: {details}")]
    Attribution { details: String },

    #[error("[DSN-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[DSN-3001] permission denied for {path}")]
    PermissionDenied { path: PathBuf },

    #[error("[DSN-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[DSN-3101] flag persistence failed for {mount}: {details}")]
    Persistence { mount: PathBuf, details: String },

    #[error("[DSN-3201] notification delivery failed via {sink}: {details}")]
    Delivery { sink: &'static str, details: String },

    #[error("[DSN-3301] another run holds the lock at {path}")]
    RunLocked { path: PathBuf },

    #[error("[DSN-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl DsnError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "DSN-1001",
            Self::MissingConfig { .. } => "DSN-1002",
            Self::ConfigParse { .. } => "DSN-1003",
            Self::UnsupportedPlatform { .. } => "DSN-1101",
            Self::FsStats { .. } => "DSN-2001",
            Self::MountParse { .. } => "DSN-2002",
            Self::MountNotFound { .. } => "DSN-2003",
            Self::Attribution { .. } => "DSN-2004",
            Self::Serialization { .. } => "DSN-2101",
            Self::PermissionDenied { .. } => "DSN-3001",
            Self::Io { .. } => "DSN-3002",
            Self::Persistence { .. } => "DSN-3101",
            Self::Delivery { .. } => "DSN-3201",
            Self::RunLocked { .. } => "DSN-3301",
            Self::Runtime { .. } => "DSN-3900",
        }
    }

    /// Configuration failures abort the run before any mount is sampled.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::MissingConfig { .. } | Self::ConfigParse { .. }
        )
    }

    /// Sampling failures skip one mount; the rest of the pass proceeds.
    #[must_use]
    pub const fn is_sample_error(&self) -> bool {
        matches!(
            self,
            Self::MountNotFound { .. }
                | Self::PermissionDenied { .. }
                | Self::FsStats { .. }
                | Self::MountParse { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for DsnError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for DsnError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<DsnError> {
        vec![
            DsnError::InvalidConfig {
                details: String::new(),
            },
            DsnError::MissingConfig {
                path: PathBuf::new(),
            },
            DsnError::ConfigParse {
                context: "",
                details: String::new(),
            },
            DsnError::UnsupportedPlatform {
                details: String::new(),
            },
            DsnError::FsStats {
                path: PathBuf::new(),
                details: String::new(),
            },
            DsnError::MountParse {
                details: String::new(),
            },
            DsnError::MountNotFound {
                path: PathBuf::new(),
            },
            DsnError::Attribution {
                details: String::new(),
            },
            DsnError::Serialization {
                context: "",
                details: String::new(),
            },
            DsnError::PermissionDenied {
                path: PathBuf::new(),
            },
            DsnError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            DsnError::Persistence {
                mount: PathBuf::new(),
                details: String::new(),
            },
            DsnError::Delivery {
                sink: "",
                details: String::new(),
            },
            DsnError::RunLocked {
                path: PathBuf::new(),
            },
            DsnError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(DsnError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn display_carries_code_prefix() {
        for err in all_variants() {
            let msg = err.to_string();
            assert!(
                msg.contains(err.code()),
                "display should contain {}: {msg}",
                err.code()
            );
        }
    }

    #[test]
    fn classification_matches_taxonomy() {
        let config_errors = all_variants()
            .into_iter()
            .filter(DsnError::is_config_error)
            .count();
        assert_eq!(config_errors, 3);

        assert!(
            DsnError::MountNotFound {
                path: PathBuf::from("/gone")
            }
            .is_sample_error()
        );
        assert!(
            DsnError::PermissionDenied {
                path: PathBuf::from("/root")
            }
            .is_sample_error()
        );
        assert!(
            !DsnError::Delivery {
                sink: "webhook",
                details: "timeout".to_string()
            }
            .is_sample_error()
        );
        assert!(
            !DsnError::Persistence {
                mount: PathBuf::from("/"),
                details: String::new()
            }
            .is_config_error()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = DsnError::io(
            "/tmp/flags/root.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "DSN-3002");
        assert!(err.to_string().contains("/tmp/flags/root.json"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: DsnError = json_err.into();
        assert_eq!(err.code(), "DSN-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: DsnError = toml_err.into();
        assert_eq!(err.code(), "DSN-1003");
        assert!(err.is_config_error());
    }
}
