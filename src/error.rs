//! Error types for the cluster OLM operator

use std::fmt;

use thiserror::Error;

/// Errors that can occur while rendering, building or syncing controllers
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// YAML decoding or encoding failed
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// JSON decoding or encoding failed
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error on {path}: {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid operator or cluster configuration (bad semver, bad TLS profile, ...)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A rendered manifest could not be decoded or classified
    #[error("Manifest {file}: {message}")]
    ManifestError { file: String, message: String },

    /// The chart could not be rendered
    #[error("Render error: {0}")]
    RenderError(String),

    /// A deployment or manifest hook refused to transform its input
    #[error("Hook {hook} failed: {message}")]
    HookError { hook: String, message: String },

    /// A construction-time invariant was violated
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// Extension metadata could not be read or interpreted
    #[error("Extension metadata error: {0}")]
    ExtensionMetadata(String),

    /// The sync was cancelled between cluster API calls
    #[error("Sync cancelled")]
    Cancelled,

    /// Several independent failures collected in one pass
    #[error("{0}")]
    Aggregate(ErrorList),
}

/// Result type for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A list of errors rendered as a single `; `-joined message
#[derive(Debug)]
pub struct ErrorList(pub Vec<Error>);

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl Error {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Error::IoError {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn manifest(file: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ManifestError {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn hook(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Error::HookError {
            hook: hook.into(),
            message: message.into(),
        }
    }

    /// Check if this error is worth retrying without any configuration change
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) | Error::IoError { .. } => true,
            Error::Aggregate(list) => list.0.iter().any(Error::is_retriable),
            _ => false,
        }
    }

    /// Check if this is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this is a 409 conflict from the API server
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409)
    }
}

/// Join collected errors into one, or `None` when nothing failed
pub fn join_errors(mut errors: Vec<Error>) -> Option<Error> {
    match errors.len() {
        0 => None,
        1 => errors.pop(),
        _ => Some(Error::Aggregate(ErrorList(errors))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_errors_empty_is_none() {
        assert!(join_errors(vec![]).is_none());
    }

    #[test]
    fn test_join_errors_single_is_unwrapped() {
        let err = join_errors(vec![Error::ConfigError("bad".to_string())]).unwrap();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_join_errors_joins_messages() {
        let err = join_errors(vec![
            Error::manifest("01-a.yaml", "missing kind"),
            Error::manifest("02-b.yaml", "missing name"),
        ])
        .unwrap();
        assert_eq!(
            err.to_string(),
            "Manifest 01-a.yaml: missing kind; Manifest 02-b.yaml: missing name"
        );
    }

    #[test]
    fn test_retriable_errors() {
        assert!(!Error::ConfigError("x".to_string()).is_retriable());
        assert!(!Error::Precondition("x".to_string()).is_retriable());
        let io = Error::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        );
        assert!(io.is_retriable());
        assert!(Error::Aggregate(ErrorList(vec![io])).is_retriable());
    }
}
