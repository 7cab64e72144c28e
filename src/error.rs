//! Error taxonomy for the supervision core

use serde::Serialize;

/// Stable error codes carried by error events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Configuration document failed to parse
    InvalidConfig,
    /// Unknown configuration id
    NotFound,
    /// A process is already tracked for the configuration
    AlreadyRunning,
    /// The proxy executable is missing or not executable
    BinaryUnavailable,
    /// The proxy process could not be launched
    SpawnFailure,
    /// The proxy process wrote to stderr or exited abnormally
    RuntimeFailure,
    /// Durable storage could not be written
    PersistenceFailure,
}

impl ErrorCode {
    /// Get the error code as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyRunning => "ALREADY_RUNNING",
            ErrorCode::BinaryUnavailable => "BINARY_UNAVAILABLE",
            ErrorCode::SpawnFailure => "SPAWN_FAILURE",
            ErrorCode::RuntimeFailure => "RUNTIME_FAILURE",
            ErrorCode::PersistenceFailure => "PERSISTENCE_FAILURE",
        }
    }

    /// Whether a failure of this kind concerns a single configuration and is
    /// therefore broadcast to observers as well as returned
    pub fn is_config_scoped(&self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidConfig | ErrorCode::SpawnFailure | ErrorCode::RuntimeFailure
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration not found: {0}")]
    NotFound(String),

    #[error("configuration '{0}' is already running")]
    AlreadyRunning(String),

    #[error("proxy binary unavailable: {0}")]
    BinaryUnavailable(String),

    #[error("failed to start proxy for '{id}': {source}")]
    SpawnFailure {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy for '{id}' failed: {message}")]
    RuntimeFailure { id: String, message: String },

    #[error("failed to persist configurations to {path}: {source}")]
    PersistenceFailure {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidConfig(_) => ErrorCode::InvalidConfig,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
            Error::BinaryUnavailable(_) => ErrorCode::BinaryUnavailable,
            Error::SpawnFailure { .. } => ErrorCode::SpawnFailure,
            Error::RuntimeFailure { .. } => ErrorCode::RuntimeFailure,
            Error::PersistenceFailure { .. } => ErrorCode::PersistenceFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::InvalidConfig("bad".into()).code(),
            ErrorCode::InvalidConfig
        );
        assert_eq!(Error::NotFound("x".into()).code(), ErrorCode::NotFound);
        assert_eq!(
            Error::AlreadyRunning("x".into()).code(),
            ErrorCode::AlreadyRunning
        );
        let spawn = Error::SpawnFailure {
            id: "x".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(spawn.code(), ErrorCode::SpawnFailure);
    }

    #[test]
    fn test_error_code_strings() {
        assert_eq!(ErrorCode::InvalidConfig.as_str(), "INVALID_CONFIG");
        assert_eq!(ErrorCode::BinaryUnavailable.as_str(), "BINARY_UNAVAILABLE");
        assert_eq!(
            serde_json::to_string(&ErrorCode::PersistenceFailure).unwrap(),
            "\"PERSISTENCE_FAILURE\""
        );
    }

    #[test]
    fn test_config_scoped_codes() {
        assert!(ErrorCode::InvalidConfig.is_config_scoped());
        assert!(ErrorCode::SpawnFailure.is_config_scoped());
        assert!(ErrorCode::RuntimeFailure.is_config_scoped());
        assert!(!ErrorCode::PersistenceFailure.is_config_scoped());
        assert!(!ErrorCode::NotFound.is_config_scoped());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::RuntimeFailure {
            id: "abc".into(),
            message: "exited with code 1".into(),
        };
        assert_eq!(err.to_string(), "proxy for 'abc' failed: exited with code 1");
        assert_eq!(
            Error::AlreadyRunning("abc".into()).to_string(),
            "configuration 'abc' is already running"
        );
    }
}
