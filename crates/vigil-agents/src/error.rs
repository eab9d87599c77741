use std::path::PathBuf;

use vigil_core::types::ProcessKind;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid agent request for {kind}: {message}")]
    InvalidRequest { kind: ProcessKind, message: String },
    #[error("failed to read env file {path}: {source}")]
    EnvFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed env file {path} at line {line}: {message}")]
    EnvFileParse {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::path::PathBuf;

    use vigil_core::types::ProcessKind;

    use super::AgentError;

    #[test]
    fn invalid_request_names_the_process_kind() {
        let err = AgentError::InvalidRequest {
            kind: ProcessKind::QaProcess,
            message: "spec id is required".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid agent request for qa-process: spec id is required"
        );
    }

    #[test]
    fn env_file_read_keeps_source() {
        let err = AgentError::EnvFileRead {
            path: PathBuf::from("/p/.vigil/.env"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("/p/.vigil/.env"));
        assert!(err.source().is_some());
    }

    #[test]
    fn env_file_parse_reports_line() {
        let err = AgentError::EnvFileParse {
            path: PathBuf::from(".env"),
            line: 3,
            message: "missing '='".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "malformed env file .env at line 3: missing '='"
        );
    }
}
