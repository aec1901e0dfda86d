use thiserror::Error;

/// Numeric error codes carried in `ERROR` responses.
///
/// Grouped by hundreds: 0 success, 100–199 task, 200–299 resource,
/// 300–399 transport, 400–499 file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,

    TaskNotFound = 100,
    TaskScriptNotFound = 101,
    TaskInvalidState = 102,

    ResourceUnavailable = 200,
    ResourceInvalidSpec = 201,
    ResourceAllocationFailed = 202,

    IpcConnectionFailed = 300,
    IpcServerNotRunning = 301,
    IpcSendFailed = 302,
    IpcReceiveFailed = 303,
    IpcProtocolError = 304,

    FileNotFound = 400,
    FileParseError = 401,
    WorkdirNotFound = 402,
    FileWriteError = 403,
    FileReadError = 404,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Daemon-side failure surfaced to clients as an `ERROR` response.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
}

impl RequestError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Resource allocation failures surfaced by the monitor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// Not enough free, idle resources right now; retried next iteration.
    #[error("resources unavailable")]
    Unavailable,
    /// The request itself can never be satisfied (bad ids, counts over total).
    #[error("invalid resource request: {0}")]
    InvalidRequest(String),
}

/// Failures while starting a job process.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to spawn {script}: {source}")]
    Spawn {
        script: String,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_keep_their_wire_values() {
        assert_eq!(ErrorCode::TaskNotFound.as_i32(), 100);
        assert_eq!(ErrorCode::ResourceUnavailable.as_i32(), 200);
        assert_eq!(ErrorCode::IpcProtocolError.as_i32(), 304);
        assert_eq!(ErrorCode::WorkdirNotFound.as_i32(), 402);
    }

    #[test]
    fn alloc_error_display() {
        assert_eq!(AllocError::Unavailable.to_string(), "resources unavailable");
        assert_eq!(
            AllocError::InvalidRequest("ngpu 9 exceeds 8".into()).to_string(),
            "invalid resource request: ngpu 9 exceeds 8"
        );
    }
}
