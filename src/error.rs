//! Error types for qgemm operations

use thiserror::Error;

/// Result type for qgemm operations
pub type Result<T> = std::result::Result<T, QgemmError>;

/// Errors that can occur while building or running the operator
///
/// Every variant except a conformance mismatch (which is reported as `false`,
/// not as an error) is fatal for the harness: it prints the message and exits
/// with [`QgemmError::exit_status`].
#[derive(Debug, Error)]
pub enum QgemmError {
    /// Operator shape or quantization parameters violate a precondition
    #[error("Invalid operator parameters: {0}")]
    InvalidParams(String),

    /// Graph construction rejected an operand
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// A device API call failed
    #[error("{api} API ERROR: {operation}: {message} (code: {code}), from file: {file}, line: {line}")]
    Backend {
        /// API family (`D3D12`, `wgpu`, `CUDA`, ...)
        api: &'static str,
        /// Failing call
        operation: &'static str,
        /// Driver or validation message
        message: String,
        /// Raw status code
        code: i32,
        /// Source file that issued the call
        file: &'static str,
        /// Source line that issued the call
        line: u32,
    },

    /// Requested backend does not exist on this machine or build
    #[error("Backend not available: {0}")]
    Unavailable(String),

    /// Harness configuration could not be loaded
    #[error("Config error: {0}")]
    Config(String),

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QgemmError {
    /// Backend failure tagged with the caller's source location
    #[track_caller]
    pub fn backend(
        api: &'static str,
        operation: &'static str,
        code: i32,
        message: impl Into<String>,
    ) -> Self {
        let location = std::panic::Location::caller();
        Self::Backend {
            api,
            operation,
            message: message.into(),
            code,
            file: location.file(),
            line: location.line(),
        }
    }

    /// CUDA driver failure tagged with the caller's source location
    #[track_caller]
    pub fn cuda(operation: &'static str, err: qgemm_cuda::DriverError) -> Self {
        let code = err.code();
        Self::backend("CUDA", operation, code, err.to_string())
    }

    /// Process exit status for this error
    ///
    /// Backend failures exit with their raw status code; everything else
    /// exits with 1.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Backend { code, .. } if *code != 0 => *code,
            _ => 1,
        }
    }

    /// [`exit_code`](Self::exit_code) as a process status
    ///
    /// Unix keeps only the low byte of a status; a code whose low byte is
    /// zero maps to 1 so a failure never reads as success.
    #[must_use]
    pub fn exit_status(&self) -> u8 {
        match self.exit_code().to_le_bytes()[0] {
            0 => 1,
            low => low,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_params_error() {
        let err = QgemmError::InvalidParams("block_size must divide K".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid operator parameters: block_size must divide K"
        );
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_backend_error_records_location() {
        let err = QgemmError::backend("D3D12", "CreateCommittedResource", -2147024882, "out of memory");
        match &err {
            QgemmError::Backend { file, line, .. } => {
                assert!(file.ends_with("error.rs"));
                assert!(*line > 0);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        let text = err.to_string();
        assert!(text.starts_with("D3D12 API ERROR: CreateCommittedResource"));
        assert!(text.contains("code: -2147024882"));
        assert!(text.contains("from file:"));
        assert_eq!(err.exit_code(), -2147024882);
    }

    #[test]
    fn test_cuda_error_keeps_driver_code() {
        let driver = qgemm_cuda::DriverError::Api {
            name: "CUDA_ERROR_INVALID_PTX".to_string(),
            code: 218,
        };
        let err = QgemmError::cuda("cuModuleLoadData", driver);
        assert_eq!(err.exit_code(), 218);
        assert!(err.to_string().contains("CUDA_ERROR_INVALID_PTX"));
    }

    #[test]
    fn test_zero_code_backend_error_exits_one() {
        let err = QgemmError::backend("wgpu", "map_async", 0, "mapping failed");
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_exit_status_is_never_success() {
        let err = QgemmError::backend("Emulated", "Dispatch", 0x8007_0100_u32 as i32, "device removed");
        assert_eq!(err.exit_status(), 1);

        let err = QgemmError::backend("Emulated", "Dispatch", 0x8000_4005_u32 as i32, "unspecified");
        assert_eq!(err.exit_status(), 0x05);

        let err = QgemmError::InvalidParams("M must be positive".to_string());
        assert_eq!(err.exit_status(), 1);
    }

    #[test]
    fn test_io_error_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.ptx");
        let err: QgemmError = io.into();
        assert!(err.to_string().contains("missing.ptx"));
    }
}
