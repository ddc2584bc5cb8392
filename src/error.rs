use crate::batch::BatchError;
use crate::fit::FitError;
use crate::io::layout::LayoutError;
use crate::io::store::StoreError;
use crate::study::StudyError;

/// Error surfaced by the binary: a message and the process exit code.
///
/// Exit codes:
/// - 2: invalid configuration or arguments
/// - 3: files (I/O, unreadable or foreign artifacts, locked study)
/// - 4: computation
/// - 5: the batch was aborted
#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

impl From<FitError> for AppError {
    fn from(e: FitError) -> Self {
        AppError::new(4, e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::new(3, e.to_string())
    }
}

impl From<LayoutError> for AppError {
    fn from(e: LayoutError) -> Self {
        AppError::new(2, e.to_string())
    }
}

impl From<StudyError> for AppError {
    fn from(e: StudyError) -> Self {
        let code = match &e {
            StudyError::UnresolvedField { .. } | StudyError::Layout(_) => 2,
            StudyError::Store(_) | StudyError::NotFound(_) | StudyError::Locked(_) => 3,
        };
        AppError::new(code, e.to_string())
    }
}

impl From<BatchError> for AppError {
    fn from(e: BatchError) -> Self {
        let code = match &e {
            BatchError::PoolAbort { .. } => 5,
            BatchError::ThreadPool(_) => 4,
        };
        AppError::new(code, e.to_string())
    }
}
