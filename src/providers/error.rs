/// History-store error with retry classification.
///
/// The runtime uses [`HistoryError::is_retryable`] to decide whether to re-read
/// history and try again. `ConcurrentAppendConflict` is always retryable: it
/// only means another writer got there first.
///
/// # Example Usage
///
/// ```rust,no_run
/// use petflow::providers::HistoryError;
///
/// # fn example() -> Result<(), HistoryError> {
/// return Err(HistoryError::retryable("append_batch", "database is locked"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    InstanceNotFound {
        instance: String,
    },
    InstanceAlreadyExists {
        instance: String,
    },
    /// The append did not continue the log at its current length.
    ConcurrentAppendConflict {
        instance: String,
        expected: u64,
        attempted: u64,
    },
    Storage {
        /// Operation that failed (e.g. "append_batch", "read_all")
        operation: String,
        message: String,
        retryable: bool,
    },
}

impl HistoryError {
    /// Transient storage failure (busy database, interrupted IO).
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        HistoryError::Storage {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Storage failure that will not succeed on retry (corrupt data, bad config).
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        HistoryError::Storage {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            HistoryError::ConcurrentAppendConflict { .. } => true,
            HistoryError::Storage { retryable, .. } => *retryable,
            HistoryError::InstanceNotFound { .. } | HistoryError::InstanceAlreadyExists { .. } => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, HistoryError::ConcurrentAppendConflict { .. })
    }
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryError::InstanceNotFound { instance } => write!(f, "instance not found: {instance}"),
            HistoryError::InstanceAlreadyExists { instance } => write!(f, "instance already exists: {instance}"),
            HistoryError::ConcurrentAppendConflict {
                instance,
                expected,
                attempted,
            } => write!(
                f,
                "concurrent append conflict on {instance}: expected seq {expected}, attempted {attempted}"
            ),
            HistoryError::Storage { operation, message, .. } => write!(f, "{operation}: {message}"),
        }
    }
}

impl std::error::Error for HistoryError {}
