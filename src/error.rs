use thiserror::Error;

/// Why a calibration run stopped before collecting its target sample count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CalibrationAbort {
    #[error("rubidium lock bad")]
    LockLost,
    #[error("PPS spike / loss detected (diff {diff})")]
    Spike { diff: i64 },
    #[error("PPS delta did not confirm zero after {polls} polls")]
    ZeroNotConfirmed { polls: u64 },
}

#[derive(Debug, Error)]
pub enum DisciplineError {
    /// Telemetry or command I/O failed. The transport owns any retry policy.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// A required telemetry field was missing or had the wrong kind.
    #[error("telemetry field `{field}` missing or malformed")]
    SchemaViolation { field: String },

    #[error("calibration failed: {0}")]
    CalibrationFailed(CalibrationAbort),

    #[error("rubidium lock not acquired after {polls} polls")]
    LockNotAcquired { polls: u64 },

    /// The shutdown flag dropped while a blocking step was in progress.
    #[error("interrupted by shutdown request")]
    Interrupted,
}

impl DisciplineError {
    pub fn schema(field: impl Into<String>) -> Self {
        DisciplineError::SchemaViolation { field: field.into() }
    }

    /// Only calibration aborts are retried by the control loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DisciplineError::CalibrationFailed(_))
    }
}

impl From<CalibrationAbort> for DisciplineError {
    fn from(abort: CalibrationAbort) -> Self {
        DisciplineError::CalibrationFailed(abort)
    }
}

pub type Result<T> = std::result::Result<T, DisciplineError>;
