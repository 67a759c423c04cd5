pub type LedgerResult<T> = Result<T, LedgerError>;

/// Caller-facing error taxonomy for run and conflict operations.
///
/// Persistence and adapter failures travel as [`LedgerError::Storage`]; every
/// other variant is raised before the offending mutation happens. Creating a
/// conflict that is already open is not an error: it yields
/// `ConflictOutcome::Existing`.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("grounding violation: {0}")]
    GroundingViolation(String),
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unknown recommendation: {0}")]
    UnknownRecommendation(String),
    #[error("output bound exceeded: {0}")]
    OutputBoundExceeded(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl LedgerError {
    /// Stable machine-readable code, also used for run error entries.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::GroundingViolation(_) => "grounding_violation",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::InvalidState(_) => "invalid_state",
            Self::NotFound(_) => "not_found",
            Self::UnknownRecommendation(_) => "unknown_recommendation",
            Self::OutputBoundExceeded(_) => "output_bound_exceeded",
            Self::Storage(_) => "storage_error",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(value: serde_json::Error) -> Self {
        Self::Storage(anyhow::Error::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::LedgerError;

    #[test]
    fn codes_are_stable_snake_case() {
        assert_eq!(LedgerError::validation("x").code(), "validation_error");
        assert_eq!(
            LedgerError::invalid_state("run is completed").code(),
            "invalid_state"
        );
        assert_eq!(
            LedgerError::from(anyhow::anyhow!("disk full")).code(),
            "storage_error"
        );
    }

    #[test]
    fn storage_errors_display_transparently() {
        let err = LedgerError::from(anyhow::anyhow!("database is locked"));
        assert_eq!(err.to_string(), "database is locked");
    }
}
