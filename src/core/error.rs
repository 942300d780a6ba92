use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Run aborted: {0}")]
    RunAborted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AssemblyError {
    /// Errors that only affect the record being processed.
    ///
    /// These are caught at the record boundary, written to the run manifest,
    /// and the record is skipped. Everything else aborts the run.
    pub fn is_record_scoped(&self) -> bool {
        matches!(self, Self::Resolution(_) | Self::Merge(_))
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_record_scoped()
    }

    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resolution(_) => "resolution",
            Self::Merge(_) => "merge",
            Self::Persistence(_) => "persistence",
            Self::Migration(_) => "migration",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::Store(_) => "store",
            Self::RunAborted(_) => "run_aborted",
            Self::Config(_) => "config",
            Self::LockError(_) => "lock",
            Self::IoError(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, AssemblyError>;

impl<T> From<std::sync::PoisonError<T>> for AssemblyError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for AssemblyError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for AssemblyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
