//! Error types for the data access layer.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// Result alias for data layer operations.
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors raised by the data access layer.
#[derive(Debug)]
pub enum DataError {
    /// A migration failed to apply. Fatal at startup.
    MigrationFailed {
        /// Zero-based index of the failed migration.
        index: usize,
        /// Underlying SQL error.
        source: sqlx::Error,
    },
    /// A database operation failed.
    QueryFailed {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying SQL error.
        source: sqlx::Error,
    },
    /// An insert hit an existing row with the same key.
    DuplicateKey,
    /// A persisted record could not be decoded.
    CorruptRecord {
        /// Description of the decode failure.
        detail: String,
    },
}

impl Display for DataError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::MigrationFailed { index, .. } => {
                write!(formatter, "migration {index} failed")
            }
            Self::QueryFailed { operation, .. } => {
                write!(formatter, "database operation failed: {operation}")
            }
            Self::DuplicateKey => formatter.write_str("duplicate key"),
            Self::CorruptRecord { detail } => {
                write!(formatter, "corrupt record: {detail}")
            }
        }
    }
}

impl Error for DataError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::MigrationFailed { source, .. } | Self::QueryFailed { source, .. } => Some(source),
            Self::DuplicateKey | Self::CorruptRecord { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_source() {
        let migration = DataError::MigrationFailed {
            index: 3,
            source: sqlx::Error::RowNotFound,
        };
        assert_eq!(migration.to_string(), "migration 3 failed");
        assert!(migration.source().is_some());

        let query = DataError::QueryFailed {
            operation: "insert torrent",
            source: sqlx::Error::RowNotFound,
        };
        assert!(query.to_string().contains("insert torrent"));

        assert!(DataError::DuplicateKey.source().is_none());
    }
}
