//! Error types and result definitions for bulk operations.
//!
//! Provides a classified error system with captured diagnostic metadata. The
//! [`BulkError`] type carries an [`ErrorKind`], a static description, optional
//! dynamic detail, and the original provider error (when there is one) so callers
//! can pattern-match on transport failures such as timeouts or constraint
//! violations.

use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Convenient result type for bulk operations using [`BulkError`] as the error type.
pub type BulkResult<T> = Result<T, BulkError>;

/// Specific categories of errors that can occur during bulk operations.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The destination table has no primary key and no explicit condition was supplied.
    MissingKey,
    /// A projection or condition expression cannot be statically rendered to SQL.
    UnsupportedExpression,

    // Transport errors.
    ConnectionFailed,
    QueryFailed,
    ConstraintViolation,
    OperationCanceled,

    // Data & mapping errors.
    ConversionError,
    SchemaError,

    // Configuration & state errors.
    ConfigError,
    InvalidState,
    IoError,

    Unknown,
}

/// Main error type for bulk operations.
#[derive(Debug, Clone)]
pub struct BulkError {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
}

impl BulkError {
    /// Creates a [`BulkError`] from its components.
    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        BulkError {
            kind,
            description,
            detail,
            source,
            location: Location::caller(),
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the detailed error information if available.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Attaches an originating [`error::Error`] to this error and returns the modified instance.
    ///
    /// The stored source is preserved across clones and exposed via [`error::Error::source`].
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for BulkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "[{:?}] {} @ {}:{}:{}",
            self.kind,
            self.description,
            self.location.file(),
            self.location.line(),
            self.location.column()
        )?;

        if let Some(detail) = self.detail.as_deref() {
            write!(f, "\n  Detail: {detail}")?;
        }

        Ok(())
    }
}

impl error::Error for BulkError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| source as &(dyn error::Error + 'static))
    }
}

/// Creates a [`BulkError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for BulkError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> BulkError {
        BulkError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`BulkError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for BulkError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> BulkError {
        BulkError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Converts [`std::io::Error`] to [`BulkError`] with [`ErrorKind::IoError`].
impl From<std::io::Error> for BulkError {
    #[track_caller]
    fn from(err: std::io::Error) -> BulkError {
        let detail = err.to_string();
        let source = Arc::new(err);
        BulkError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}

/// Converts [`tokio_postgres::Error`] to [`BulkError`] with the appropriate error kind.
///
/// Maps errors based on Postgres SQLSTATE codes to provide granular error classification,
/// while preserving the original provider error as the source so callers can still
/// distinguish e.g. a timeout from a constraint violation.
impl From<tokio_postgres::Error> for BulkError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> BulkError {
        let (kind, description) = match err.code() {
            Some(sqlstate) => {
                use tokio_postgres::error::SqlState;

                match *sqlstate {
                    // Connection errors (08xxx)
                    SqlState::CONNECTION_EXCEPTION
                    | SqlState::CONNECTION_DOES_NOT_EXIST
                    | SqlState::CONNECTION_FAILURE
                    | SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
                    | SqlState::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION => {
                        (ErrorKind::ConnectionFailed, "PostgreSQL connection failed")
                    }

                    // Data integrity violations (23xxx)
                    SqlState::INTEGRITY_CONSTRAINT_VIOLATION
                    | SqlState::NOT_NULL_VIOLATION
                    | SqlState::FOREIGN_KEY_VIOLATION
                    | SqlState::UNIQUE_VIOLATION
                    | SqlState::CHECK_VIOLATION => (
                        ErrorKind::ConstraintViolation,
                        "PostgreSQL constraint violation",
                    ),

                    // Data conversion errors (22xxx)
                    SqlState::DATA_EXCEPTION
                    | SqlState::INVALID_TEXT_REPRESENTATION
                    | SqlState::INVALID_DATETIME_FORMAT
                    | SqlState::NUMERIC_VALUE_OUT_OF_RANGE
                    | SqlState::DIVISION_BY_ZERO => (
                        ErrorKind::ConversionError,
                        "PostgreSQL data conversion failed",
                    ),

                    // Schema/object not found errors (42xxx)
                    SqlState::UNDEFINED_TABLE
                    | SqlState::UNDEFINED_COLUMN
                    | SqlState::UNDEFINED_FUNCTION
                    | SqlState::UNDEFINED_SCHEMA => (
                        ErrorKind::SchemaError,
                        "PostgreSQL schema object not found",
                    ),

                    // Syntax and access errors (42xxx)
                    SqlState::SYNTAX_ERROR
                    | SqlState::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION
                    | SqlState::INSUFFICIENT_PRIVILEGE => {
                        (ErrorKind::QueryFailed, "PostgreSQL syntax or access error")
                    }

                    // Operator intervention errors (57xxx), including statement_timeout.
                    SqlState::QUERY_CANCELED | SqlState::OPERATOR_INTERVENTION => (
                        ErrorKind::OperationCanceled,
                        "PostgreSQL operation canceled",
                    ),

                    // Transaction errors (40xxx, 25xxx)
                    SqlState::TRANSACTION_ROLLBACK
                    | SqlState::T_R_SERIALIZATION_FAILURE
                    | SqlState::T_R_DEADLOCK_DETECTED
                    | SqlState::INVALID_TRANSACTION_STATE
                    | SqlState::ACTIVE_SQL_TRANSACTION
                    | SqlState::NO_ACTIVE_SQL_TRANSACTION
                    | SqlState::IN_FAILED_SQL_TRANSACTION => {
                        (ErrorKind::InvalidState, "PostgreSQL transaction failed")
                    }

                    // Default for other SQL states
                    _ => (ErrorKind::QueryFailed, "PostgreSQL error"),
                }
            }
            // No SQL state means connection issue
            None => (ErrorKind::ConnectionFailed, "PostgreSQL connection failed"),
        };

        let detail = err.to_string();
        let source = Arc::new(err);
        BulkError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}

/// Converts [`bulksync_postgres::types::DescriptorError`] to [`BulkError`] with
/// [`ErrorKind::SchemaError`].
impl From<bulksync_postgres::types::DescriptorError> for BulkError {
    #[track_caller]
    fn from(err: bulksync_postgres::types::DescriptorError) -> BulkError {
        let detail = err.to_string();
        let source = Arc::new(err);
        BulkError::from_components(
            ErrorKind::SchemaError,
            Cow::Borrowed("Table descriptor lookup failed"),
            Some(Cow::Owned(detail)),
            Some(source),
        )
    }
}
