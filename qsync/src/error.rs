use std::error;
use std::fmt;

/// Result type used across the checker, with [`SyncError`] as error.
pub type SyncResult<T> = Result<T, SyncError>;

/// Error type of the checker.
///
/// A [`SyncError`] is either a single error, carrying an [`ErrorKind`], a static
/// description and optionally a dynamic detail, or an aggregate of several errors. The
/// aggregate form is used when releasing a lock or pause fails after another error was
/// already raised, so that neither failure is lost.
#[derive(Debug, Clone)]
pub struct SyncError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    Many(Vec<SyncError>),
}

/// Categories of failures.
///
/// Every kind returned from the driver is fatal for the run. Per-table conditions that
/// only skip a table are not errors, see [`crate::sync::SyncOutcome`].
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connection errors
    ConnectionFailed,
    AuthenticationError,
    TlsError,

    // Query & execution errors
    QueryFailed,
    SchemaError,
    InvalidState,
    /// A table lock or relay pause was held longer than allowed, or the lock itself
    /// could not be granted in time.
    LockTimeout,

    // Queue errors
    NodeNotFound,
    ConsumerNotFound,
    TickerUnresponsive,
    /// An administrative queue function answered with an error return code.
    CommandFailed,

    // Data errors
    ConversionError,
    InvalidData,

    // Run errors
    ConfigError,
    IoError,
    Cancelled,

    Unknown,
}

impl SyncError {
    /// Creates a [`SyncError`] aggregating several errors.
    pub fn many(errors: Vec<SyncError>) -> SyncError {
        SyncError {
            repr: ErrorRepr::Many(errors),
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, the kind of the first error is returned.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::Many(ref errors) => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s contained in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => vec![kind],
            ErrorRepr::Many(ref errors) => errors
                .iter()
                .flat_map(|err| err.kinds())
                .collect::<Vec<_>>(),
        }
    }

    /// Returns the first available detail.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail) => Some(detail.as_str()),
            ErrorRepr::Many(ref errors) => errors.iter().find_map(|e| e.detail()),
            _ => None,
        }
    }
}

impl PartialEq for SyncError {
    fn eq(&self, other: &SyncError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::WithDescription(kind_a, _), ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::Many(errors_a), ErrorRepr::Many(errors_b)) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)?;
                f.write_str(" -> ")?;
                detail.fmt(f)
            }
            ErrorRepr::Many(ref errors) => {
                if errors.is_empty() {
                    write!(f, "Multiple errors occurred (empty)")?;
                } else if errors.len() == 1 {
                    errors[0].fmt(f)?;
                } else {
                    write!(f, "Multiple errors occurred ({} total):", errors.len())?;
                    for (i, error) in errors.iter().enumerate() {
                        write!(f, "\n  {}: {}", i + 1, error)?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl error::Error for SyncError {}

impl From<(ErrorKind, &'static str)> for SyncError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> SyncError {
        SyncError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for SyncError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> SyncError {
        SyncError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl<E> From<Vec<E>> for SyncError
where
    E: Into<SyncError>,
{
    fn from(errors: Vec<E>) -> SyncError {
        SyncError {
            repr: ErrorRepr::Many(errors.into_iter().map(Into::into).collect()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> SyncError {
        SyncError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::IoError,
                "I/O error occurred",
                err.to_string(),
            ),
        }
    }
}

impl From<std::num::ParseIntError> for SyncError {
    fn from(err: std::num::ParseIntError) -> SyncError {
        SyncError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::ConversionError,
                "Integer parsing failed",
                err.to_string(),
            ),
        }
    }
}

impl From<std::num::ParseFloatError> for SyncError {
    fn from(err: std::num::ParseFloatError) -> SyncError {
        SyncError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::ConversionError,
                "Float parsing failed",
                err.to_string(),
            ),
        }
    }
}

/// Table attributes are stored URL-encoded; a malformed string makes the catalog unusable.
impl From<serde_urlencoded::de::Error> for SyncError {
    fn from(err: serde_urlencoded::de::Error) -> SyncError {
        SyncError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::InvalidData,
                "Table attributes decoding failed",
                err.to_string(),
            ),
        }
    }
}

impl From<rustls::Error> for SyncError {
    fn from(err: rustls::Error) -> SyncError {
        SyncError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::TlsError,
                "TLS configuration failed",
                err.to_string(),
            ),
        }
    }
}

/// Converts [`tokio_postgres::Error`] by SQLSTATE class.
///
/// `QUERY_CANCELED` is what Postgres raises when the local `statement_timeout` of the
/// lock session fires, so it maps to [`ErrorKind::LockTimeout`].
impl From<tokio_postgres::Error> for SyncError {
    fn from(err: tokio_postgres::Error) -> SyncError {
        let (kind, description) = match err.code() {
            Some(sqlstate) => {
                use tokio_postgres::error::SqlState;

                match *sqlstate {
                    SqlState::CONNECTION_EXCEPTION
                    | SqlState::CONNECTION_DOES_NOT_EXIST
                    | SqlState::CONNECTION_FAILURE
                    | SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
                    | SqlState::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION
                    | SqlState::TOO_MANY_CONNECTIONS
                    | SqlState::IDLE_SESSION_TIMEOUT => (
                        ErrorKind::ConnectionFailed,
                        "PostgreSQL connection error",
                    ),

                    SqlState::INVALID_AUTHORIZATION_SPECIFICATION | SqlState::INVALID_PASSWORD => (
                        ErrorKind::AuthenticationError,
                        "PostgreSQL authentication failed",
                    ),

                    SqlState::DATA_EXCEPTION
                    | SqlState::INVALID_TEXT_REPRESENTATION
                    | SqlState::INVALID_DATETIME_FORMAT
                    | SqlState::NUMERIC_VALUE_OUT_OF_RANGE => (
                        ErrorKind::ConversionError,
                        "PostgreSQL data conversion error",
                    ),

                    // A missing pgq/londiste function means the node is not set up.
                    SqlState::UNDEFINED_TABLE
                    | SqlState::UNDEFINED_COLUMN
                    | SqlState::UNDEFINED_FUNCTION
                    | SqlState::UNDEFINED_SCHEMA => (
                        ErrorKind::SchemaError,
                        "PostgreSQL schema object not found",
                    ),

                    SqlState::QUERY_CANCELED | SqlState::LOCK_NOT_AVAILABLE => (
                        ErrorKind::LockTimeout,
                        "PostgreSQL lock not granted in time",
                    ),

                    SqlState::T_R_SERIALIZATION_FAILURE
                    | SqlState::T_R_DEADLOCK_DETECTED
                    | SqlState::ACTIVE_SQL_TRANSACTION
                    | SqlState::NO_ACTIVE_SQL_TRANSACTION
                    | SqlState::IN_FAILED_SQL_TRANSACTION
                    | SqlState::IDLE_IN_TRANSACTION_SESSION_TIMEOUT => (
                        ErrorKind::InvalidState,
                        "PostgreSQL transaction state error",
                    ),

                    SqlState::ADMIN_SHUTDOWN
                    | SqlState::CRASH_SHUTDOWN
                    | SqlState::CANNOT_CONNECT_NOW => (
                        ErrorKind::ConnectionFailed,
                        "PostgreSQL server unavailable",
                    ),

                    _ => (ErrorKind::QueryFailed, "PostgreSQL query failed"),
                }
            }
            // No SQL state means a connection or protocol issue.
            None => (
                ErrorKind::ConnectionFailed,
                "PostgreSQL connection failed",
            ),
        };

        SyncError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, sync_error};

    #[test]
    fn test_simple_error_creation() {
        let err = SyncError::from((ErrorKind::ConsumerNotFound, "No such consumer"));
        assert_eq!(err.kind(), ErrorKind::ConsumerNotFound);
        assert_eq!(err.detail(), None);
        assert_eq!(err.kinds(), vec![ErrorKind::ConsumerNotFound]);
    }

    #[test]
    fn test_error_with_detail() {
        let err = sync_error!(
            ErrorKind::TickerUnresponsive,
            "Ticker seems dead",
            "no new tick on queue 'q1' after 10s"
        );
        assert_eq!(err.kind(), ErrorKind::TickerUnresponsive);
        assert_eq!(err.detail(), Some("no new tick on queue 'q1' after 10s"));
        assert_eq!(
            err.to_string(),
            "TickerUnresponsive: Ticker seems dead -> no new tick on queue 'q1' after 10s"
        );
    }

    #[test]
    fn test_many_errors_keep_all_kinds() {
        let err = SyncError::many(vec![
            sync_error!(ErrorKind::LockTimeout, "Consumer lagging too much"),
            sync_error!(ErrorKind::ConnectionFailed, "Release failed", "broken pipe"),
        ]);

        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::LockTimeout, ErrorKind::ConnectionFailed]
        );
        assert_eq!(err.detail(), Some("broken pipe"));
        assert!(err.to_string().starts_with("Multiple errors occurred (2 total):"));
    }

    #[test]
    fn test_single_aggregated_error_displays_directly() {
        let err = SyncError::many(vec![sync_error!(ErrorKind::Cancelled, "Run cancelled")]);
        assert_eq!(err.to_string(), "Cancelled: Run cancelled");
        assert_eq!(SyncError::many(vec![]).kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_bail_returns_early() {
        fn check(flag: bool) -> SyncResult<u32> {
            if flag {
                bail!(ErrorKind::NodeNotFound, "Unknown node", "queue 'q1'");
            }
            Ok(1)
        }

        assert_eq!(check(false).unwrap(), 1);
        assert_eq!(check(true).unwrap_err().kind(), ErrorKind::NodeNotFound);
    }

    #[test]
    fn test_io_and_parse_conversions() {
        let io_err: SyncError = std::io::Error::other("disk gone").into();
        assert_eq!(io_err.kind(), ErrorKind::IoError);

        let parse_err: SyncError = "x".parse::<i64>().unwrap_err().into();
        assert_eq!(parse_err.kind(), ErrorKind::ConversionError);
    }
}
