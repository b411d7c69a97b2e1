#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unreachable: {0}")]
    Connection(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("qdrant error: {0}")]
    Qdrant(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("invalid store operation: {0}")]
    Invalid(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Distinguishes "could not reach storage" from every other failure.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(err.to_string())
            }
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Database(format!("malformed stored value: {err}"))
    }
}

#[cfg(feature = "qdrant")]
impl From<qdrant_client::QdrantError> for StoreError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        if qdrant_unreachable(&err) {
            Self::Connection(format!("qdrant: {err}"))
        } else {
            Self::Qdrant(err.to_string())
        }
    }
}

/// gRPC `UNAVAILABLE` and `DEADLINE_EXCEEDED`.
#[cfg(feature = "qdrant")]
const UNREACHABLE_GRPC_CODES: [i32; 2] = [14, 4];

#[cfg(feature = "qdrant")]
fn qdrant_unreachable(err: &qdrant_client::QdrantError) -> bool {
    if let qdrant_client::QdrantError::ResponseError { status } = err
        && (UNREACHABLE_GRPC_CODES.contains(&(status.code() as i32))
            || std::error::Error::source(status).is_some_and(is_transport_failure))
    {
        return true;
    }
    is_transport_failure(err)
}

/// True when any error in the chain is a network-level I/O failure.
#[cfg_attr(not(any(feature = "qdrant", feature = "ollama")), allow(dead_code))]
pub(crate) fn is_transport_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    use std::io::ErrorKind;

    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && matches!(
                io.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::TimedOut
                    | ErrorKind::BrokenPipe
                    | ErrorKind::AddrNotAvailable
                    | ErrorKind::HostUnreachable
                    | ErrorKind::NetworkUnreachable
            )
        {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_failures_are_connectivity() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_connectivity());
        assert!(StoreError::from(sqlx::Error::PoolClosed).is_connectivity());
        assert!(StoreError::Timeout(std::time::Duration::from_secs(1)).is_connectivity());
    }

    #[derive(Debug, thiserror::Error)]
    #[error("request failed")]
    struct Wrapped(#[source] std::io::Error);

    #[test]
    fn refused_connection_in_chain_is_transport_failure() {
        let refused = Wrapped(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(is_transport_failure(&refused));
        let missing = Wrapped(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(!is_transport_failure(&missing));
    }

    #[test]
    fn row_errors_are_not_connectivity() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Database(_)));
        assert!(!err.is_connectivity());
        assert!(!StoreError::Cancelled.is_connectivity());
    }
}
