//! Mapping from sqlx errors onto the persistence taxonomy.

use ratekeeper_common::PersistenceError;
use serde::de::DeserializeOwned;

/// Classify a Postgres SQLSTATE.
pub fn classify_sqlstate(code: Option<&str>, message: &str) -> PersistenceError {
    let message = message.to_string();
    match code {
        // deadlock_detected, serialization_failure
        Some("40P01") | Some("40001") => PersistenceError::Deadlock(message),
        // query_canceled (statement_timeout), lock_not_available
        Some("57014") | Some("55P03") => PersistenceError::Timeout(message),
        Some(code) if code.starts_with("23") => PersistenceError::ConstraintViolation(message),
        Some(code) if code.starts_with("08") => PersistenceError::ConnectionFailed(message),
        _ => PersistenceError::TransactionFailed(message),
    }
}

/// Convert a sqlx error.
pub fn map_sqlx_error(e: sqlx::Error) -> PersistenceError {
    match e {
        sqlx::Error::Database(db) => classify_sqlstate(db.code().as_deref(), db.message()),
        sqlx::Error::PoolTimedOut => {
            PersistenceError::Timeout("timed out waiting for a pooled connection".to_string())
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => PersistenceError::ConnectionFailed(e.to_string()),
        other => PersistenceError::TransactionFailed(other.to_string()),
    }
}

/// Decode a snake_case text column into one of the engine's enums.
pub(crate) fn decode_enum<T: DeserializeOwned>(
    column: &str,
    text: String,
) -> Result<T, PersistenceError> {
    serde_json::from_value(serde_json::Value::String(text)).map_err(|e| {
        PersistenceError::TransactionFailed(format!("cannot decode column {}: {}", column, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratekeeper_fx::{EventType, RateMode, RateSource, StaleLevel};

    #[test]
    fn test_sqlstate_classification() {
        assert!(matches!(
            classify_sqlstate(Some("40P01"), "deadlock"),
            PersistenceError::Deadlock(_)
        ));
        assert!(matches!(
            classify_sqlstate(Some("23505"), "duplicate key"),
            PersistenceError::ConstraintViolation(_)
        ));
        assert!(matches!(
            classify_sqlstate(Some("57014"), "canceling statement"),
            PersistenceError::Timeout(_)
        ));
        assert!(matches!(
            classify_sqlstate(Some("08006"), "connection failure"),
            PersistenceError::ConnectionFailed(_)
        ));
        assert!(matches!(
            classify_sqlstate(Some("42P01"), "undefined table"),
            PersistenceError::TransactionFailed(_)
        ));
    }

    #[test]
    fn test_pool_errors_are_retryable() {
        assert!(map_sqlx_error(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(map_sqlx_error(sqlx::Error::PoolClosed).is_retryable());
        assert!(!map_sqlx_error(sqlx::Error::RowNotFound).is_retryable());
    }

    #[test]
    fn test_decode_enums_match_column_encoding() {
        for source in [RateSource::Api, RateSource::Manual, RateSource::Cache] {
            let decoded: RateSource = decode_enum("source", source.as_str().to_string()).unwrap();
            assert_eq!(decoded, source);
        }
        for event in [EventType::RateChange, EventType::Fallback, EventType::Switch] {
            let decoded: EventType = decode_enum("event_type", event.as_str().to_string()).unwrap();
            assert_eq!(decoded, event);
        }
        for level in [StaleLevel::Fresh, StaleLevel::Stale, StaleLevel::VeryStale] {
            let decoded: StaleLevel = decode_enum("stale_level", level.as_str().to_string()).unwrap();
            assert_eq!(decoded, level);
        }
        let mode: RateMode = decode_enum("mode", "manual".to_string()).unwrap();
        assert_eq!(mode, RateMode::Manual);

        assert!(decode_enum::<RateSource>("source", "feed".to_string()).is_err());
    }
}
