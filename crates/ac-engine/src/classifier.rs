//! Delivery error classification.
//!
//! Pure mapping from a `DeliveryError` to `ErrorType`, deciding whether
//! the retry policy is consulted or the job is dead-lettered outright.

use tracing::warn;

use ac_common::{DeliveryError, ErrorType};

const TRANSIENT_STATUS: &[u16] = &[408, 429, 502, 503, 504];
const PERMANENT_STATUS: &[u16] = &[400, 401, 403, 404, 405, 422];

/// Classify a delivery error. Rules in order:
/// retryable status codes, permanent status codes, network failures,
/// then Unknown (retried conservatively, logged louder).
pub fn classify(error: &DeliveryError) -> ErrorType {
    if let Some(status) = error.status() {
        if TRANSIENT_STATUS.contains(&status) {
            return ErrorType::Transient;
        }
        if PERMANENT_STATUS.contains(&status) {
            return ErrorType::Permanent;
        }
        // 5xx not singled out above still reads as a server-side fault
        if (500..600).contains(&status) {
            return ErrorType::Transient;
        }
        warn!(status = status, "unrecognized HTTP status, classifying as unknown");
        return ErrorType::Unknown;
    }

    match error {
        DeliveryError::Timeout(_) | DeliveryError::Connect(_) | DeliveryError::Dns(_) => {
            ErrorType::Transient
        }
        // Fast-fail from the breaker: retry normally, no wasted calls
        DeliveryError::CircuitOpen { .. } => ErrorType::Transient,
        // Cancellation is retryable by a fresh submission
        DeliveryError::Cancelled => ErrorType::Transient,
        DeliveryError::Configuration(_) | DeliveryError::Unsupported(_) => ErrorType::Permanent,
        DeliveryError::Adapter(msg) => {
            warn!(error = %msg, "unclassified adapter error");
            ErrorType::Unknown
        }
        DeliveryError::Http { .. } => unreachable!("handled via status() above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> DeliveryError {
        DeliveryError::Http {
            status,
            message: "test".to_string(),
        }
    }

    #[test]
    fn test_transient_status_codes() {
        for status in [408, 429, 502, 503, 504] {
            assert_eq!(classify(&http(status)), ErrorType::Transient, "status {}", status);
        }
    }

    #[test]
    fn test_permanent_status_codes() {
        for status in [400, 401, 403, 404, 405, 422] {
            assert_eq!(classify(&http(status)), ErrorType::Permanent, "status {}", status);
        }
    }

    #[test]
    fn test_other_5xx_transient() {
        assert_eq!(classify(&http(500)), ErrorType::Transient);
        assert_eq!(classify(&http(599)), ErrorType::Transient);
    }

    #[test]
    fn test_odd_status_unknown() {
        assert_eq!(classify(&http(418)), ErrorType::Unknown);
        assert_eq!(classify(&http(302)), ErrorType::Unknown);
    }

    #[test]
    fn test_network_failures_transient() {
        assert_eq!(
            classify(&DeliveryError::Timeout("deadline".into())),
            ErrorType::Transient
        );
        assert_eq!(
            classify(&DeliveryError::Connect("refused".into())),
            ErrorType::Transient
        );
        assert_eq!(
            classify(&DeliveryError::Dns("no such host".into())),
            ErrorType::Transient
        );
    }

    #[test]
    fn test_circuit_open_and_cancelled_transient() {
        assert_eq!(
            classify(&DeliveryError::CircuitOpen {
                target: "slack".into()
            }),
            ErrorType::Transient
        );
        assert_eq!(classify(&DeliveryError::Cancelled), ErrorType::Transient);
    }

    #[test]
    fn test_configuration_permanent() {
        assert_eq!(
            classify(&DeliveryError::Configuration("missing endpoint".into())),
            ErrorType::Permanent
        );
        assert_eq!(
            classify(&DeliveryError::Unsupported("resolve")),
            ErrorType::Permanent
        );
    }

    #[test]
    fn test_adapter_error_unknown() {
        assert_eq!(
            classify(&DeliveryError::Adapter("weird".into())),
            ErrorType::Unknown
        );
    }
}
