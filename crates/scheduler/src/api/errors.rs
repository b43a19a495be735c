use core::error::Error;

use poem::http::StatusCode;

use crate::inventory::StoreError;
use crate::scheduling::SchedulingError;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
    #[display("Invalid TLS configuration: {message}")]
    TlsConfig { message: String },
}

impl Error for ApiError {}

/// HTTP status for inventory failures
pub(crate) fn store_status(error: &StoreError) -> StatusCode {
    match error {
        StoreError::UnknownNode { .. }
        | StoreError::StaleNode { .. }
        | StoreError::UnknownDevice { .. }
        | StoreError::UnknownReservation { .. } => StatusCode::NOT_FOUND,
        StoreError::CapacityExceeded { .. } => StatusCode::CONFLICT,
        StoreError::InvalidDevice { .. } => StatusCode::BAD_REQUEST,
    }
}

/// HTTP status for extender verbs that do not carry an `error` field
pub(crate) fn scheduling_status(error: &SchedulingError) -> StatusCode {
    match error {
        SchedulingError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        SchedulingError::RequestUnsatisfiable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SchedulingError::Oversubscribed { .. } => StatusCode::CONFLICT,
        SchedulingError::UnknownNode { .. } | SchedulingError::StaleNode { .. } => {
            StatusCode::NOT_FOUND
        }
        SchedulingError::BindFailed { .. } => StatusCode::BAD_GATEWAY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display_formatting() {
        let err = ApiError::ServerError {
            message: "address in use".to_string(),
        };
        assert_eq!(err.to_string(), "Server error: address in use");
    }

    #[test]
    fn capacity_conflicts_map_to_409() {
        let err = StoreError::CapacityExceeded {
            node: "n".to_string(),
            device: "d".to_string(),
        };
        assert_eq!(store_status(&err), StatusCode::CONFLICT);
        assert_eq!(
            scheduling_status(&SchedulingError::Oversubscribed {
                node: "n".to_string()
            }),
            StatusCode::CONFLICT
        );
    }
}
