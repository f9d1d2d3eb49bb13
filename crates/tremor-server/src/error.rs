use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tremor_core::TremorError;

/// Carries an explicit 400 through the `anyhow::Error` chain.
#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    pub fn join(e: tokio::task::JoinError) -> Self {
        Self(anyhow::anyhow!("task join error: {e}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.0.downcast_ref::<BadRequestError>().is_some() {
            StatusCode::BAD_REQUEST
        } else if let Some(e) = self.0.downcast_ref::<TremorError>() {
            match e {
                TremorError::RunInProgress => StatusCode::CONFLICT,
                TremorError::NotInitialized | TremorError::InvalidConfig(_) => {
                    StatusCode::BAD_REQUEST
                }
                TremorError::CorruptRow { .. }
                | TremorError::Db(_)
                | TremorError::Acquisition(_)
                | TremorError::Extraction(_)
                | TremorError::Io(_)
                | TremorError::Csv(_)
                | TremorError::Yaml(_)
                | TremorError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            }
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_in_progress_maps_to_409() {
        let response = AppError(TremorError::RunInProgress.into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn not_initialized_maps_to_400() {
        let response = AppError(TremorError::NotInitialized.into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn invalid_config_maps_to_400() {
        let response =
            AppError(TremorError::InvalidConfig("primary_url is empty".into()).into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn io_error_maps_to_500() {
        let io_err = std::io::Error::other("disk full");
        let response = AppError(TremorError::Io(io_err).into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn corrupt_row_maps_to_500() {
        let err = TremorError::CorruptRow {
            row: 3,
            reason: "bad timestamp".into(),
        };
        let response = AppError(err.into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn bad_request_constructor_maps_to_400() {
        let response = AppError::bad_request("unknown range '90d'").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn non_tremor_error_maps_to_500() {
        let response = AppError(anyhow::anyhow!("something unexpected")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
