use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::OperatorError;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Operator(OperatorError),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::Operator(err) => (operator_status(&err), err.to_string(), None),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
                Some(format!("{err:#}")),
            ),
        };

        (status, Json(ErrorResponse { error, details })).into_response()
    }
}

fn operator_status(err: &OperatorError) -> StatusCode {
    match err {
        OperatorError::RollbackUnsupported => StatusCode::NOT_IMPLEMENTED,
        OperatorError::StepNotFound(_) => StatusCode::NOT_FOUND,
        OperatorError::NotFailed(..) => StatusCode::CONFLICT,
        OperatorError::RunTerminated => StatusCode::CONFLICT,
        OperatorError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<OperatorError> for AppError {
    fn from(err: OperatorError) -> Self {
        AppError::Operator(err)
    }
}
