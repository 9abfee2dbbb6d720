use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Ledger RPC error: {0}")]
    Rpc(String),

    #[error("ABI decode error: {0}")]
    Abi(String),

    #[error("Transaction confirmation error: {0}")]
    Confirmation(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Price data error: {0}")]
    PriceData(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Malformed ledger data. The offending log is skipped, not retried.
    pub fn is_decode(&self) -> bool {
        matches!(self, AppError::Abi(_))
    }
}

impl From<alloy::transports::TransportError> for AppError {
    fn from(e: alloy::transports::TransportError) -> Self {
        AppError::Rpc(e.to_string())
    }
}

impl From<alloy::sol_types::Error> for AppError {
    fn from(e: alloy::sol_types::Error) -> Self {
        AppError::Abi(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Rpc(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
