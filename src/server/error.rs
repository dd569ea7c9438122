use axum::response::IntoResponse;
use hyper::StatusCode;
use thiserror::Error;

use crate::database;
use crate::metadata;
use crate::price;

#[derive(Debug, Error)]
pub enum Error {
    #[error("subscription not found")]
    SubscriptionNotFound,
    #[error("merchant binding not found")]
    MerchantNotFound,
    #[error("invalid hex value: {0}")]
    InvalidHex(String),
    #[error(transparent)]
    Database(#[from] database::Error),
    #[error(transparent)]
    Metadata(#[from] metadata::Error),
    #[error(transparent)]
    Price(#[from] price::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    fn to_status_code(&self) -> StatusCode {
        match self {
            Self::SubscriptionNotFound | Self::MerchantNotFound => StatusCode::NOT_FOUND,
            Self::InvalidHex(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status_code = self.to_status_code();
        (status_code, self.to_string()).into_response()
    }
}
