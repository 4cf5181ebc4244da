use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ethereum_consensus::primitives::Slot;
use thiserror::Error;

/// JSON error envelope returned by every failing endpoint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    MalformedRequest(String),
    #[error("{0}")]
    Validation(String),
    #[error("no winning bid for slot {0}")]
    NoWinningBid(Slot),
    #[error("{0}")]
    StateConflict(String),
    #[error("builder callback failed: {0}")]
    Upstream(String),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Beacon(#[from] crate::beacon::Error),
    #[error(transparent)]
    Consensus(#[from] ethereum_consensus::Error),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let code = match self {
            Self::MalformedRequest(..) | Self::Validation(..) | Self::Upstream(..) => {
                StatusCode::BAD_REQUEST
            }
            Self::NoWinningBid(..) => return StatusCode::NO_CONTENT.into_response(),
            Self::StateConflict(..) => StatusCode::CONFLICT,
            Self::Store(..) | Self::Beacon(..) | Self::Consensus(..) | Self::Internal(..) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (code, Json(ErrorMessage { code: code.as_u16(), message })).into_response()
    }
}
