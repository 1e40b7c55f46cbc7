use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("not a member")]
    NotMember,
    #[error("room not found")]
    NotFound,
    #[error("room is full")]
    RoomFull,
    #[error("unable to allocate room code")]
    CodeAllocation,
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("delivery failed: {0}")]
    Delivery(String),
}
