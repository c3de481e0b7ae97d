use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("pub/sub bus is shutting down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
