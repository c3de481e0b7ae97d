//! Errors the protocol engine surfaces, mapped to `pusher:error` codes
//! (spec §6, §7), `pusher_internal:subscription_error` payloads (§4.3), or
//! HTTP 4xx/5xx JSON bodies (§4.10) by the call sites in `ws.rs`/`http_api.rs`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    /// A `pusher:subscribe` rejected for a reason other than auth (spec
    /// §4.3): malformed channel data, disabled channel variant, etc.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// Origin rejection or signature verification failure (spec §4.3,
    /// §4.5) — always surfaced as protocol error 4009.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unknown application: {0}")]
    UnknownApplication(String),

    #[error(transparent)]
    Config(#[from] revurb_config::Error),

    #[error(transparent)]
    PubSub(#[from] revurb_pubsub::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl revurb_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

revurb_common::impl_context!();
