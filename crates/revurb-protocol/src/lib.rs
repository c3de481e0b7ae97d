//! Wire types for the Pusher-compatible protocol Revurb speaks: the JSON
//! frame shape, the fixed set of `pusher:*`/`pusher_internal:*` events, the
//! protocol error codes, and the HTTP control-plane signing scheme.
//!
//! Nothing in this crate talks to a socket; it only decodes/encodes the
//! `{ event, channel?, data? }` envelope and the handful of payload shapes
//! nested inside `data`.

pub mod error_codes;
pub mod frames;

pub use frames::{ClientFrame, RawFrame, ServerFrame};
