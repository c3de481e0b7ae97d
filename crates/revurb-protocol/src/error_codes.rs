//! Protocol error codes the core emits (spec §6/§8).

/// Application is over its `max_connections` quota.
pub const OVER_CAPACITY: u32 = 4004;
/// Origin not allowed, or channel/signin auth rejected.
pub const UNAUTHORIZED: u32 = 4009;
/// Generic error, including "server is shutting down".
pub const GENERIC: u32 = 4200;
/// Pong reply not received within the activity timeout.
pub const STALE_CONNECTION: u32 = 4201;
/// Message too large, or send-queue backpressure exceeded.
pub const MESSAGE_TOO_LARGE: u32 = 4301;
