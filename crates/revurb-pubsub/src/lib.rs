//! The pub/sub bus interface the core fans events out over when running
//! with `scaling.enabled = true` (spec §4.7, §4.8, §6). In single-node
//! mode the core never constructs a [`Bus`] at all.

pub mod bus;
pub mod error;
pub mod message;
pub mod redis_bus;

pub use bus::Bus;
pub use error::{Error, Result};
pub use message::PubSubMessage;
pub use redis_bus::RedisBus;
