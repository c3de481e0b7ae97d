pub mod error;
pub mod signature;

pub use error::{Error, FromMessage, Result};
