pub mod config;
pub mod error;
pub mod gate;
pub mod protocol;
pub mod sender;
pub mod server;

pub use error::{AppError, Result};
