pub mod error;

pub use error::{CoreError, FromMessage, Result};
