pub mod config;
pub mod error;

pub use config::CtnConfig;
pub use error::{CtnError, CtnResult};
