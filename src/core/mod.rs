pub mod async_result;
pub mod config;
pub mod error;
pub mod types;
