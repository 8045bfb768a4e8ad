//! Inbound HTTP data path

pub mod server;

pub use server::{router, serve, GatewayState};
