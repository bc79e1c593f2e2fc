pub mod config;
pub mod engine;
pub mod errors;
pub mod server;
pub mod store;
pub mod stream;
