pub mod billing;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod relay;
pub mod server;
pub mod store;
pub mod tags;
