pub mod agent;
pub mod api;
pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod liveness;
pub mod server;
pub mod shutdown;
pub mod signing;
pub mod store;
