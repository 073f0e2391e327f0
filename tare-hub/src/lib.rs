pub mod api;
pub mod config;
pub mod discovery;
pub mod feed;
pub mod registry;
pub mod session;
pub mod transport;
