pub mod backend;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod paths;
pub mod server;
