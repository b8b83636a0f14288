pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod masking;
pub mod router;
pub mod server;
pub mod session;
pub mod verbose;
