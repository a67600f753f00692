pub mod auth;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod health;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;

pub use server::{start, Gateway};

/// Crate version and the git revision it was built from
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_REVISION"));
