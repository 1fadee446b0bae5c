pub mod breakpoints;
pub mod channel;
pub mod config;
pub mod error;
pub mod launch;
pub mod log;
pub mod mapping;
pub mod package;
pub mod protocol;
pub mod server;
pub mod session;

pub use server::start;
