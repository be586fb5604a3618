pub mod app;
pub mod clienv;
pub mod config;
pub mod credentials;
pub mod error;
pub mod release;
pub mod rpc;
pub mod scheduler;
pub mod status;
pub mod supervisor;

pub use app::{Environment, Runtime};
pub use error::{Error, Result};
