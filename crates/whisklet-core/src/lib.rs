pub mod env;
pub mod error;
pub mod manifest;
pub mod registry;
pub mod sandbox;

pub use error::{HostError, Result};
