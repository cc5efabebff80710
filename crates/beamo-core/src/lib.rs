pub mod error;
pub mod models;
pub mod services;

pub use error::{BeamoError, DaemonErrorKind, Result};
pub use services::system::BeamoSystem;
