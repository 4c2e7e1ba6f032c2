pub mod address;
pub mod error;
pub mod protocol;
pub mod records;
pub mod size;
pub mod time_service;

pub use address::*;
pub use error::*;
pub use protocol::*;
pub use records::*;
pub use size::*;
pub use time_service::*;

/// Version reported by `/ping` and `/status`.
pub const ARBOR_VERSION: &str = env!("CARGO_PKG_VERSION");
