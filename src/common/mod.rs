//! Common types
//!
//! - Address: upstream target representation
//! - Destination: connection context for routing
//! - Error: unified error types

mod address;
mod destination;

pub use address::Address;
pub use destination::Destination;

// Re-export error types from crate root
pub use crate::error::{Error, Result};
