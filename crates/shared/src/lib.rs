//! PlexMCP Shared Types and Utilities
//!
//! This crate contains types and errors shared between the PlexMCP server and its
//! realtime clients.

pub mod error;
pub mod types;

pub use error::*;
pub use types::*;
