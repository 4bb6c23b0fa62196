//! loadq Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging setup, and error handling for the loadq workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`LoadqError`] and the crate-wide [`Result`] alias
//! - **Logging**: `tracing` subscriber configuration shared by every binary
//! - **Types**: load keys and execution names, the identifiers every other
//!   component uses to talk about a table load
//!
//! # Example
//!
//! ```no_run
//! use loadq_common::types::{ExecutionName, LoadKey};
//!
//! fn name_next_load() -> loadq_common::Result<()> {
//!     let key = LoadKey::new("dev", "orders")?;
//!     let name = ExecutionName::generate(&key);
//!     assert_eq!(name.load_key(), key);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{LoadqError, Result};
pub use types::{ExecutionName, LoadKey};
