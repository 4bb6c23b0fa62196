//! Command implementations

pub mod bulk_load;
pub mod complete;
pub mod pending;
pub mod status;
