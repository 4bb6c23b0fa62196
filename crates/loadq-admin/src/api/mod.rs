//! Client side of the loadq server API

pub mod client;
pub mod endpoints;
pub mod types;

pub use client::AdminClient;
