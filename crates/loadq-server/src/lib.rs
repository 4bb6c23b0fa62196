//! loadq Server Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Serializes warehouse loads per `(database, table)`: one load runs at a time,
//! requests arriving meanwhile are queued and folded into the next load.
//!
//! # Overview
//!
//! - **Tracker**: the [`tracker::StateStore`] trait with PostgreSQL and
//!   in-memory backends; every mutation is a conditional write
//! - **Coordinator**: the per-key state machine (admit, enqueue, coalesce,
//!   complete and promote)
//! - **Dispatcher**: manifests, loader config, SQL rendering and warehouse
//!   submission around the coordinator
//! - **API**: axum routes for notifications, completion events and operator
//!   actions
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use loadq_common::LoadKey;
//! use loadq_server::coordinator::{Admission, LoadCoordinator, LoadRequest};
//! use loadq_server::tracker::{MemoryStateStore, PayloadRef};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let coordinator = LoadCoordinator::new(Arc::new(MemoryStateStore::new()));
//! let key = LoadKey::new("dev", "orders")?;
//! let request = LoadRequest::new(key, PayloadRef::new("manifests", "orders/a"), "queue");
//!
//! if let Admission::Admitted(name) = coordinator.begin_or_enqueue(&request).await? {
//!     println!("dispatch {}", name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod loader_config;
pub mod manifest;
pub mod middleware;
pub mod notifications;
pub mod sql;
pub mod storage;
pub mod tracker;
pub mod warehouse;

// Re-export commonly used types
pub use error::AppError;
