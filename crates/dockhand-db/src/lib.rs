//! Storage layer for Dockhand.
//!
//! Provides the in-memory [`JobRepository`](dockhand_core::store::JobRepository)
//! implementation used by the service.

pub mod error;
pub mod repo;

pub use error::{DbError, DbResult};
pub use repo::*;
