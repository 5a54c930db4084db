//! Core domain types and traits for Dockhand.
//!
//! This crate contains:
//! - Job identifiers, descriptors, records and log entries
//! - The failure taxonomy and classification of tool output
//! - Collaborator traits (source control, image builder, templates, job storage)
//! - Project-file selection rules

pub mod error;
pub mod failure;
pub mod id;
pub mod image;
pub mod job;
pub mod output;
pub mod secret;
pub mod source;
pub mod store;
pub mod template;

pub use error::{Error, Result};
pub use id::JobId;
