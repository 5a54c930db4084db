//! Repository implementations.

pub mod job;

pub use job::MemoryJobRepo;
