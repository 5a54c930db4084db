//! Job scheduling for Dockhand.
//!
//! Jobs enter a bounded queue, a dispatcher hands them to pipeline tasks
//! under a concurrency limit, and each pipeline drives one job from clone
//! to publish while streaming its log to subscribers.

pub mod cancel;
pub mod dispatcher;
pub mod logs;
pub mod pipeline;
pub mod queue;
pub mod service;

#[cfg(test)]
mod test_support;

pub use cancel::{CancelReason, CancellationHandle};
pub use dispatcher::{ActiveJobs, Dispatcher};
pub use logs::{JobLogger, LogBroadcaster, LogStream};
pub use pipeline::{Collaborators, Pipeline};
pub use queue::JobQueue;
pub use service::{BuildService, ServiceConfig, ServiceStats};
