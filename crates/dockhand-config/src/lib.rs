//! Configuration for Dockhand.
//!
//! This crate handles:
//! - System configuration (dockhand.kdl)
//! - Build-file templates and `${name}` placeholder interpolation

pub mod error;
pub mod system;
pub mod templates;

pub use error::{ConfigError, ConfigResult};
pub use system::{DockerConfig, GitConfig, SystemConfig, TemplateConfig, load_system_config, parse_system_config};
pub use templates::{DockerfileTemplates, interpolate};
