//! pwakit core library
//!
//! This crate provides shared configuration, errors and the JSON wire types
//! exchanged between the cache controller and its pages.

pub mod config;
pub mod error;
pub mod types;

pub use config::{AppConfig, PageConfig, WorkerConfig};
pub use error::{PwaError, PwaResult};
pub use types::{PageMessage, VersionDescriptor, WorkerMessage};
