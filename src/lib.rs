//! runejail - pull a container image and run a command inside it
//!
//! The pipeline has two halves:
//!
//! - [`image`]: authenticate against the registry, resolve the manifest
//!   (collapsing a multi-arch index to one platform manifest) and unpack
//!   the layers, in order, into a root directory
//! - [`runtime`]: run a command with that directory as its root, as PID 1
//!   of a new PID namespace, and report its exit code

pub mod config;
pub mod error;
pub mod image;
pub mod runtime;

pub use config::Config;
pub use error::{JailError, Result};
