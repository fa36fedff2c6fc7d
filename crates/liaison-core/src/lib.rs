/*!
 * Liaison Core
 *
 * Shared foundation for the Liaison crates: the error type, layered
 * configuration, logging setup, the dynamic [`types::Value`] exchanged with
 * remote callers, and helpers for running blocking device I/O.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod types;
pub mod utils;

pub use error::{Error, Result};

/// Liaison core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
