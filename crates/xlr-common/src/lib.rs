//! XLR Common - shared types for the bonded ring data path
//!
//! This crate provides the primitives every ring flavour agrees on:
//! - Flow classification tuples
//! - Ring and bond configuration
//! - Error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod flow;

pub use config::*;
pub use error::*;
pub use flow::*;
