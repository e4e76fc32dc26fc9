//! Shared types for sensim simulations.
//!
//! This crate defines the plain data structures that describe a run:
//! - Solver and sensitivity settings
//! - Model dimensions
//! - Experimental conditions (timepoints, parameters, constants)
//!
//! Everything here is serde-serializable so settings can be stored as JSON
//! next to a model and reloaded for batch runs.

mod conditions;
mod dimensions;
mod error;
mod settings;

pub use conditions::*;
pub use dimensions::*;
pub use error::*;
pub use settings::*;
