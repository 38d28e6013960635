//! Configuration types
//!
//! Board-agnostic configuration for the translator and the parameter
//! store. Boards usually build these from constants generated out of
//! their flash layout file.

pub mod types;

pub use types::*;
