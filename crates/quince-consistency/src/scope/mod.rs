//! Region scope registry
//!
//! Records the scope every distributed region was created with so that later
//! joiners either match it or are refused.

mod model;
mod registry;

pub use model::*;
pub use registry::*;
