//! Utility types shared by every layer:
//! - [`DataType`] - element types parsed from numpy type strings
//! - [`Error`] / [`Result`] - error handling

mod dtype;
mod error;

pub use dtype::*;
pub use error::*;
