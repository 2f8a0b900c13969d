//! Hierarchical container view and its two byte layouts.
//!
//! - `view`: lazy node arena over any [`ContainerBackend`]
//! - [`hdf5`]: HDF5 files read with byte-range requests (direct objects)
//! - [`refs`]: JSON reference descriptors pointing into remote objects

mod array;
mod codec;
mod grid;
pub mod hdf5;
pub mod refs;
mod view;

pub use array::*;
pub use codec::*;
pub use grid::*;
pub use view::*;
