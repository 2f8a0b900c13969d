//! HDF5 container: the binary layout of direct objects, read with
//! byte-range requests.
//!
//! Only the structures needed to walk groups, read attributes and decode
//! datasets are parsed. Object headers and global heaps are cached per
//! backend, so repeated navigation costs no extra requests.

mod backend;
mod btree;
mod dataset;
mod format;
mod heap;
mod messages;
mod object_header;
mod writer;

pub use backend::Hdf5Backend;
pub use format::HDF5_MAGIC;
pub use writer::*;
