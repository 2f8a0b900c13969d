//! Reference descriptors: a JSON manifest that maps Zarr v2 keys to inline
//! values or byte ranges of remote objects.
//!
//! ```text
//! {"refs": {
//!     ".zgroup": {"zarr_format": 2},
//!     "units/spike_times/.zarray": {...},
//!     "units/spike_times/0": ["https://.../blob", 1024, 4096]
//! }}
//! ```

mod backend;
mod manifest;
mod zarray;

pub use backend::*;
pub use manifest::*;
pub use zarray::*;
