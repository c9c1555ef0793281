//! A copy-on-write, snapshot-capable storage core: a persistent B+-tree keyed by
//! compound keys, an extent allocator with reference-counted block management, and a
//! transaction manager tying them together (§1).

pub mod btree;
pub mod cache;
pub mod codec;
pub mod device;
pub mod error;
pub mod extent;
pub mod fs;
pub mod interval;
pub mod snapshot;
pub mod structures;
pub mod transaction;

pub use codec::Key;
pub use error::{BtrfsError, Result};
pub use fs::{mkfs, open_ctree, Filesystem};
