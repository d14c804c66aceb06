//! The byte-level storage backend interface used by the registry.
//!
//! Drivers are assumed to provide atomic writes per key and read-after-write
//! consistency. Nothing here is transactional across keys.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
