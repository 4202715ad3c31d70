//! Log backends.
//!
//! A backend is an opaque, append-only byte log. It knows nothing about
//! frames or records; [`crate::table::Table`] owns the format.
//!
//! # Invariants
//!
//! - `append` returns the offset where the data starts
//! - `read_all` returns exactly the bytes appended so far
//! - `replace` swaps the whole content atomically: a crash leaves either
//!   the old or the new content, never a mix
//! - backends must be `Send + Sync`

mod file;
mod memory;

pub use file::FileLog;
pub use memory::MemoryLog;

use crate::error::StoreResult;

/// An append-only byte log.
pub trait LogBackend: Send + Sync {
    /// Returns the whole log content.
    fn read_all(&self) -> StoreResult<Vec<u8>>;

    /// Appends data and returns the offset it was written at.
    fn append(&mut self, data: &[u8]) -> StoreResult<u64>;

    /// Pushes buffered writes to the OS.
    fn flush(&mut self) -> StoreResult<()>;

    /// Makes all appended data durable.
    fn sync(&mut self) -> StoreResult<()>;

    /// Returns the current size in bytes.
    fn size(&self) -> StoreResult<u64>;

    /// Cuts the log back to `new_size` bytes.
    ///
    /// Used to drop a torn frame at the tail after a crash.
    fn truncate(&mut self, new_size: u64) -> StoreResult<()>;

    /// Atomically replaces the whole log content.
    fn replace(&mut self, data: &[u8]) -> StoreResult<()>;
}
