//! Durable per-job URL membership, used to suppress re-crawling and re-reporting URLs that
//! already finished.

pub mod errors;
pub mod file;
pub mod memory;

pub use errors::DedupError;
pub use file::{FileDedupOpener, FileDedupStore};
pub use memory::{MemoryDedupOpener, MemoryDedupStore};

use crate::protocol::JobId;

pub type Result<T> = std::result::Result<T, DedupError>;

pub trait DedupStore: Send {
    /// Records `key`. Returns `false` if it was already present.
    fn insert(&mut self, key: &str) -> Result<bool>;

    fn has(&self, key: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opens the dedup store belonging to one job.
pub trait DedupOpener: Send {
    fn open(&self, job: &JobId) -> Result<Box<dyn DedupStore>>;
}
