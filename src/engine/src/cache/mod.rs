//! On-disk content-addressed blob cache.

mod blob_cache;

pub use blob_cache::{BlobCache, BlobEntry, PutOutcome};
