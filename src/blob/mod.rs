//! Blob storage for input files and task artifacts.

pub mod fs;
pub mod traits;

pub use fs::FsBlobStore;
pub use traits::{BlobReader, BlobRef, BlobStore};
