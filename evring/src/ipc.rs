//! Cross-process backing for pages and event tables.

pub mod shmem;
