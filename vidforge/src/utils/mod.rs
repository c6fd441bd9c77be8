//! Small helpers shared across the crate.

pub mod filename;
pub mod format;
pub mod http_client;

#[cfg(all(test, unix))]
pub(crate) mod testing;
