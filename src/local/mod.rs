//! Local cache tier
//!
//! Defines the local store contract the remote tier depends on, plus a
//! JSON-snapshot implementation of it.

pub mod file_store;
pub mod store;

pub use file_store::FileActionCache;
pub use store::{ActionCache, LocalStore};
