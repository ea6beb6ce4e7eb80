//! Shared output cache for Cachet.

mod cache;

pub use cache::OutputCache;
