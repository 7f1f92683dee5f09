//! Data layer: record types, hydrated views and the entity cache

pub mod cache;
pub mod models;

pub use cache::{CacheKey, EntityCache, KeyKind, Lookup};
pub use models::{Collection, EntityId};
