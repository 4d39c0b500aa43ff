//! Entity storage.

mod index;
mod store;

pub(crate) use store::STORE_MAGIC;
pub use store::EntityStore;
