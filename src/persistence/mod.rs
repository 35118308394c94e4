//! The `persistence` module backs the optional last-message cache.
//!
//! Only the most recent message of each topic is kept; the broker does not
//! retain message history. Storage is a `sled` tree keyed by topic path.

pub mod sled_store;

pub use sled_store::MessageStore;
