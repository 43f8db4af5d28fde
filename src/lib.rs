#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

/// The dictionary storage engine.
///
/// This module provides [`DictTable`], an open-addressing table with a flat
/// probe index over an append-only bucket list, lock-free reads, and
/// key-kind-adaptive hashing.
pub mod dict_table;

/// Dynamically-typed keys and their hash/equality strategies.
pub mod key;

#[cfg(feature = "stats")]
pub use dict_table::DictStats;
pub use dict_table::DictTable;
pub use dict_table::Iter;
pub use dict_table::WriteGuard;
pub use key::IdentityKey;
pub use key::Key;
pub use key::ObjectKey;
