//! # genstore
//!
//! A deduplicating value store with generation-based reclamation, for
//! attribute dictionaries that are read concurrently with a single writer.
//!
//! ## Layers
//!
//! 1. **[`DataStore`]**: bump allocation into fixed-capacity buffers addressed
//!    by 32-bit [`EntryRef`]s, with a growth policy and hard capacity limits.
//! 2. **[`GenerationHandler`] + [`GenerationHoldList`]**: readers register
//!    under a generation; retired memory is only released once no reader of
//!    its retirement generation is left.
//! 3. **[`UniqueStore`]**: one reference counted entry per distinct value,
//!    found through an ordered [`UniqueStoreDictionary`].
//! 4. **[`EnumStore`]**: bulk load with ref count fix-up, three-step
//!    compaction and address space accounting.
//!
//! Readers never block and never take a lock on the data path. A read checks
//! the buffer slot's sequence counter around two atomic loads, then loads
//! the published length and reads memory.
//!
//! ## Example
//!
//! ```rust
//! use genstore::{BufferTypeConfig, GenerationHandler, UniqueStore};
//!
//! let mut handler = GenerationHandler::new();
//! let mut store: UniqueStore<String> = UniqueStore::new(BufferTypeConfig::default(), &handler).unwrap();
//! let reader = store.reader();
//!
//! let hello = store.add(&"hello".to_string()).unwrap().entry_ref;
//! store.commit(&mut handler);
//!
//! let guard = handler.take_guard();
//! assert_eq!(reader.get(hello, &guard), "hello");
//!
//! store.remove(hello);
//! store.commit(&mut handler);
//!
//! // Still readable: the guard predates the removal.
//! assert_eq!(reader.get(hello, &guard), "hello");
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

pub mod compaction;
pub mod config;
pub mod datastore;
pub mod dictionary;
pub mod encoding;
pub mod entry_ref;
pub mod enum_store;
pub mod error;
pub mod generation;
pub mod unique_store;

pub use compaction::{CompactionContext, CompactionMap};
pub use config::BufferTypeConfig;
pub use datastore::{AddressSpace, BufferIds, BufferStats, BufferStatus, DataStore, MemoryUsage};
pub use dictionary::{ChunkedDictionary, DictEntry, FrozenRefs, FrozenView, PostingDictionary, UniqueStoreDictionary};
pub use encoding::EnumValue;
pub use entry_ref::EntryRef;
pub use enum_store::EnumStore;
pub use error::{Result, StoreError};
pub use generation::{Generation, GenerationGuard, GenerationHandler, GenerationHoldList, GenerationReaders};
pub use unique_store::{AddResult, UniqueEntry, UniqueStore, UniqueStoreBuilder, UniqueStoreReader};

#[cfg(test)]
mod proptests;
