//! gridp2p-nodelocal — node-scoped concurrent key/value store.
//!
//! Each grid node owns one [`NodeLocalStore`]. Any component running on the
//! node can park state in it without coordinating with other nodes; the
//! deployment core keeps its resource lifecycle counters here.
//!
//! # Concurrency
//!
//! The store is backed by a [`dashmap::DashMap`], so operations lock only
//! the shard holding the key. `get`, `put_if_absent`, and
//! `compare_and_replace` are each atomic with respect to one another.
//! Multi-key transactions are not supported. Counters are built on top
//! with an optimistic compare-and-replace retry loop
//! ([`NodeLocalStore::increment`]).
//!
//! The store is `Clone` + `Send` + `Sync` (backed by `Arc<DashMap>`) and can
//! be shared across threads.

pub mod store;

pub use store::NodeLocalStore;
