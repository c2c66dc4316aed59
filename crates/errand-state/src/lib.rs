//! errand-state — embedded state store for the errand director.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for deployment records, tasks, resource pool accounting, and the
//! instance records an errand run provisions.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{deployment}/{job}/{index}`) enable prefix scans for the
//! instances that belong to one job.
//!
//! Pool accounting is only ever changed by deltas ([`StateStore::grow_pools`],
//! [`StateStore::shrink_pools`]) so concurrent runs against unrelated jobs
//! that share a pool commute.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
