//! vmgrid-state — embedded state store for VMGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for compute sites, appliances, virtual machines, deployments,
//! funds, flavors, templates, port mappings, and billing logs.
//!
//! # Architecture
//!
//! Every record is JSON-serialized into a `u64`-keyed redb table. Ids are
//! drawn from a single monotonically increasing sequence, so id order is
//! creation order.
//!
//! [`StateStore::read`] and [`StateStore::write`] run a closure inside one
//! redb transaction. redb admits a single writer at a time, so any
//! read-modify-write done inside `write` (a fund debit, a deployment count
//! check) observes a consistent snapshot and commits atomically.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use registry::{RemovedVm, VmLoad, VmRegistry};
pub use store::{ReadTxn, Snapshot, StateStore, WriteTxn};
pub use tables::Record;
pub use types::*;
