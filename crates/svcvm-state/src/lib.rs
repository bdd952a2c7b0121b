//! svcvm-state: embedded binding store for hosting-device scheduling.
//!
//! Backed by [redb](https://docs.rs/redb), persists logical-resource
//! bindings, hosting-device agent bindings, hosted port bindings, config
//! agents, and the base L3 records (routers, floating IPs) whose mutations
//! must commit together with binding state changes.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{resource_id}:{port_id}`) enable prefix scans for
//! related records.
//!
//! Every logical operation runs inside exactly one transaction:
//! [`StateStore::write`] hands a [`StoreTxn`] to a closure and commits only
//! if the closure returns `Ok`. Nested helpers take the same `&StoreTxn`
//! instead of opening a transaction of their own. redb serializes write
//! transactions, which is what makes [`StoreTxn::compare_and_set_status`]
//! an atomic compare-and-set.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{ReadView, StateStore, StoreRead, StoreTxn};
pub use types::*;
