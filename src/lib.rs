//! Persistently cached, lazily recalculated record attributes.
//!
//! A cached attribute stores an expensive derived value next to its source
//! record, together with a "recalculation needed" flag and, optionally, an
//! expiration timestamp. This crate provides:
//! - [`CachedAttribute`]: per-attribute slot naming and policy
//! - [`Engine`]: the read / recalculate / flag-as-stale / expire state machine
//! - [`Dispatcher`]: the hand-off to an async executor, with an in-process
//!   tokio [`Worker`] implementation
//! - [`Store`]: slot storage, with SQLite and in-memory implementations

mod attribute;
mod dispatch;
mod engine;
mod expiration;
mod model;
mod record;
mod registry;
mod settings;
pub mod store;
mod value;
pub mod worker;

pub use attribute::{CachedAttribute, CachedAttributeBuilder};
pub use dispatch::{DispatchParams, Dispatcher, RecalculationJob};
pub use engine::Engine;
pub use expiration::{Expiration, Offset};
pub use model::Model;
pub use record::{ChangeSet, Record};
pub use registry::Registry;
pub use settings::Settings;
pub use store::{MemoryStore, SqliteStore, Store};
pub use value::{Value, ValueKind};
pub use worker::{ChannelDispatcher, Worker, WorkerHandle, WorkerStats};
