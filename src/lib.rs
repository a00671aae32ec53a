//! Append-only, time-partitioned storage for large sets of `(a, b)` pairs.
//!
//! A [`store::Store`] is an immutable, memory-mapped file holding a sorted,
//! doubly-indexed pair set: point lookups on either side and full-column
//! iteration both run directly against the mapping, with no decompression
//! pass. New data lands through an [`acc::Accumulator`] ring buffer; a
//! [`rotate::Rotator`] periodically drains it and merges store files up
//! through an hour/day/week/month hierarchy, expiring what falls outside the
//! retention horizon. A [`query::Query`] fans a lookup out across every
//! store file currently in a directory.
//!
//! None of these types take a lock around their hot path: the accumulator is
//! wait-free single-producer/single-consumer, stores are immutable once
//! stamped durable, and rotation serializes only against other rotators via
//! an advisory directory lock.

pub mod acc;
pub mod codec;
pub mod config;
pub mod dict;
pub mod error;
pub mod index;
pub mod query;
pub mod rotate;
pub mod rowset;
pub mod store;
pub mod varint;

pub use acc::{Accumulator, DrainReport};
pub use config::Options;
pub use error::{Error, Result};
pub use query::Query;
pub use rotate::Rotator;
pub use rowset::{Row, RowSet};
pub use store::{Column, Store};
