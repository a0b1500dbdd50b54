// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cairn: distributed-memory style asynchronous RPC core.
//!
//! A fixed set of *ranks* (one thread each) exchange one-sided asynchronous
//! invocations and synchronize through collective barriers that drive all
//! in-flight messages to quiescence. On top of the messaging layer the crate
//! provides two subsystems:
//!
//! - [`sampling::AliasTable`]: constant-time weighted random sampling over a
//!   collection of weighted items scattered arbitrarily across ranks. The
//!   items are first rebalanced so every rank carries an equal share of the
//!   global weight, then compiled into per-rank alias tables per Walker/Vose.
//! - [`queue::WorkQueue`]: per-rank work queues whose contents drain through a
//!   user callback when the communicator reaches a barrier, with FIFO, LIFO,
//!   and priority ordering and support for recursive enqueue during the drain.
//!
//! Jobs are launched with [`comm::run`], which spawns one thread per rank and
//! hands each a [`Comm`]:
//!
//! ```rust
//! use cairn::comm;
//! use cairn::sampling::{AliasTable, Local};
//!
//! comm::run(4, |comm| {
//!     let items = vec![("heads".to_string(), 1.0), ("tails".to_string(), 3.0)];
//!     let table = AliasTable::new(comm, Local(items), Some(42)).unwrap();
//!     table.async_sample(|_comm, side| assert!(matches!(side.as_str(), "heads" | "tails")));
//!     comm.barrier();
//! });
//! ```

pub mod comm;
pub mod logging;
pub mod queue;
pub mod random;
pub mod sampling;

pub use comm::{Comm, Handle, Rank};
pub use queue::{FifoWorkQueue, LifoWorkQueue, PriorityWorkQueue, WorkQueue, WorkQueueRef};
pub use random::RankRng;
pub use sampling::{AliasTable, BuildError, WeightedItem};
